//! End-to-end tests of the agent message loop against scripted providers
//! and the in-memory store.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engram_audit::{AuditConfig, AuditSink};
use engram_core::{AgentEngine, CreateAgentRequest, EngineConfig, MemoryBlockSeed};
use engram_jobs::JobManager;
use engram_memory::{EmbeddingProvider, FileIngestor, HashEmbeddingProvider, PassageManager};
use engram_memory::BatchEmbedder;
use engram_provider::{
    ContentBlock, LlmProvider, LlmRequest, LlmResponse, ScriptedProvider, StreamChunk,
};
use engram_schema::{
    Actor, EmbeddingConfig, EngramError, InboundMessage, JobStatus, JobType, Job, LlmConfig,
    MessageRole, Result, StopReasonKind, StreamEvent, TurnRequest,
};
use engram_store::{Page, Store, VectorStore};
use futures_core::Stream;
use tempfile::TempDir;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const DIMS: usize = 16;

struct Fixture {
    engine: AgentEngine,
    actor: Actor,
    provider: ScriptedProvider,
    _audit_dir: TempDir,
}

async fn fixture_with_config(config: EngineConfig) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let vector = VectorStore::new(store.clone()).await.unwrap();
    let passages = PassageManager::new(store.clone(), vector);
    let audit_dir = TempDir::new().unwrap();
    let audit = AuditSink::open(AuditConfig::new(audit_dir.path())).unwrap();
    let provider = ScriptedProvider::new();
    let engine = AgentEngine::new(
        store.clone(),
        passages,
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        Arc::new(provider.clone()),
        JobManager::new(store),
        audit,
        config,
    );
    Fixture {
        engine,
        actor: Actor::new("user-1", "org-1"),
        provider,
        _audit_dir: audit_dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with_config(EngineConfig::default()).await
}

async fn make_agent(fixture: &Fixture) -> String {
    fixture
        .engine
        .create_agent(
            CreateAgentRequest {
                name: Some("test-agent".into()),
                memory_blocks: vec![
                    MemoryBlockSeed {
                        label: "persona".into(),
                        value: "concise assistant".into(),
                        limit: None,
                    },
                    MemoryBlockSeed {
                        label: "user_facts".into(),
                        value: String::new(),
                        limit: None,
                    },
                ],
                llm_config: LlmConfig::new("test-model"),
                embedding_config: EmbeddingConfig::new("hash-embedder", DIMS),
                tool_names: None,
                source_ids: None,
                top_k: None,
            },
            &fixture.actor,
        )
        .await
        .unwrap()
        .id
}

fn user_turn(agent_id: &str, text: &str) -> TurnRequest {
    TurnRequest {
        agent_id: agent_id.to_string(),
        messages: vec![InboundMessage {
            role: MessageRole::User,
            content: text.to_string(),
        }],
        stream: false,
        include_types: None,
    }
}

#[tokio::test]
async fn plain_turn_persists_and_answers() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.provider.push_text("hello back");

    let response = f
        .engine
        .send_message(
            user_turn(&agent_id, "hello"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.stop_reason.kind, StopReasonKind::EndTurn);
    assert_eq!(response.usage.step_count, 1);
    assert_eq!(response.messages.len(), 2);
    assert_eq!(response.messages[0].role, MessageRole::User);
    assert_eq!(response.messages[1].role, MessageRole::Assistant);
    assert_eq!(response.messages[1].content, "hello back");

    // durable, ordered history
    let history = f
        .engine
        .store()
        .list_messages(&agent_id, &f.actor, Page::ascending(10), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at < history[1].created_at);
}

#[tokio::test]
async fn tool_call_loop_edits_core_memory() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;

    // Scenario: the model saves a fact, then answers from it next turn.
    f.provider.push_tool_call(
        "core_memory_append",
        serde_json::json!({ "label": "user_facts", "value": "favorite color: green" }),
    );
    f.provider.push_text("Noted, I'll remember that.");

    let first = f
        .engine
        .send_message(
            user_turn(&agent_id, "Remember that my favorite color is green."),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(first.stop_reason.kind, StopReasonKind::EndTurn);
    assert_eq!(first.usage.step_count, 2);

    let block = f
        .engine
        .store()
        .get_memory_block(&agent_id, "user_facts", &f.actor)
        .await
        .unwrap();
    assert!(block.value.contains("favorite color: green"));

    // roles in order: user, assistant(tool call), tool, assistant
    let roles: Vec<MessageRole> = first.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );

    f.provider.push_text("Your favorite color is green.");
    let second = f
        .engine
        .send_message(
            user_turn(&agent_id, "What is my favorite color?"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(second.messages.last().unwrap().content.contains("green"));
}

#[tokio::test]
async fn archival_insert_tool_creates_passage() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.provider.push_tool_call(
        "archival_memory_insert",
        serde_json::json!({ "text": "the deploy password is stored in the vault" }),
    );
    f.provider.push_text("Stored.");

    f.engine
        .send_message(
            user_turn(&agent_id, "remember where the deploy password lives"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        f.engine
            .passages()
            .agent_passage_size(&f.actor, Some(&agent_id))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn max_steps_bounds_tool_loop() {
    let f = fixture_with_config(EngineConfig {
        max_steps: 1,
        ..EngineConfig::default()
    })
    .await;
    let agent_id = make_agent(&f).await;
    // A tool-call-only response with max_steps=1 stops after one LLM call.
    f.provider.push_tool_call(
        "archival_memory_search",
        serde_json::json!({ "query": "anything" }),
    );

    let response = f
        .engine
        .send_message(
            user_turn(&agent_id, "loop forever"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.stop_reason.kind, StopReasonKind::MaxSteps);
    assert_eq!(response.usage.step_count, 1);
    assert_eq!(f.provider.remaining(), 0);
}

#[tokio::test]
async fn unattached_tool_surfaces_as_tool_error_message() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.provider
        .push_tool_call("launch_rockets", serde_json::json!({}));
    f.provider.push_text("I cannot do that.");

    let response = f
        .engine
        .send_message(
            user_turn(&agent_id, "do something forbidden"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let tool_message = response
        .messages
        .iter()
        .find(|m| m.role == MessageRole::Tool)
        .expect("tool message");
    assert!(tool_message.content.contains("not attached"));
    assert_eq!(response.stop_reason.kind, StopReasonKind::EndTurn);
}

#[tokio::test]
async fn missing_agent_is_not_found() {
    let f = fixture().await;
    let err = f
        .engine
        .send_message(
            user_turn("agent-missing", "hi"),
            &f.actor,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn deleted_agent_is_failed_precondition() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.engine.delete_agent(&agent_id, &f.actor).await.unwrap();

    let err = f
        .engine
        .send_message(user_turn(&agent_id, "hi"), &f.actor, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "failed_precondition");
}

#[tokio::test]
async fn stream_ends_with_stop_reason_then_usage() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.provider.push_text("streamed reply here");

    let mut request = user_turn(&agent_id, "stream please");
    request.stream = true;
    let mut stream = f
        .engine
        .send_message_stream(request, &f.actor, CancellationToken::new())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    assert!(events.len() >= 3);
    let n = events.len();
    match &events[n - 2] {
        StreamEvent::StopReason { stop_reason } => {
            assert_eq!(stop_reason.kind, StopReasonKind::EndTurn)
        }
        other => panic!("expected stop_reason, got {other:?}"),
    }
    match &events[n - 1] {
        StreamEvent::Usage { usage } => assert_eq!(usage.step_count, 1),
        other => panic!("expected usage, got {other:?}"),
    }

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::AssistantMessage { delta, .. } => Some(delta.clone()),
            _ => None,
        })
        .collect();
    assert!(text.contains("streamed reply"));
}

/// Streams one word every few milliseconds, so a cancellation reliably
/// lands mid-message.
struct PacedStreamProvider;

#[async_trait]
impl LlmProvider for PacedStreamProvider {
    async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
        Err(EngramError::invalid_argument("stream only"))
    }

    async fn stream(
        &self,
        _request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let stream = async_stream_words(&[
            "one ", "two ", "three ", "four ", "five ", "six ", "seven ", "eight ",
        ]);
        Ok(Box::pin(stream))
    }
}

fn async_stream_words(
    words: &'static [&'static str],
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    tokio_stream::StreamExt::then(tokio_stream::iter(words.iter()), |word| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(StreamChunk {
            delta: word.to_string(),
            is_final: false,
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
            content_blocks: vec![],
        })
    })
}

#[tokio::test]
async fn streaming_cancellation_persists_partial_once() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;

    let store = f.engine.store().clone();
    let vector = VectorStore::new(store.clone()).await.unwrap();
    let passages = PassageManager::new(store.clone(), vector);
    let audit_dir = TempDir::new().unwrap();
    let audit = AuditSink::open(AuditConfig::new(audit_dir.path())).unwrap();
    let engine = AgentEngine::new(
        store.clone(),
        passages,
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        Arc::new(PacedStreamProvider),
        JobManager::new(store),
        audit,
        EngineConfig::default(),
    );

    let cancel = CancellationToken::new();
    let mut request = user_turn(&agent_id, "talk");
    request.stream = true;
    let mut stream = engine
        .send_message_stream(request, &f.actor, cancel.clone())
        .await
        .unwrap();

    // cancel after the first assistant delta
    let mut saw_delta = false;
    let mut last_events = Vec::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::AssistantMessage { .. } = &event {
            if !saw_delta {
                saw_delta = true;
                cancel.cancel();
            }
        }
        last_events.push(event);
    }
    assert!(saw_delta);
    let stop = last_events
        .iter()
        .find_map(|e| match e {
            StreamEvent::StopReason { stop_reason } => Some(stop_reason.clone()),
            _ => None,
        })
        .expect("stream ends with stop_reason");
    assert_eq!(stop.kind, StopReasonKind::Cancelled);

    // exactly one partial assistant message persisted
    let assistants = engine
        .store()
        .list_messages(
            &agent_id,
            &f.actor,
            Page::ascending(10),
            Some(MessageRole::Assistant),
        )
        .await
        .unwrap();
    assert_eq!(assistants.len(), 1);
    assert!(!assistants[0].content.is_empty());
    assert!(assistants[0].content.len() < "one two three four five six seven eight ".len());
    assert!("one two three four five six seven eight ".starts_with(&assistants[0].content));
}

struct FailingProvider;

#[async_trait]
impl LlmProvider for FailingProvider {
    async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
        Err(EngramError::unavailable("provider down"))
    }

    async fn stream(
        &self,
        _request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        Err(EngramError::unavailable("provider down"))
    }
}

#[tokio::test]
async fn provider_failure_sets_llm_error_and_keeps_user_message() {
    let store = Store::open_in_memory().unwrap();
    let vector = VectorStore::new(store.clone()).await.unwrap();
    let passages = PassageManager::new(store.clone(), vector);
    let audit_dir = TempDir::new().unwrap();
    let audit = AuditSink::open(AuditConfig::new(audit_dir.path())).unwrap();
    let engine = AgentEngine::new(
        store.clone(),
        passages,
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        Arc::new(FailingProvider),
        JobManager::new(store.clone()),
        audit,
        EngineConfig::default(),
    );
    let actor = Actor::new("user-1", "org-1");
    let agent = engine
        .create_agent(
            CreateAgentRequest {
                name: None,
                memory_blocks: vec![],
                llm_config: LlmConfig::new("m"),
                embedding_config: EmbeddingConfig::new("hash-embedder", DIMS),
                tool_names: None,
                source_ids: None,
                top_k: None,
            },
            &actor,
        )
        .await
        .unwrap();

    let response = engine
        .send_message(user_turn(&agent.id, "hi"), &actor, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.stop_reason.kind, StopReasonKind::LlmError);

    // the inbound user message survived the failure
    let history = store
        .list_messages(&agent.id, &actor, Page::ascending(10), None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, MessageRole::User);
}

#[tokio::test]
async fn concurrent_turn_rejected_when_configured() {
    let f = fixture_with_config(EngineConfig {
        reject_concurrent_turns: true,
        ..EngineConfig::default()
    })
    .await;
    let agent_id = make_agent(&f).await;

    struct SlowProvider;
    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(LlmResponse {
                text: "slow".into(),
                content: vec![ContentBlock::Text { text: "slow".into() }],
                input_tokens: Some(1),
                output_tokens: Some(1),
                stop_reason: Some("end_turn".into()),
            })
        }
    }

    // rebuild the engine with the slow provider, sharing the store
    let store = f.engine.store().clone();
    let vector = VectorStore::new(store.clone()).await.unwrap();
    let passages = PassageManager::new(store.clone(), vector);
    let audit_dir = TempDir::new().unwrap();
    let audit = AuditSink::open(AuditConfig::new(audit_dir.path())).unwrap();
    let engine = AgentEngine::new(
        store.clone(),
        passages,
        Arc::new(HashEmbeddingProvider::new(DIMS)),
        Arc::new(SlowProvider),
        JobManager::new(store),
        audit,
        EngineConfig {
            reject_concurrent_turns: true,
            ..EngineConfig::default()
        },
    );

    let first = {
        let engine = engine.clone();
        let actor = f.actor.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            engine
                .send_message(user_turn(&agent_id, "first"), &actor, CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = engine
        .send_message(user_turn(&agent_id, "second"), &f.actor, CancellationToken::new())
        .await;
    assert_eq!(second.unwrap_err().code(), "conflict");
    assert!(first.await.unwrap().is_ok());
}

/// Replies with the retrieved-context section of the system prompt, which
/// makes retrieval observable end to end.
struct ContextEchoProvider;

#[async_trait]
impl LlmProvider for ContextEchoProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let system = request.system.unwrap_or_default();
        let text = match system.find("<retrieved_context") {
            Some(pos) => format!("Based on my sources: {}", &system[pos..]),
            None => "I found no context.".to_string(),
        };
        Ok(LlmResponse {
            text: text.clone(),
            content: vec![ContentBlock::Text { text }],
            input_tokens: Some(5),
            output_tokens: Some(5),
            stop_reason: Some("end_turn".into()),
        })
    }
}

#[tokio::test]
async fn ingest_then_retrieve_reaches_the_prompt() {
    let store = Store::open_in_memory().unwrap();
    let vector = VectorStore::new(store.clone()).await.unwrap();
    let passages = PassageManager::new(store.clone(), vector);
    let audit_dir = TempDir::new().unwrap();
    let audit = AuditSink::open(AuditConfig::new(audit_dir.path())).unwrap();
    let embedder = Arc::new(HashEmbeddingProvider::new(DIMS));
    let engine = AgentEngine::new(
        store.clone(),
        passages.clone(),
        embedder.clone(),
        Arc::new(ContextEchoProvider),
        JobManager::new(store.clone()),
        audit.clone(),
        EngineConfig::default(),
    );
    let actor = Actor::new("user-1", "org-1");

    // create a source and ingest one sentence
    let now = chrono::Utc::now();
    let source = engram_schema::Source {
        id: engram_schema::new_id(engram_schema::id_prefix::SOURCE),
        organization_id: "org-1".into(),
        name: "sky-facts".into(),
        embedding_config: EmbeddingConfig::new("hash-embedder", DIMS),
        created_at: now,
        updated_at: now,
        is_deleted: false,
        created_by: None,
    };
    store.insert_source(source.clone(), &actor).await.unwrap();
    let ingestor = FileIngestor::new(passages, Arc::new(BatchEmbedder::new(embedder)));
    let outcome = ingestor
        .ingest_file(&source, "sky.txt", Some("text/plain"), b"The sky is blue.", &actor)
        .await
        .unwrap();
    assert_eq!(outcome.passage_count, 1);

    // agent with the source attached
    let agent = engine
        .create_agent(
            CreateAgentRequest {
                name: Some("asker".into()),
                memory_blocks: vec![],
                llm_config: LlmConfig::new("m"),
                embedding_config: EmbeddingConfig::new("hash-embedder", DIMS),
                tool_names: None,
                source_ids: None,
                top_k: None,
            },
            &actor,
        )
        .await
        .unwrap();
    engine.attach_source(&agent.id, &source.id, &actor).await.unwrap();

    let response = engine
        .send_message(
            user_turn(&agent.id, "What color is the sky?"),
            &actor,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let answer = &response.messages.last().unwrap().content;
    assert!(answer.contains("blue"), "answer was: {answer}");

    // one RAG_SEARCH audit event for the turn
    assert!(audit.flush(Duration::from_secs(5)));
    let query = engram_audit::AuditQuery::new(audit.config().db_path());
    let searches = query
        .list_events(
            engram_audit::EventFilter {
                event_type: Some(engram_audit::AuditEventType::RagSearch),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(searches.len(), 1);
    assert!(searches[0].success);
}

#[tokio::test]
async fn turn_with_job_records_usage_and_messages() {
    let f = fixture().await;
    let agent_id = make_agent(&f).await;
    f.provider.push_text("done");

    let job = f
        .engine
        .jobs()
        .create_job(Job::new(&f.actor, JobType::Run))
        .await
        .unwrap();

    let response = f
        .engine
        .send_message_with_job(
            user_turn(&agent_id, "work"),
            &f.actor,
            CancellationToken::new(),
            Some(job.id.clone()),
        )
        .await
        .unwrap();
    assert_eq!(response.stop_reason.kind, StopReasonKind::EndTurn);

    let usage = f.engine.jobs().get_job_usage(&job.id, &f.actor).await.unwrap();
    assert_eq!(usage.step_count, 1);
    assert_eq!(usage.total_tokens, response.usage.total_tokens);

    let messages = f
        .engine
        .jobs()
        .get_job_messages(&job.id, &f.actor, Page::ascending(10), None)
        .await
        .unwrap();
    assert_eq!(messages.len(), response.messages.len());

    // jobs stay idempotent on repeated terminal transitions
    let first = f
        .engine
        .jobs()
        .safe_update_status(&job.id, JobStatus::Completed, &f.actor)
        .await
        .unwrap();
    assert!(first.was_applied());
}
