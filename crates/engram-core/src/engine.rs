//! The agent message loop: compose context, call the model, dispatch tool
//! calls, persist messages, and emit either a collected response or a
//! stream of typed chunks.
//!
//! Ordering: within one turn every message is persisted before the chunk
//! that announces it, and messages carry strictly increasing timestamps so
//! `(created_at, id)` reproduces the turn order. Turns on one agent are
//! serialized by a per-agent lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use engram_audit::{AuditEventType, AuditLevel, AuditSink, EventDraft};
use engram_jobs::JobManager;
use engram_memory::{EmbeddingProvider, PassageManager, SearchScope};
use engram_provider::{
    retry_with_backoff, ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse,
    RetryConfig,
};
use engram_schema::{
    default_block_limit, id_prefix, new_id, Actor, Agent, EmbeddingConfig, EngramError, LlmConfig,
    MemoryBlock, Message, MessageRole, Result, StopReason, StopReasonKind, StreamEvent, ToolCall,
    TurnRequest, TurnResponse, UsageStats,
};
use engram_store::{Page, Store};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::{build_system_prompt, RetrievedContext};
use crate::memory_tools::{register_builtin_tools, BUILTIN_TOOL_NAMES};
use crate::session_lock::SessionLockManager;
use crate::tool::{ToolContext, ToolRegistry};

const HISTORY_WINDOW: usize = 50;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MemoryBlockSeed {
    pub label: String,
    pub value: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    pub name: Option<String>,
    pub memory_blocks: Vec<MemoryBlockSeed>,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    pub tool_names: Option<Vec<String>>,
    pub source_ids: Option<Vec<String>>,
    pub top_k: Option<usize>,
}

struct EngineInner {
    store: Store,
    passages: PassageManager,
    embedder: Arc<dyn EmbeddingProvider>,
    provider: Arc<dyn LlmProvider>,
    jobs: JobManager,
    audit: AuditSink,
    config: EngineConfig,
    locks: SessionLockManager,
    tools: ToolRegistry,
    retry: RetryConfig,
}

#[derive(Clone)]
pub struct AgentEngine {
    inner: Arc<EngineInner>,
}

impl AgentEngine {
    pub fn new(
        store: Store,
        passages: PassageManager,
        embedder: Arc<dyn EmbeddingProvider>,
        provider: Arc<dyn LlmProvider>,
        jobs: JobManager,
        audit: AuditSink,
        config: EngineConfig,
    ) -> Self {
        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools);
        Self {
            inner: Arc::new(EngineInner {
                store,
                passages,
                embedder,
                provider,
                jobs,
                audit,
                config,
                locks: SessionLockManager::new(),
                tools,
                retry: RetryConfig::default(),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn passages(&self) -> &PassageManager {
        &self.inner.passages
    }

    pub fn jobs(&self) -> &JobManager {
        &self.inner.jobs
    }

    pub fn audit(&self) -> &AuditSink {
        &self.inner.audit
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================
    // Agent management
    // ========================================================

    pub async fn create_agent(
        &self,
        request: CreateAgentRequest,
        actor: &Actor,
    ) -> Result<Agent> {
        let now = Utc::now();
        let agent = Agent {
            id: new_id(id_prefix::AGENT),
            organization_id: actor.organization_id.clone(),
            name: request.name.unwrap_or_else(|| "agent".to_string()),
            tool_names: request.tool_names.unwrap_or_else(|| {
                BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect()
            }),
            source_ids: request.source_ids.unwrap_or_default(),
            llm_config: request.llm_config,
            embedding_config: request.embedding_config,
            top_k: request.top_k,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: Some(actor.id.clone()),
            updated_by: Some(actor.id.clone()),
        };
        let blocks: Vec<MemoryBlock> = request
            .memory_blocks
            .into_iter()
            .map(|seed| MemoryBlock {
                id: new_id(id_prefix::BLOCK),
                organization_id: actor.organization_id.clone(),
                agent_id: agent.id.clone(),
                label: seed.label,
                value: seed.value,
                limit: seed.limit.unwrap_or_else(default_block_limit),
                created_at: now,
                updated_at: now,
                is_deleted: false,
            })
            .collect();

        let created = self.inner.store.insert_agent(agent, blocks, actor).await?;
        self.inner.audit.log(
            EventDraft::new(AuditEventType::AgentCreation, AuditLevel::Info, "create agent")
                .user(actor.id.as_str())
                .resource(created.id.as_str()),
        );
        Ok(created)
    }

    pub async fn get_agent(&self, agent_id: &str, actor: &Actor) -> Result<Agent> {
        self.inner.store.get_agent(agent_id, actor).await
    }

    pub async fn list_agents(&self, actor: &Actor, page: Page) -> Result<Vec<Agent>> {
        self.inner.store.list_agents(actor, page).await
    }

    pub async fn list_memory_blocks(
        &self,
        agent_id: &str,
        actor: &Actor,
    ) -> Result<Vec<MemoryBlock>> {
        self.inner.store.list_memory_blocks(agent_id, actor).await
    }

    /// Cascade: soft-delete the agent, drop its blocks, and hard-delete its
    /// archival passages (with their vector rows). Source passages survive.
    pub async fn delete_agent(&self, agent_id: &str, actor: &Actor) -> Result<()> {
        self.inner.store.soft_delete_agent(agent_id, actor).await?;
        self.inner.passages.delete_agent_passages(agent_id, actor).await?;
        Ok(())
    }

    pub async fn attach_source(
        &self,
        agent_id: &str,
        source_id: &str,
        actor: &Actor,
    ) -> Result<()> {
        // Dimension compatibility is pinned at attach time.
        let agent = self.inner.store.get_agent(agent_id, actor).await?;
        let source = self.inner.store.get_source(source_id, actor).await?;
        if agent.embedding_config.dim != source.embedding_config.dim {
            return Err(EngramError::invalid_argument(format!(
                "source {} embeds at {} dims, agent {} at {}",
                source_id, source.embedding_config.dim, agent_id, agent.embedding_config.dim
            )));
        }
        self.inner
            .store
            .attach_source_to_agent(agent_id, source_id, actor)
            .await
    }

    // ========================================================
    // Message loop
    // ========================================================

    pub async fn send_message(
        &self,
        request: TurnRequest,
        actor: &Actor,
        cancel: CancellationToken,
    ) -> Result<TurnResponse> {
        self.send_message_with_job(request, actor, cancel, None).await
    }

    pub async fn send_message_with_job(
        &self,
        request: TurnRequest,
        actor: &Actor,
        cancel: CancellationToken,
        job_id: Option<String>,
    ) -> Result<TurnResponse> {
        let mut emitter = Emitter::Collect(Vec::new());
        let outcome =
            run_turn(&self.inner, request, actor.clone(), cancel, job_id, &mut emitter).await?;
        Ok(TurnResponse {
            messages: outcome.messages,
            stop_reason: outcome.stop_reason,
            usage: outcome.usage,
        })
    }

    /// Start a streaming turn. The returned stream yields typed chunks and
    /// always ends with a `stop_reason` then a `usage` event, also when the
    /// turn fails mid-flight.
    pub async fn send_message_stream(
        &self,
        request: TurnRequest,
        actor: &Actor,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<StreamEvent>> {
        // Surface missing/deleted agents as request errors, not in-stream.
        let agent = self.inner.store.get_agent_any(&request.agent_id, actor).await?;
        if agent.is_deleted {
            return Err(EngramError::failed_precondition(format!(
                "agent {} is deleted",
                agent.id
            )));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let inner = Arc::clone(&self.inner);
        let actor = actor.clone();
        tokio::spawn(async move {
            let mut emitter = Emitter::Channel(tx);
            if let Err(e) = run_turn(&inner, request, actor, cancel, None, &mut emitter).await {
                // The stream must end cleanly even on hard failures.
                let kind = match &e {
                    EngramError::DeadlineExceeded => StopReasonKind::Timeout,
                    EngramError::Cancelled => StopReasonKind::Cancelled,
                    _ => StopReasonKind::LlmError,
                };
                emitter
                    .finish(StopReason::with_detail(kind, e.code()), UsageStats::default())
                    .await;
            }
        });
        Ok(ReceiverStream::new(rx))
    }
}

// ============================================================
// Turn internals
// ============================================================

enum Emitter {
    Collect(Vec<StreamEvent>),
    Channel(mpsc::Sender<StreamEvent>),
}

impl Emitter {
    /// Send one event. Returns false when the consumer is gone, which the
    /// turn treats as client cancellation.
    async fn emit(&mut self, event: StreamEvent, include_types: &Option<Vec<String>>) -> bool {
        if !event.is_terminal() {
            if let Some(types) = include_types {
                if !types.iter().any(|t| t == event.type_name()) {
                    return true;
                }
            }
        }
        match self {
            Emitter::Collect(events) => {
                events.push(event);
                true
            }
            Emitter::Channel(tx) => tx.send(event).await.is_ok(),
        }
    }

    async fn finish(&mut self, stop_reason: StopReason, usage: UsageStats) {
        let _ = self
            .emit(StreamEvent::StopReason { stop_reason }, &None)
            .await;
        let _ = self.emit(StreamEvent::Usage { usage }, &None).await;
    }

    fn is_streaming(&self) -> bool {
        matches!(self, Emitter::Channel(_))
    }
}

struct TurnOutcome {
    messages: Vec<Message>,
    stop_reason: StopReason,
    usage: UsageStats,
}

/// Monotonic timestamps inside one turn so `(created_at, id)` ordering
/// matches emission order even within a millisecond.
struct TurnClock {
    last: DateTime<Utc>,
}

impl TurnClock {
    fn new() -> Self {
        Self { last: Utc::now() }
    }

    fn next(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = if now > self.last {
            now
        } else {
            self.last + TimeDelta::milliseconds(1)
        };
        self.last = ts;
        ts
    }
}

async fn run_turn(
    inner: &Arc<EngineInner>,
    request: TurnRequest,
    actor: Actor,
    cancel: CancellationToken,
    job_id: Option<String>,
    emitter: &mut Emitter,
) -> Result<TurnOutcome> {
    let started = Instant::now();

    let _guard = if inner.config.reject_concurrent_turns {
        inner.locks.try_acquire(&request.agent_id)?
    } else {
        inner.locks.acquire(&request.agent_id).await
    };

    let agent = inner.store.get_agent_any(&request.agent_id, &actor).await?;
    if agent.is_deleted {
        return Err(EngramError::failed_precondition(format!(
            "agent {} is deleted",
            agent.id
        )));
    }

    let include_types = request.include_types.clone();
    let mut clock = TurnClock::new();
    let mut turn_messages: Vec<Message> = Vec::new();
    let mut usage = UsageStats::default();

    // Step 2: persist the inbound messages, then echo them.
    let mut inbound = Vec::new();
    for m in &request.messages {
        let mut message = Message::new(&agent.id, &actor, m.role, m.content.clone());
        message.created_at = clock.next();
        message.updated_at = message.created_at;
        inbound.push(message);
    }
    let inbound = inner.store.insert_many_messages(inbound).await?;
    for message in &inbound {
        turn_messages.push(message.clone());
        let delivered = emitter
            .emit(
                StreamEvent::UserMessage {
                    id: message.id.clone(),
                    date: message.created_at,
                    content: message.content.clone(),
                },
                &include_types,
            )
            .await;
        if !delivered {
            return finish_turn(
                inner, emitter, &agent, &actor, turn_messages, usage,
                StopReason::of(StopReasonKind::Cancelled), started, job_id,
            )
            .await;
        }
    }

    // Steps 3-4: system prompt from memory blocks plus retrieval.
    let blocks = inner.store.list_memory_blocks(&agent.id, &actor).await?;
    let retrieved = retrieve_context(inner, &agent, &request, &actor).await?;
    let system_prompt = build_system_prompt(&agent, &blocks, &retrieved);

    // History window, oldest first; includes the inbound messages above.
    let mut history = inner
        .store
        .list_messages(&agent.id, &actor, Page::descending(HISTORY_WINDOW), None)
        .await?;
    history.reverse();
    let mut llm_history: Vec<LlmMessage> = history.iter().map(to_llm_message).collect();

    let tool_defs = inner.tools.definitions_for(&agent.tool_names);
    let tool_ctx = ToolContext {
        agent: agent.clone(),
        actor: actor.clone(),
        store: inner.store.clone(),
        passages: inner.passages.clone(),
        embedder: Arc::clone(&inner.embedder),
    };

    // Steps 5-6: the model/tool loop, bounded by max_steps.
    let mut stop_reason: Option<StopReason> = None;
    for _step in 0..inner.config.max_steps {
        if cancel.is_cancelled() {
            stop_reason = Some(StopReason::of(StopReasonKind::Cancelled));
            break;
        }
        let remaining = match inner.config.turn_deadline.checked_sub(started.elapsed()) {
            Some(d) if d > Duration::ZERO => d,
            _ => {
                stop_reason = Some(StopReason::of(StopReasonKind::Timeout));
                break;
            }
        };

        let llm_request = LlmRequest {
            model: agent.llm_config.model.clone(),
            system: Some(system_prompt.clone()),
            messages: llm_history.clone(),
            max_tokens: agent.llm_config.max_tokens,
            tools: tool_defs.clone(),
        };

        let (step, streamed_message_id) = match call_model(
            inner, llm_request, remaining, &cancel, emitter, &mut clock, &agent, &actor,
            &include_types,
        )
        .await
        {
            StepResult::Response {
                response,
                streamed_message_id,
            } => (response, streamed_message_id),
            StepResult::Stop(reason) => {
                stop_reason = Some(reason);
                break;
            }
            StepResult::PartialCancelled {
                partial_text,
                streamed_message_id,
            } => {
                if !partial_text.is_empty() {
                    let message = persist_assistant(
                        inner, &agent, &actor, &mut clock, streamed_message_id, partial_text,
                        Vec::new(),
                    )
                    .await?;
                    turn_messages.push(message);
                }
                stop_reason = Some(StopReason::of(StopReasonKind::Cancelled));
                break;
            }
        };

        usage.prompt_tokens += step.input_tokens.unwrap_or(0);
        usage.completion_tokens += step.output_tokens.unwrap_or(0);
        usage.total_tokens += step.input_tokens.unwrap_or(0) + step.output_tokens.unwrap_or(0);
        usage.step_count += 1;

        let tool_uses: Vec<ToolCall> = step
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect();

        if tool_uses.is_empty() {
            // Final assistant message.
            let message = persist_assistant(
                inner, &agent, &actor, &mut clock, streamed_message_id, step.text.clone(),
                Vec::new(),
            )
            .await?;
            if !emitter.is_streaming() {
                emitter
                    .emit(
                        StreamEvent::AssistantMessage {
                            id: message.id.clone(),
                            date: message.created_at,
                            delta: message.content.clone(),
                        },
                        &include_types,
                    )
                    .await;
            }
            turn_messages.push(message);
            stop_reason = Some(StopReason::end_turn());
            break;
        }

        // Assistant message carrying the tool calls.
        let assistant = persist_assistant(
            inner, &agent, &actor, &mut clock, streamed_message_id, step.text.clone(),
            tool_uses.clone(),
        )
        .await?;
        llm_history.push(to_llm_message(&assistant));
        for call in &tool_uses {
            emitter
                .emit(
                    StreamEvent::ToolCallMessage {
                        id: assistant.id.clone(),
                        date: assistant.created_at,
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                    &include_types,
                )
                .await;
        }
        turn_messages.push(assistant);

        // Dispatch each call; results go back into the history as tool
        // messages.
        let mut fatal_tool_error = false;
        for call in &tool_uses {
            if cancel.is_cancelled() {
                stop_reason = Some(StopReason::of(StopReasonKind::Cancelled));
                break;
            }
            let (content, is_error) = if !agent.tool_names.iter().any(|n| n == &call.name) {
                (format!("tool {:?} is not attached to this agent", call.name), true)
            } else {
                match inner.tools.execute(&call.name, call.arguments.clone(), &tool_ctx).await {
                    Ok(output) => (output.content, output.is_error),
                    Err(e) => {
                        fatal_tool_error = true;
                        (format!("tool {:?} failed: {e}", call.name), true)
                    }
                }
            };

            let mut tool_message =
                Message::new(&agent.id, &actor, MessageRole::Tool, content.clone());
            tool_message.tool_call_id = Some(call.id.clone());
            tool_message.created_at = clock.next();
            tool_message.updated_at = tool_message.created_at;
            let tool_message = inner.store.insert_message(tool_message).await?;
            llm_history.push(to_llm_message(&tool_message));
            emitter
                .emit(
                    StreamEvent::ToolReturnMessage {
                        id: tool_message.id.clone(),
                        date: tool_message.created_at,
                        tool_call_id: call.id.clone(),
                        content,
                        is_error,
                    },
                    &include_types,
                )
                .await;
            turn_messages.push(tool_message);
        }
        if stop_reason.is_some() {
            break;
        }
        if fatal_tool_error {
            stop_reason = Some(StopReason::of(StopReasonKind::ToolError));
            break;
        }
    }

    let stop_reason = stop_reason.unwrap_or_else(|| StopReason::of(StopReasonKind::MaxSteps));
    finish_turn(
        inner, emitter, &agent, &actor, turn_messages, usage, stop_reason, started, job_id,
    )
    .await
}

enum StepResult {
    Response {
        response: LlmResponse,
        /// Message id the deltas streamed under, reused when persisting.
        streamed_message_id: Option<String>,
    },
    Stop(StopReason),
    PartialCancelled {
        partial_text: String,
        streamed_message_id: Option<String>,
    },
}

/// One provider call. Non-streaming turns use `chat` behind the retry
/// policy; streaming turns forward deltas as they arrive and assemble the
/// final response from the terminal chunk.
#[allow(clippy::too_many_arguments)]
async fn call_model(
    inner: &Arc<EngineInner>,
    request: LlmRequest,
    remaining: Duration,
    cancel: &CancellationToken,
    emitter: &mut Emitter,
    clock: &mut TurnClock,
    agent: &Agent,
    actor: &Actor,
    include_types: &Option<Vec<String>>,
) -> StepResult {
    if !emitter.is_streaming() {
        let provider = Arc::clone(&inner.provider);
        let call = retry_with_backoff(&inner.retry, || {
            let provider = Arc::clone(&provider);
            let request = request.clone();
            async move { provider.chat(request).await }
        });
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return StepResult::Stop(StopReason::of(StopReasonKind::Cancelled)),
            result = tokio::time::timeout(remaining, call) => result,
        };
        return match outcome {
            Err(_) => StepResult::Stop(StopReason::of(StopReasonKind::Timeout)),
            Ok(Err(e)) => {
                inner.audit.log(
                    EventDraft::new(AuditEventType::SystemError, AuditLevel::Error, "llm call failed")
                        .user(actor.id.as_str())
                        .resource(agent.id.as_str())
                        .failed(e.to_string()),
                );
                StepResult::Stop(StopReason::with_detail(StopReasonKind::LlmError, e.to_string()))
            }
            Ok(Ok(response)) => StepResult::Response {
                response,
                streamed_message_id: None,
            },
        };
    }

    // Streaming path.
    use tokio_stream::StreamExt;
    let stream = tokio::select! {
        _ = cancel.cancelled() => return StepResult::Stop(StopReason::of(StopReasonKind::Cancelled)),
        result = tokio::time::timeout(remaining, inner.provider.stream(request)) => match result {
            Err(_) => return StepResult::Stop(StopReason::of(StopReasonKind::Timeout)),
            Ok(Err(e)) => {
                return StepResult::Stop(StopReason::with_detail(StopReasonKind::LlmError, e.to_string()))
            }
            Ok(Ok(stream)) => stream,
        },
    };
    tokio::pin!(stream);

    // Deltas stream under a message id assigned up front; the full message
    // is persisted when the model finishes (or is cut off).
    let message_id = new_id(id_prefix::MESSAGE);
    let mut text = String::new();
    let mut final_chunk = None;
    let deadline = Instant::now() + remaining;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return StepResult::PartialCancelled {
                    partial_text: text,
                    streamed_message_id: Some(message_id),
                }
            }
            next = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), stream.next()) => next,
        };
        let chunk = match next {
            Err(_) => return StepResult::Stop(StopReason::of(StopReasonKind::Timeout)),
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return StepResult::Stop(StopReason::with_detail(
                    StopReasonKind::LlmError,
                    e.to_string(),
                ))
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        if chunk.is_final {
            final_chunk = Some(chunk);
            break;
        }
        if !chunk.delta.is_empty() {
            text.push_str(&chunk.delta);
            let delivered = emitter
                .emit(
                    StreamEvent::AssistantMessage {
                        id: message_id.clone(),
                        date: clock.last,
                        delta: chunk.delta,
                    },
                    include_types,
                )
                .await;
            if !delivered {
                return StepResult::PartialCancelled {
                    partial_text: text,
                    streamed_message_id: Some(message_id),
                };
            }
        }
    }

    let final_chunk = match final_chunk {
        Some(chunk) => chunk,
        None => {
            return StepResult::Stop(StopReason::with_detail(
                StopReasonKind::LlmError,
                "stream ended without a terminal chunk",
            ))
        }
    };

    let mut content: Vec<ContentBlock> = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text: text.clone() });
    }
    content.extend(final_chunk.content_blocks);
    StepResult::Response {
        response: LlmResponse {
            text,
            content,
            input_tokens: final_chunk.input_tokens,
            output_tokens: final_chunk.output_tokens,
            stop_reason: final_chunk.stop_reason,
        },
        streamed_message_id: Some(message_id),
    }
}

async fn persist_assistant(
    inner: &Arc<EngineInner>,
    agent: &Agent,
    actor: &Actor,
    clock: &mut TurnClock,
    id: Option<String>,
    text: String,
    tool_calls: Vec<ToolCall>,
) -> Result<Message> {
    let mut message = Message::new(&agent.id, actor, MessageRole::Assistant, text);
    if let Some(id) = id {
        message.id = id;
    }
    message.tool_calls = tool_calls;
    message.created_at = clock.next();
    message.updated_at = message.created_at;
    inner.store.insert_message(message).await
}

/// Retrieval (step 4): embed the latest non-empty user message once, then
/// query the agent's archival store and every attached source. One
/// RAG_SEARCH audit event covers the whole pass.
async fn retrieve_context(
    inner: &Arc<EngineInner>,
    agent: &Agent,
    request: &TurnRequest,
    actor: &Actor,
) -> Result<Vec<RetrievedContext>> {
    let query_text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty())
        .map(|m| m.content.clone());
    let Some(query_text) = query_text else {
        return Ok(Vec::new());
    };
    if inner.embedder.dimensions() != agent.embedding_config.dim {
        tracing::warn!(
            agent_id = %agent.id,
            "embedder dims {} do not match agent config {}, skipping retrieval",
            inner.embedder.dimensions(),
            agent.embedding_config.dim
        );
        return Ok(Vec::new());
    }

    let top_k = agent.top_k.unwrap_or(inner.config.default_top_k);
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let query_embedding = inner
        .embedder
        .embed(&[query_text.clone()])
        .await?
        .embeddings
        .remove(0);

    let mut retrieved = Vec::new();
    let mut scopes = vec!["archival".to_string()];
    let archival = inner
        .passages
        .search_similar(
            &query_embedding,
            top_k,
            inner.config.min_retrieval_similarity,
            SearchScope::Agent(agent.id.clone()),
            actor,
        )
        .await?;
    retrieved.push(RetrievedContext {
        origin: "archival".into(),
        passages: archival,
    });

    for source_id in &agent.source_ids {
        let origin = match inner.store.get_source(source_id, actor).await {
            Ok(source) => format!("source:{}", source.name),
            Err(_) => {
                tracing::warn!(source_id, "attached source missing, skipping retrieval");
                continue;
            }
        };
        let hits = inner
            .passages
            .search_similar(
                &query_embedding,
                top_k,
                inner.config.min_retrieval_similarity,
                SearchScope::Source(source_id.clone()),
                actor,
            )
            .await?;
        scopes.push(origin.clone());
        retrieved.push(RetrievedContext {
            origin,
            passages: hits,
        });
    }

    let total_hits: usize = retrieved.iter().map(|r| r.passages.len()).sum();
    inner.audit.log(
        EventDraft::new(AuditEventType::RagSearch, AuditLevel::Info, "similarity search")
            .user(actor.id.as_str())
            .resource(agent.id.as_str())
            .details(serde_json::json!({ "scopes": scopes, "hits": total_hits, "top_k": top_k }))
            .content(query_text)
            .response_time(started.elapsed().as_millis() as u64),
    );

    Ok(retrieved)
}

#[allow(clippy::too_many_arguments)]
async fn finish_turn(
    inner: &Arc<EngineInner>,
    emitter: &mut Emitter,
    agent: &Agent,
    actor: &Actor,
    messages: Vec<Message>,
    usage: UsageStats,
    stop_reason: StopReason,
    started: Instant,
    job_id: Option<String>,
) -> Result<TurnOutcome> {
    // Step 7: job association and the step record.
    if let Some(job_id) = &job_id {
        let message_ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        if let Err(e) = inner.jobs.add_messages_to_job(job_id, message_ids, actor).await {
            tracing::warn!(job_id, "job message association failed: {e}");
        }
        if let Err(e) = inner
            .jobs
            .add_job_usage(job_id, usage, Some(&agent.id), actor)
            .await
        {
            tracing::warn!(job_id, "job usage record failed: {e}");
        }
    }

    let success = matches!(
        stop_reason.kind,
        StopReasonKind::EndTurn | StopReasonKind::MaxSteps
    );
    let mut draft = EventDraft::new(AuditEventType::AgentMessage, AuditLevel::Info, "agent turn")
        .user(actor.id.as_str())
        .resource(agent.id.as_str())
        .details(serde_json::json!({
            "stop_reason": stop_reason.kind.as_str(),
            "steps": usage.step_count,
            "messages": messages.len(),
        }))
        .response_time(started.elapsed().as_millis() as u64);
    if !success {
        draft = draft.failed(stop_reason.kind.as_str());
    }
    inner.audit.log(draft);

    emitter.finish(stop_reason.clone(), usage).await;
    Ok(TurnOutcome {
        messages,
        stop_reason,
        usage,
    })
}

fn to_llm_message(message: &Message) -> LlmMessage {
    let mut content = Vec::new();
    match message.role {
        MessageRole::Tool => {
            content.push(ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
                is_error: false,
            });
        }
        _ => {
            if !message.content.is_empty() {
                content.push(ContentBlock::Text {
                    text: message.content.clone(),
                });
            }
            for call in &message.tool_calls {
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
        }
    }
    LlmMessage {
        role: match message.role {
            MessageRole::Tool => "tool".to_string(),
            MessageRole::System => "system".to_string(),
            MessageRole::User => "user".to_string(),
            MessageRole::Assistant => "assistant".to_string(),
        },
        content,
    }
}
