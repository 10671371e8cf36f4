//! Built-in memory tools: archival insert/search, core-memory edits, and
//! conversation search. These are the only tools every agent gets by
//! default.

use async_trait::async_trait;
use engram_memory::{EmbeddingProvider, PassageManager, SearchScope};
use engram_provider::ToolDef;
use engram_schema::Result;

use crate::tool::{require_str, ToolContext, ToolExecutor, ToolOutput, ToolRegistry};

const DEFAULT_SEARCH_LIMIT: usize = 5;

pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "archival_memory_insert",
    "archival_memory_search",
    "core_memory_replace",
    "core_memory_append",
    "conversation_search",
];

pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(Box::new(ArchivalMemoryInsertTool));
    registry.register(Box::new(ArchivalMemorySearchTool));
    registry.register(Box::new(CoreMemoryReplaceTool));
    registry.register(Box::new(CoreMemoryAppendTool));
    registry.register(Box::new(ConversationSearchTool));
}

fn limit_from(input: &serde_json::Value) -> usize {
    input
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
}

// ---------------------------------------------------------------------------
// archival_memory_insert
// ---------------------------------------------------------------------------

pub struct ArchivalMemoryInsertTool;

#[async_trait]
impl ToolExecutor for ArchivalMemoryInsertTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "archival_memory_insert".into(),
            description: "Add a fact to archival memory for later retrieval.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Content to remember." }
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let text = require_str(&input, "text")?;
        let embedding = ctx
            .embedder
            .embed(&[text.to_string()])
            .await?
            .embeddings
            .remove(0);
        let passage = PassageManager::new_agent_passage(
            &ctx.agent.id,
            text,
            embedding,
            ctx.agent.embedding_config.clone(),
            &ctx.actor,
        );
        let created = ctx.passages.create_agent_passage(passage, &ctx.actor).await?;
        Ok(ToolOutput::ok(format!(
            "Stored in archival memory (id {}).",
            created.id
        )))
    }
}

// ---------------------------------------------------------------------------
// archival_memory_search
// ---------------------------------------------------------------------------

pub struct ArchivalMemorySearchTool;

#[async_trait]
impl ToolExecutor for ArchivalMemorySearchTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "archival_memory_search".into(),
            description: "Semantic search over archival memory.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let query = require_str(&input, "query")?;
        let limit = limit_from(&input);
        let embedding = ctx
            .embedder
            .embed(&[query.to_string()])
            .await?
            .embeddings
            .remove(0);
        let hits = ctx
            .passages
            .search_similar(
                &embedding,
                limit,
                -1.0,
                SearchScope::Agent(ctx.agent.id.clone()),
                &ctx.actor,
            )
            .await?;
        if hits.is_empty() {
            return Ok(ToolOutput::ok("No archival memories matched."));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|hit| format!("- {}", hit.passage.text))
            .collect();
        Ok(ToolOutput::ok(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// core_memory_replace / core_memory_append
// ---------------------------------------------------------------------------

pub struct CoreMemoryReplaceTool;

#[async_trait]
impl ToolExecutor for CoreMemoryReplaceTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "core_memory_replace".into(),
            description: "Overwrite the contents of a core memory block.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "label": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["label", "value"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let label = require_str(&input, "label")?;
        let value = require_str(&input, "value")?;
        let block = ctx
            .store
            .get_memory_block(&ctx.agent.id, label, &ctx.actor)
            .await?;
        if value.chars().count() > block.limit {
            return Ok(ToolOutput::error(format!(
                "value exceeds the {} character limit of block {label:?}",
                block.limit
            )));
        }
        ctx.store
            .update_memory_block_value(&ctx.agent.id, label, value, &ctx.actor)
            .await?;
        Ok(ToolOutput::ok(format!("Updated core memory block {label:?}.")))
    }
}

pub struct CoreMemoryAppendTool;

#[async_trait]
impl ToolExecutor for CoreMemoryAppendTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "core_memory_append".into(),
            description: "Append a line to a core memory block.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "label": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["label", "value"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let label = require_str(&input, "label")?;
        let value = require_str(&input, "value")?;
        let block = ctx
            .store
            .get_memory_block(&ctx.agent.id, label, &ctx.actor)
            .await?;
        let combined = if block.value.is_empty() {
            value.to_string()
        } else {
            format!("{}\n{}", block.value, value)
        };
        if combined.chars().count() > block.limit {
            return Ok(ToolOutput::error(format!(
                "appending would exceed the {} character limit of block {label:?}",
                block.limit
            )));
        }
        ctx.store
            .update_memory_block_value(&ctx.agent.id, label, &combined, &ctx.actor)
            .await?;
        Ok(ToolOutput::ok(format!(
            "Appended to core memory block {label:?}."
        )))
    }
}

// ---------------------------------------------------------------------------
// conversation_search
// ---------------------------------------------------------------------------

pub struct ConversationSearchTool;

#[async_trait]
impl ToolExecutor for ConversationSearchTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "conversation_search".into(),
            description: "Search earlier messages in this conversation.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let query = require_str(&input, "query")?;
        let limit = limit_from(&input);
        let messages = ctx
            .store
            .search_messages(&ctx.agent.id, &ctx.actor, query, limit)
            .await?;
        if messages.is_empty() {
            return Ok(ToolOutput::ok("No earlier messages matched."));
        }
        let lines: Vec<String> = messages
            .iter()
            .map(|m| format!("[{}] {}", m.role.as_str(), m.content))
            .collect();
        Ok(ToolOutput::ok(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_memory::HashEmbeddingProvider;
    use engram_schema::{
        default_block_limit, id_prefix, new_id, Actor, Agent, EmbeddingConfig, LlmConfig,
        MemoryBlock, Message, MessageRole,
    };
    use engram_store::{Store, VectorStore};
    use std::sync::Arc;

    async fn context() -> ToolContext {
        let store = Store::open_in_memory().unwrap();
        let vector = VectorStore::new(store.clone()).await.unwrap();
        let passages = PassageManager::new(store.clone(), vector);
        let actor = Actor::new("user-1", "org-1");

        let now = Utc::now();
        let agent = Agent {
            id: new_id(id_prefix::AGENT),
            organization_id: "org-1".into(),
            name: "memory-test".into(),
            tool_names: BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
            source_ids: vec![],
            llm_config: LlmConfig::new("test-model"),
            embedding_config: EmbeddingConfig::new("hash-embedder", 16),
            top_k: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: None,
            updated_by: None,
        };
        store
            .insert_agent(
                agent.clone(),
                vec![MemoryBlock {
                    id: new_id(id_prefix::BLOCK),
                    organization_id: "org-1".into(),
                    agent_id: agent.id.clone(),
                    label: "user_facts".into(),
                    value: String::new(),
                    limit: default_block_limit(),
                    created_at: now,
                    updated_at: now,
                    is_deleted: false,
                }],
                &actor,
            )
            .await
            .unwrap();

        let provider = Arc::new(HashEmbeddingProvider::new(16));
        ToolContext {
            agent,
            actor,
            store,
            passages,
            embedder: provider,
        }
    }

    #[tokio::test]
    async fn insert_then_search_archival() {
        let ctx = context().await;
        let insert = ArchivalMemoryInsertTool
            .execute(
                serde_json::json!({ "text": "favorite color: green" }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!insert.is_error);

        let search = ArchivalMemorySearchTool
            .execute(serde_json::json!({ "query": "favorite color: green" }), &ctx)
            .await
            .unwrap();
        assert!(search.content.contains("favorite color: green"));
    }

    #[tokio::test]
    async fn search_with_no_matches_reports_empty() {
        let ctx = context().await;
        let search = ArchivalMemorySearchTool
            .execute(serde_json::json!({ "query": "anything" }), &ctx)
            .await
            .unwrap();
        assert!(search.content.contains("No archival memories"));
    }

    #[tokio::test]
    async fn core_memory_append_accumulates_lines() {
        let ctx = context().await;
        CoreMemoryAppendTool
            .execute(
                serde_json::json!({ "label": "user_facts", "value": "likes tea" }),
                &ctx,
            )
            .await
            .unwrap();
        CoreMemoryAppendTool
            .execute(
                serde_json::json!({ "label": "user_facts", "value": "favorite color: green" }),
                &ctx,
            )
            .await
            .unwrap();

        let block = ctx
            .store
            .get_memory_block(&ctx.agent.id, "user_facts", &ctx.actor)
            .await
            .unwrap();
        assert_eq!(block.value, "likes tea\nfavorite color: green");
    }

    #[tokio::test]
    async fn core_memory_replace_overwrites() {
        let ctx = context().await;
        CoreMemoryAppendTool
            .execute(
                serde_json::json!({ "label": "user_facts", "value": "old" }),
                &ctx,
            )
            .await
            .unwrap();
        CoreMemoryReplaceTool
            .execute(
                serde_json::json!({ "label": "user_facts", "value": "new truth" }),
                &ctx,
            )
            .await
            .unwrap();

        let block = ctx
            .store
            .get_memory_block(&ctx.agent.id, "user_facts", &ctx.actor)
            .await
            .unwrap();
        assert_eq!(block.value, "new truth");
    }

    #[tokio::test]
    async fn block_limit_enforced_as_tool_error() {
        let ctx = context().await;
        let oversized = "x".repeat(default_block_limit() + 1);
        let output = CoreMemoryReplaceTool
            .execute(
                serde_json::json!({ "label": "user_facts", "value": oversized }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("character limit"));
    }

    #[tokio::test]
    async fn unknown_block_label_is_not_found() {
        let ctx = context().await;
        let err = CoreMemoryAppendTool
            .execute(
                serde_json::json!({ "label": "ghost", "value": "x" }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn conversation_search_finds_substring() {
        let ctx = context().await;
        ctx.store
            .insert_message(Message::new(
                &ctx.agent.id,
                &ctx.actor,
                MessageRole::User,
                "my favorite color is green",
            ))
            .await
            .unwrap();

        let output = ConversationSearchTool
            .execute(serde_json::json!({ "query": "favorite color" }), &ctx)
            .await
            .unwrap();
        assert!(output.content.contains("green"));
    }
}
