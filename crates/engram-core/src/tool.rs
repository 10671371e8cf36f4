//! Tool execution framework: the `ToolExecutor` trait, the registry, and
//! the per-turn context handed to every tool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use engram_memory::{EmbeddingProvider, PassageManager};
use engram_provider::ToolDef;
use engram_schema::{Actor, Agent, EngramError, Result};
use engram_store::Store;

/// Output from a tool execution. `is_error` results still feed back into
/// the conversation so the model can recover.
#[derive(Debug)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Per-turn context: which agent is running, for whom, and the handles the
/// built-in memory tools operate through.
#[derive(Clone)]
pub struct ToolContext {
    pub agent: Agent,
    pub actor: Actor,
    pub store: Store,
    pub passages: PassageManager,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The definition (name, description, schema) advertised to the model.
    fn definition(&self) -> ToolDef;

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn ToolExecutor>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolExecutor> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions restricted to the names an agent has attached. Unknown
    /// names are skipped; they may be schema-only rows without an executor.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| EngramError::not_found(format!("tool {name}")))?;
        tool.execute(input, ctx).await
    }
}

/// Pull a required string field out of a tool's JSON input.
pub(crate) fn require_str<'a>(input: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngramError::invalid_argument(format!("missing tool argument {field:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTool;

    #[async_trait]
    impl ToolExecutor for NoopTool {
        fn definition(&self) -> ToolDef {
            ToolDef {
                name: "noop".into(),
                description: "does nothing".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            }
        }

        async fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            Ok(ToolOutput::ok("ok"))
        }
    }

    #[test]
    fn registry_lists_sorted_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(NoopTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "noop");
    }

    #[test]
    fn definitions_for_skips_unknown_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(NoopTool));
        let defs = registry.definitions_for(&["noop".into(), "ghost".into()]);
        assert_eq!(defs.len(), 1);
    }

    #[test]
    fn require_str_reports_missing_field() {
        let err = require_str(&serde_json::json!({}), "text").unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(require_str(&serde_json::json!({ "text": "x" }), "text").is_ok());
    }
}
