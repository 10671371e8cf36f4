pub mod openai;
pub mod retry;
pub mod types;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use engram_schema::{EngramError, Result};
use futures_core::Stream;
use tokio_stream::iter as stream_iter;

pub use openai::OpenAiProvider;
pub use retry::{retry_with_backoff, RetryConfig};
pub use types::*;

impl std::fmt::Debug for dyn LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn LlmProvider")
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;

    async fn stream(
        &self,
        _request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        Err(EngramError::invalid_argument(
            "streaming not supported by this provider",
        ))
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// Provider Registry
// ============================================================

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::not_found(format!("provider {id}")))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

// ============================================================
// Test providers
// ============================================================

/// Echo provider for wiring tests: replies with the last user text.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.plain_text())
            .unwrap_or_default();
        let full_text = format!("[stub:{}] {}", request.model, user_text);
        Ok(LlmResponse {
            text: full_text.clone(),
            content: vec![ContentBlock::Text { text: full_text }],
            input_tokens: Some(10),
            output_tokens: Some(5),
            stop_reason: Some("end_turn".into()),
        })
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let response = self.chat(request).await?;
        let mut chunks: Vec<Result<StreamChunk>> = response
            .text
            .split_whitespace()
            .map(|word| {
                Ok(StreamChunk {
                    delta: format!("{word} "),
                    is_final: false,
                    input_tokens: None,
                    output_tokens: None,
                    stop_reason: None,
                    content_blocks: vec![],
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            stop_reason: response.stop_reason,
            content_blocks: vec![],
        }));
        Ok(Box::pin(stream_iter(chunks)))
    }
}

/// Plays back a queue of canned responses; the agent-loop tests script tool
/// call rounds with it. Once the queue drains it behaves like `StubProvider`.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    responses: Arc<Mutex<VecDeque<LlmResponse>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.push_response(LlmResponse {
            text: text.clone(),
            content: vec![ContentBlock::Text { text }],
            input_tokens: Some(10),
            output_tokens: Some(5),
            stop_reason: Some("end_turn".into()),
        });
    }

    pub fn push_tool_call(&self, name: impl Into<String>, input: serde_json::Value) {
        let name = name.into();
        self.push_response(LlmResponse {
            text: String::new(),
            content: vec![ContentBlock::ToolUse {
                id: format!("call-{}", uuid::Uuid::new_v4()),
                name,
                input,
            }],
            input_tokens: Some(10),
            output_tokens: Some(5),
            stop_reason: Some("tool_use".into()),
        });
    }

    pub fn push_response(&self, response: LlmResponse) {
        self.responses
            .lock()
            .expect("scripted provider lock")
            .push_back(response);
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("scripted provider lock").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let next = self
            .responses
            .lock()
            .expect("scripted provider lock")
            .pop_front();
        match next {
            Some(response) => Ok(response),
            None => StubProvider.chat(request).await,
        }
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let response = self.chat(request).await?;
        let mut chunks: Vec<Result<StreamChunk>> = Vec::new();
        for block in &response.content {
            if let ContentBlock::Text { text } = block {
                for word in text.split_inclusive(' ') {
                    chunks.push(Ok(StreamChunk {
                        delta: word.to_string(),
                        is_final: false,
                        input_tokens: None,
                        output_tokens: None,
                        stop_reason: None,
                        content_blocks: vec![],
                    }));
                }
            }
        }
        chunks.push(Ok(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            stop_reason: response.stop_reason.clone(),
            content_blocks: response
                .content
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .cloned()
                .collect(),
        }));
        Ok(Box::pin(stream_iter(chunks)))
    }
}
