//! OpenAI-compatible chat provider. Works against any `/chat/completions`
//! endpoint, which covers the hosted APIs as well as local BGE/vLLM-style
//! servers.

use std::pin::Pin;

use async_trait::async_trait;
use engram_schema::{EngramError, Result};
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::{ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse, StreamChunk};

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: LlmRequest, stream: bool) -> ApiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .into_iter()
                    .map(|tool| ApiTool {
                        tool_type: "function".to_string(),
                        function: ApiFunctionDef {
                            name: tool.name,
                            description: tool.description,
                            parameters: tool.input_schema,
                        },
                    })
                    .collect(),
            )
        };

        ApiRequest {
            model: request.model,
            messages: to_api_messages(request.system, request.messages),
            max_tokens: Some(request.max_tokens),
            tools,
            stream,
            stream_options: if stream {
                Some(ApiStreamOptions {
                    include_usage: true,
                })
            } else {
                None
            },
        }
    }

    async fn send(&self, payload: &ApiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);
        let resp = match self
            .client
            .post(url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(EngramError::unavailable("provider request timed out"))
            }
            Err(e) if e.is_connect() => {
                return Err(EngramError::unavailable(format!("provider unreachable: {e}")))
            }
            Err(e) => return Err(EngramError::internal(format!("provider request: {e}"))),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        Ok(resp)
    }
}

/// 5xx and 429 are transient; everything else is the caller's problem.
fn classify_status(status: StatusCode, body: &str) -> EngramError {
    let detail = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());
    match status.as_u16() {
        429 => EngramError::resource_exhausted(format!("provider rate limited: {detail}")),
        500..=599 => EngramError::unavailable(format!("provider error {status}: {detail}")),
        400 | 422 => EngramError::invalid_argument(format!("provider rejected request: {detail}")),
        401 | 403 => EngramError::failed_precondition(format!("provider auth failed: {detail}")),
        _ => EngramError::internal(format!("provider error {status}: {detail}")),
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let payload = Self::to_api_request(request, false);
        let resp = self.send(&payload).await?;
        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| EngramError::internal(format!("provider response body: {e}")))?;
        to_llm_response(body)
    }

    async fn stream(
        &self,
        request: LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let payload = Self::to_api_request(request, true);
        let resp = self.send(&payload).await?;
        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }
}

fn to_api_messages(system: Option<String>, messages: Vec<LlmMessage>) -> Vec<ApiMessage> {
    let mut result = Vec::new();

    if let Some(system_text) = system {
        result.push(ApiMessage {
            role: "system".to_string(),
            content: Some(system_text),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in messages {
        let text = message.plain_text();
        let tool_uses: Vec<ApiToolCall> = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ApiToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ApiToolFunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                _ => None,
            })
            .collect();

        if !text.is_empty() || !tool_uses.is_empty() {
            result.push(ApiMessage {
                role: message.role.clone(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_uses.is_empty() {
                    None
                } else {
                    Some(tool_uses)
                },
                tool_call_id: None,
            });
        }

        for block in message.content {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            {
                result.push(ApiMessage {
                    role: "tool".to_string(),
                    content: Some(content),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
        }
    }

    result
}

fn to_llm_response(body: ApiResponse) -> Result<LlmResponse> {
    let choice = body
        .choices
        .first()
        .ok_or_else(|| EngramError::internal("provider returned empty choices"))?;
    let message = &choice.message;

    let mut content = Vec::new();
    if let Some(text) = &message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            let input = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
    }

    Ok(LlmResponse {
        text: message.content.clone().unwrap_or_default(),
        content,
        input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
        output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
        stop_reason: normalize_finish_reason(choice.finish_reason.clone()),
    })
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();
        let mut tool_accumulators: Vec<ToolCallAccumulator> = Vec::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if data == "[DONE]" {
                                continue;
                            }
                            match serde_json::from_str::<ApiStreamChunk>(data) {
                                Ok(event) => {
                                    if let Some(chunk) = parse_sse_event(&event, &mut tool_accumulators) {
                                        yield Ok(chunk);
                                    }
                                }
                                Err(e) => {
                                    yield Err(EngramError::unavailable(format!(
                                        "invalid sse event payload: {e}"
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(EngramError::unavailable(format!("stream error: {e}")));
                    return;
                }
            }
        }
    }
}

fn parse_sse_event(
    event: &ApiStreamChunk,
    tool_accumulators: &mut Vec<ToolCallAccumulator>,
) -> Option<StreamChunk> {
    let choice = event.choices.first()?;

    if let Some(tool_calls) = &choice.delta.tool_calls {
        for tc in tool_calls {
            let idx = tc.index as usize;
            while tool_accumulators.len() <= idx {
                tool_accumulators.push(ToolCallAccumulator::default());
            }
            let acc = &mut tool_accumulators[idx];
            if let Some(id) = &tc.id {
                acc.id = id.clone();
            }
            if let Some(f) = &tc.function {
                if let Some(name) = &f.name {
                    acc.name = name.clone();
                }
                if let Some(args) = &f.arguments {
                    acc.arguments.push_str(args);
                }
            }
        }
    }

    if let Some(text) = &choice.delta.content {
        if !text.is_empty() {
            return Some(StreamChunk {
                delta: text.clone(),
                is_final: false,
                input_tokens: None,
                output_tokens: None,
                stop_reason: None,
                content_blocks: vec![],
            });
        }
    }

    if choice.finish_reason.is_some() {
        let content_blocks = drain_tool_accumulators(tool_accumulators);
        return Some(StreamChunk {
            delta: String::new(),
            is_final: true,
            input_tokens: event.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: event.usage.as_ref().map(|u| u.completion_tokens),
            stop_reason: normalize_finish_reason(choice.finish_reason.clone()),
            content_blocks,
        });
    }

    None
}

#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

fn drain_tool_accumulators(accumulators: &mut Vec<ToolCallAccumulator>) -> Vec<ContentBlock> {
    accumulators
        .drain(..)
        .filter(|acc| !acc.id.is_empty())
        .map(|acc| {
            let input = serde_json::from_str::<serde_json::Value>(&acc.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            ContentBlock::ToolUse {
                id: acc.id,
                name: acc.name,
                input,
            }
        })
        .collect()
}

fn normalize_finish_reason(reason: Option<String>) -> Option<String> {
    match reason.as_deref() {
        Some("tool_calls") => Some("tool_use".to_string()),
        Some("stop") => Some("end_turn".to_string()),
        Some("length") => Some("max_tokens".to_string()),
        other => other.map(|s| s.to_string()),
    }
}

// ============================================================
// Wire types
// ============================================================

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<ApiStreamOptions>,
}

#[derive(Serialize)]
struct ApiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ApiToolFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct ApiToolFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ApiStreamChunk {
    choices: Vec<ApiStreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiStreamChoice {
    delta: ApiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiStreamToolCall>>,
}

#[derive(Deserialize)]
struct ApiStreamToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ApiStreamToolFunction>,
}

#[derive(Deserialize)]
struct ApiStreamToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
