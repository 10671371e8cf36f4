//! Wire types for one agent turn: request, response, and the typed chunks
//! emitted on the streaming path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Message, MessageRole, UsageStats};

/// Input to the agent message loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub agent_id: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub stream: bool,
    /// When set, only chunks of these types are emitted / returned.
    #[serde(default)]
    pub include_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReasonKind {
    EndTurn,
    ToolError,
    MaxSteps,
    Cancelled,
    LlmError,
    Timeout,
}

impl StopReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReasonKind::EndTurn => "end_turn",
            StopReasonKind::ToolError => "tool_error",
            StopReasonKind::MaxSteps => "max_steps",
            StopReasonKind::Cancelled => "cancelled",
            StopReasonKind::LlmError => "llm_error",
            StopReasonKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopReason {
    pub kind: StopReasonKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StopReason {
    pub fn end_turn() -> Self {
        Self {
            kind: StopReasonKind::EndTurn,
            detail: None,
        }
    }

    pub fn of(kind: StopReasonKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: StopReasonKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }
}

/// Non-streaming output of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub messages: Vec<Message>,
    pub stop_reason: StopReason,
    pub usage: UsageStats,
}

/// One element of the streamed turn. The sequence is finite: zero or more
/// message chunks, then exactly one `StopReason`, then exactly one `Usage`,
/// then the channel closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Echo of an inbound user message once it is durable.
    UserMessage {
        id: String,
        date: DateTime<Utc>,
        content: String,
    },
    /// Model reasoning surfaced before the visible answer.
    ReasoningMessage {
        id: String,
        date: DateTime<Utc>,
        reasoning: String,
    },
    /// Token delta of the assistant's visible answer.
    AssistantMessage {
        id: String,
        date: DateTime<Utc>,
        delta: String,
    },
    /// A tool invocation: function name plus (possibly partial) JSON args.
    ToolCallMessage {
        id: String,
        date: DateTime<Utc>,
        name: String,
        arguments: String,
    },
    ToolReturnMessage {
        id: String,
        date: DateTime<Utc>,
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    StopReason { stop_reason: StopReason },
    Usage { usage: UsageStats },
}

impl StreamEvent {
    /// The filterable type name, matching the serialized `message_type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::UserMessage { .. } => "user_message",
            StreamEvent::ReasoningMessage { .. } => "reasoning_message",
            StreamEvent::AssistantMessage { .. } => "assistant_message",
            StreamEvent::ToolCallMessage { .. } => "tool_call_message",
            StreamEvent::ToolReturnMessage { .. } => "tool_return_message",
            StreamEvent::StopReason { .. } => "stop_reason",
            StreamEvent::Usage { .. } => "usage",
        }
    }

    /// Terminal events are never filtered out by `include_types`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::StopReason { .. } | StreamEvent::Usage { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_tags_match_type_names() {
        let event = StreamEvent::AssistantMessage {
            id: "message-1".into(),
            date: Utc::now(),
            delta: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["message_type"], event.type_name());
    }

    #[test]
    fn stop_reason_serializes_kind_snake_case() {
        let reason = StopReason::of(StopReasonKind::MaxSteps);
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "max_steps");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(StreamEvent::StopReason {
            stop_reason: StopReason::end_turn()
        }
        .is_terminal());
        assert!(StreamEvent::Usage {
            usage: UsageStats::default()
        }
        .is_terminal());
    }
}
