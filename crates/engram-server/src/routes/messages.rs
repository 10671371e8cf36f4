use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_schema::{InboundMessage, Message, MessageRole, TurnRequest, TurnResponse};
use futures_core::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub include_types: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default = "default_message_limit")]
    pub limit: usize,
    #[serde(default = "default_message_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub role: Option<MessageRole>,
}

fn default_message_limit() -> usize {
    50
}

fn default_message_ascending() -> bool {
    true
}

impl ListMessagesQuery {
    fn page(&self) -> engram_store::Page {
        engram_store::Page {
            before: self.before.clone(),
            after: self.after.clone(),
            limit: self.limit,
            ascending: self.ascending,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/messages", post(send_message).get(list_messages))
        .route("/{id}/messages/stream", post(send_message_stream))
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<TurnResponse>, ApiError> {
    let request = TurnRequest {
        agent_id: id,
        messages: body.messages,
        stream: false,
        include_types: body.include_types,
    };
    let response = state
        .engine
        .send_message(request, &state.actor, CancellationToken::new())
        .await?;
    Ok(Json(response))
}

/// Server-sent events: one JSON object per `data:` line, ending with the
/// `stop_reason` and `usage` events and a `[DONE]` sentinel. Dropping the
/// connection cancels the turn at its next suspension point.
async fn send_message_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = TurnRequest {
        agent_id: id,
        messages: body.messages,
        stream: true,
        include_types: body.include_types,
    };
    let events = state
        .engine
        .send_message_stream(request, &state.actor, CancellationToken::new())
        .await?;

    let stream = events
        .map(|event| {
            let payload = serde_json::to_string(&event)
                .unwrap_or_else(|_| "{\"message_type\":\"error\"}".to_string());
            Ok(Event::default().data(payload))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .engine
        .store()
        .list_messages(&id, &state.actor, query.page(), query.role)
        .await?;
    Ok(Json(messages))
}
