use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use engram_audit::{generate_report, AuditEvent, AuditEventType, EventFilter, ReportFormat};
use engram_schema::EngramError;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub event_type: Option<String>,
    /// high (>= 70), medium (>= 40), or low (everything)
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub hours: Option<u32>,
}

fn default_limit() -> usize {
    100
}

#[derive(Deserialize)]
pub struct ReportQuery {
    #[serde(default = "default_report_hours")]
    pub hours: u32,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub include_categories: bool,
}

fn default_report_hours() -> u32 {
    24
}

fn default_format() -> String {
    "json".to_string()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/events", get(list_events))
        .route("/report", get(download_report))
}

async fn get_stats(State(state): State<AppState>) -> Json<engram_audit::RealtimeStats> {
    Json(state.engine.audit().realtime_stats())
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let event_type = match query.event_type.as_deref() {
        Some(raw) => Some(AuditEventType::parse(raw).ok_or_else(|| {
            EngramError::invalid_argument(format!("unknown event type {raw:?}"))
        })?),
        None => None,
    };
    let min_risk = match query.risk_level.as_deref() {
        Some("high") => Some(70),
        Some("medium") => Some(40),
        Some("low") | None => None,
        Some(other) => {
            return Err(
                EngramError::invalid_argument(format!("unknown risk level {other:?}")).into(),
            )
        }
    };
    let since = query
        .hours
        .map(|h| Utc::now() - chrono::TimeDelta::hours(h as i64));

    let events = state
        .audit_query
        .list_events(
            EventFilter {
                event_type,
                min_risk,
                user_id: query.user_id,
                since,
            },
            query.limit,
        )
        .await?;
    Ok(Json(events))
}

async fn download_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let format = ReportFormat::parse(&query.format)
        .ok_or_else(|| EngramError::invalid_argument(format!("unknown format {:?}", query.format)))?;
    let bytes = generate_report(
        &state.audit_query,
        query.hours,
        format,
        query.include_categories,
    )
    .await?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], bytes))
}
