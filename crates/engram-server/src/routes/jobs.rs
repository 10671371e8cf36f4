use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_jobs::TransitionOutcome;
use engram_schema::{Job, JobStatus, JobType, Message, UsageStats};
use engram_store::{JobFilter, Page};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::agents::ListQuery;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default = "default_job_limit")]
    pub limit: usize,
    #[serde(default = "default_job_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub statuses: Option<String>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub source_id: Option<String>,
}

fn default_job_limit() -> usize {
    50
}

fn default_job_ascending() -> bool {
    true
}

impl ListJobsQuery {
    fn page(&self) -> Page {
        Page {
            before: self.before.clone(),
            after: self.after.clone(),
            limit: self.limit,
            ascending: self.ascending,
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub job: Job,
    pub cancelled: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/messages", get(get_job_messages))
        .route("/{id}/usage", get(get_job_usage))
        .route("/{id}/cancel", post(cancel_job))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let statuses = query.statuses.as_deref().map(|raw| {
        raw.split(',')
            .filter_map(JobStatus::parse)
            .collect::<Vec<_>>()
    });
    let jobs = state
        .engine
        .jobs()
        .list_jobs(
            &state.actor,
            query.page(),
            JobFilter {
                statuses,
                job_type: query.job_type,
                source_id: query.source_id,
            },
        )
        .await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.engine.jobs().get_job(&id, &state.actor).await?;
    Ok(Json(job))
}

async fn get_job_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .engine
        .jobs()
        .get_job_messages(&id, &state.actor, query.page(), None)
        .await?;
    Ok(Json(messages))
}

async fn get_job_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UsageStats>, ApiError> {
    let usage = state.engine.jobs().get_job_usage(&id, &state.actor).await?;
    Ok(Json(usage))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state
        .engine
        .jobs()
        .safe_update_status(&id, JobStatus::Cancelled, &state.actor)
        .await?;
    let cancelled = matches!(outcome, TransitionOutcome::Applied(_));
    let job = state.engine.jobs().get_job(&id, &state.actor).await?;
    Ok(Json(CancelResponse { job, cancelled }))
}
