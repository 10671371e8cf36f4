use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use engram_audit::{AuditEventType, AuditLevel, EventDraft};
use engram_schema::{
    id_prefix, new_id, EmbeddingConfig, EngramError, FileMetadata, Job, JobStatus, JobType,
    Source,
};
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::agents::ListQuery;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateSourceBody {
    pub name: String,
    pub embedding_config: EmbeddingConfig,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_source).get(list_sources))
        .route("/{id}", get(get_source))
        .route("/{id}/files", get(list_files))
        .route("/{id}/upload", post(upload_file))
}

async fn create_source(
    State(state): State<AppState>,
    Json(body): Json<CreateSourceBody>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    let now = Utc::now();
    let source = Source {
        id: new_id(id_prefix::SOURCE),
        organization_id: state.actor.organization_id.clone(),
        name: body.name,
        embedding_config: body.embedding_config,
        created_at: now,
        updated_at: now,
        is_deleted: false,
        created_by: Some(state.actor.id.clone()),
    };
    let source = state
        .engine
        .store()
        .insert_source(source, &state.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn list_sources(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Source>>, ApiError> {
    let sources = state
        .engine
        .store()
        .list_sources(&state.actor, query.page())
        .await?;
    Ok(Json(sources))
}

async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Source>, ApiError> {
    let source = state.engine.store().get_source(&id, &state.actor).await?;
    Ok(Json(source))
}

async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<FileMetadata>>, ApiError> {
    let files = state.engine.store().list_files(&id, &state.actor).await?;
    Ok(Json(files))
}

/// Accept a multipart upload and ingest it asynchronously. The response is
/// the tracking job; ingestion advances it pending -> running -> terminal.
async fn upload_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let source = state.engine.store().get_source(&id, &state.actor).await?;

    let mut file_name = None;
    let mut mime_type = None;
    let mut content: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngramError::invalid_argument(format!("bad multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            file_name = field.file_name().map(|s| s.to_string());
            mime_type = field.content_type().map(|s| s.to_string());
            content = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| EngramError::invalid_argument(format!("file read: {e}")))?
                    .to_vec(),
            );
        }
    }
    let content =
        content.ok_or_else(|| EngramError::invalid_argument("multipart field 'file' missing"))?;
    let file_name = file_name.unwrap_or_else(|| "upload".to_string());

    let mut job = Job::new(&state.actor, JobType::Job);
    job.metadata = serde_json::json!({
        "source_id": source.id,
        "file_name": file_name,
    });
    let job = state.engine.jobs().create_job(job).await?;
    state
        .engine
        .jobs()
        .safe_update_status(&job.id, JobStatus::Pending, &state.actor)
        .await?;

    state.engine.audit().log(
        EventDraft::new(AuditEventType::DocumentUpload, AuditLevel::Info, "file upload")
            .user(state.actor.id.as_str())
            .resource(source.id.as_str())
            .details(serde_json::json!({ "file_name": file_name, "bytes": content.len() })),
    );

    let job_id = job.id.clone();
    let state_task = state.clone();
    tokio::spawn(async move {
        run_ingestion(state_task, source, job_id, file_name, mime_type, content).await;
    });

    Ok((StatusCode::CREATED, Json(job)))
}

async fn run_ingestion(
    state: AppState,
    source: Source,
    job_id: String,
    file_name: String,
    mime_type: Option<String>,
    content: Vec<u8>,
) {
    let jobs = state.engine.jobs().clone();
    let actor = state.actor.clone();
    let started = std::time::Instant::now();

    if let Err(e) = jobs
        .safe_update_status(&job_id, JobStatus::Running, &actor)
        .await
    {
        tracing::error!(job_id, "could not start ingestion job: {e}");
        return;
    }

    let outcome = state
        .ingestor
        .ingest_file(&source, &file_name, mime_type.as_deref(), &content, &actor)
        .await;

    match outcome {
        Ok(outcome) => {
            if let Err(e) = jobs
                .add_job_usage(&job_id, outcome.usage, None, &actor)
                .await
            {
                tracing::warn!(job_id, "usage record failed: {e}");
            }
            let _ = jobs
                .set_job_metadata(
                    &job_id,
                    serde_json::json!({
                        "source_id": source.id,
                        "file_id": outcome.file.id,
                        "file_name": file_name,
                        "passage_count": outcome.passage_count,
                    }),
                    &actor,
                )
                .await;
            let _ = jobs
                .safe_update_status(&job_id, JobStatus::Completed, &actor)
                .await;
            state.engine.audit().log(
                EventDraft::new(
                    AuditEventType::DocumentProcessing,
                    AuditLevel::Info,
                    "document ingested",
                )
                .user(actor.id.as_str())
                .resource(source.id.as_str())
                .details(serde_json::json!({
                    "file_name": file_name,
                    "passages": outcome.passage_count,
                }))
                .response_time(started.elapsed().as_millis() as u64),
            );
        }
        Err(e) => {
            let _ = jobs
                .set_job_metadata(
                    &job_id,
                    serde_json::json!({
                        "source_id": source.id,
                        "file_name": file_name,
                        "error": e.to_string(),
                    }),
                    &actor,
                )
                .await;
            let _ = jobs
                .safe_update_status(&job_id, JobStatus::Failed, &actor)
                .await;
            state.engine.audit().log(
                EventDraft::new(
                    AuditEventType::DocumentProcessing,
                    AuditLevel::Error,
                    "document ingestion failed",
                )
                .user(actor.id.as_str())
                .resource(source.id.as_str())
                .failed(e.to_string())
                .response_time(started.elapsed().as_millis() as u64),
            );
        }
    }
}
