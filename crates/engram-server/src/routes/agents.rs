use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_core::{CreateAgentRequest, MemoryBlockSeed};
use engram_schema::{Agent, EmbeddingConfig, LlmConfig, MemoryBlock};
use engram_store::Page;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateAgentBody {
    pub name: Option<String>,
    #[serde(default)]
    pub memory_blocks: Vec<MemoryBlockBody>,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    #[serde(default)]
    pub tool_ids: Option<Vec<String>>,
    #[serde(default)]
    pub source_ids: Option<Vec<String>>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Deserialize)]
pub struct MemoryBlockBody {
    pub label: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_limit() -> usize {
    50
}

fn default_ascending() -> bool {
    true
}

impl ListQuery {
    pub fn page(&self) -> Page {
        Page {
            before: self.before.clone(),
            after: self.after.clone(),
            limit: self.limit,
            ascending: self.ascending,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_agent).get(list_agents))
        .route("/{id}", get(get_agent).delete(delete_agent))
        .route("/{id}/memory", get(get_agent_memory))
        .route("/{id}/sources/{source_id}", post(attach_source))
}

async fn create_agent(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state
        .engine
        .create_agent(
            CreateAgentRequest {
                name: body.name,
                memory_blocks: body
                    .memory_blocks
                    .into_iter()
                    .map(|b| MemoryBlockSeed {
                        label: b.label,
                        value: b.value,
                        limit: b.limit,
                    })
                    .collect(),
                llm_config: body.llm_config,
                embedding_config: body.embedding_config,
                tool_names: body.tool_ids,
                source_ids: body.source_ids,
                top_k: body.top_k,
            },
            &state.actor,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let agents = state.engine.list_agents(&state.actor, query.page()).await?;
    Ok(Json(agents))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    let agent = state.engine.get_agent(&id, &state.actor).await?;
    Ok(Json(agent))
}

async fn get_agent_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MemoryBlock>>, ApiError> {
    let blocks = state.engine.list_memory_blocks(&id, &state.actor).await?;
    Ok(Json(blocks))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.delete_agent(&id, &state.actor).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn attach_source(
    State(state): State<AppState>,
    Path((id, source_id)): Path<(String, String)>,
) -> Result<Json<Agent>, ApiError> {
    state
        .engine
        .attach_source(&id, &source_id, &state.actor)
        .await?;
    let agent = state.engine.get_agent(&id, &state.actor).await?;
    Ok(Json(agent))
}
