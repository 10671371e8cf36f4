pub mod error;
pub mod turn;

pub use error::{EngramError, Result};
pub use turn::{InboundMessage, StopReason, StopReasonKind, StreamEvent, TurnRequest, TurnResponse};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate an entity id of the form `<prefix>-<uuid>`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

pub mod id_prefix {
    pub const ORGANIZATION: &str = "org";
    pub const USER: &str = "user";
    pub const AGENT: &str = "agent";
    pub const BLOCK: &str = "block";
    pub const MESSAGE: &str = "message";
    pub const PASSAGE: &str = "passage";
    pub const JOB: &str = "job";
    pub const RUN: &str = "run";
    pub const STEP: &str = "step";
    pub const SOURCE: &str = "source";
    pub const FILE: &str = "file";
    pub const TOOL: &str = "tool";
}

/// The identity performing a request. Every storage call is scoped to the
/// actor's organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub organization_id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
        }
    }
}

// ============================================================
// Model configuration
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    2048
}

impl LlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            endpoint: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Describes the embedding model a vector was produced with. The dimension
/// is pinned here and checked against every embedding written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub dim: usize,
}

impl EmbeddingConfig {
    pub fn new(model: impl Into<String>, dim: usize) -> Self {
        Self {
            model: model.into(),
            endpoint: None,
            dim,
        }
    }
}

// ============================================================
// Agents and memory
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    /// Retrieval width per scope; falls back to the server default when unset.
    #[serde(default)]
    pub top_k: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

/// A labeled editable text fragment composed into the system prompt.
/// Labels are unique within an agent; values are bounded by `limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: String,
    pub organization_id: String,
    pub agent_id: String,
    pub label: String,
    pub value: String,
    #[serde(default = "default_block_limit")]
    pub limit: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

pub fn default_block_limit() -> usize {
    5000
}

// ============================================================
// Messages
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One turn in an agent's conversation. Append-only; ordered by
/// `(created_at, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub organization_id: String,
    pub agent_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` role messages: the call this message answers.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Message {
    pub fn new(agent_id: &str, actor: &Actor, role: MessageRole, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(id_prefix::MESSAGE),
            organization_id: actor.organization_id.clone(),
            agent_id: agent_id.to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            step_id: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: Some(actor.id.clone()),
        }
    }
}

// ============================================================
// Passages
// ============================================================

/// Who a passage belongs to. Exactly one owner — a passage attached to both
/// an agent and a source is unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PassageOwner {
    Agent {
        agent_id: String,
    },
    Source {
        source_id: String,
        file_id: String,
        file_name: String,
    },
}

impl PassageOwner {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            PassageOwner::Agent { agent_id } => Some(agent_id),
            PassageOwner::Source { .. } => None,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            PassageOwner::Agent { .. } => None,
            PassageOwner::Source { source_id, .. } => Some(source_id),
        }
    }
}

/// One retrievable chunk with its embedding. Never mutated after creation
/// except for soft delete; the vector store mirror follows create/delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub organization_id: String,
    pub owner: PassageOwner,
    pub text: String,
    pub embedding: Vec<f32>,
    pub embedding_config: EmbeddingConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl Passage {
    /// Check the construction invariants: non-empty text and an embedding
    /// whose length matches the pinned dimension.
    pub fn validate(&self) -> Result<()> {
        if self.text.is_empty() {
            return Err(EngramError::invalid_argument("passage text must not be empty"));
        }
        if self.embedding.len() != self.embedding_config.dim {
            return Err(EngramError::invalid_argument(format!(
                "embedding length {} does not match configured dimension {}",
                self.embedding.len(),
                self.embedding_config.dim
            )));
        }
        Ok(())
    }
}

// ============================================================
// Sources and files
// ============================================================

/// A logical document collection, ingested once and attachable to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub embedding_config: EmbeddingConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub organization_id: String,
    pub source_id: String,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

// ============================================================
// Tools
// ============================================================

/// Persisted tool row: name plus the JSON schema advertised to the model.
/// Built-in executors live in code; rows without an executor are listable
/// but fail at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

// ============================================================
// Jobs and steps
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Job,
    Run,
    Batch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Job => "job",
            JobType::Run => "run",
            JobType::Batch => "batch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job" => Some(JobType::Job),
            "run" => Some(JobType::Run),
            "batch" => Some(JobType::Batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// An asynchronous unit of work with a tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub request_config: serde_json::Value,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub callback_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub callback_status_code: Option<u16>,
    #[serde(default)]
    pub callback_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Job {
    pub fn new(actor: &Actor, job_type: JobType) -> Self {
        let now = Utc::now();
        let prefix = match job_type {
            JobType::Run => id_prefix::RUN,
            _ => id_prefix::JOB,
        };
        Self {
            id: new_id(prefix),
            organization_id: actor.organization_id.clone(),
            user_id: actor.id.clone(),
            job_type,
            status: JobStatus::Created,
            metadata: serde_json::Value::Null,
            request_config: serde_json::Value::Null,
            callback_url: None,
            completed_at: None,
            callback_sent_at: None,
            callback_status_code: None,
            callback_error: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }
}

/// One LLM call within a job, carrying its token usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub organization_id: String,
    pub job_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregated token usage; summing a job's steps yields this.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub step_count: u64,
}

impl UsageStats {
    pub fn add(&mut self, other: &UsageStats) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.step_count += other.step_count;
    }
}
