use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngramError>;

/// Error taxonomy surfaced through the API. Each variant maps to a stable
/// code and an HTTP status at the server boundary.
#[derive(Debug, Error)]
pub enum EngramError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngramError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EngramError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngramError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngramError::Conflict(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        EngramError::FailedPrecondition(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        EngramError::ResourceExhausted(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        EngramError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngramError::Internal(msg.into())
    }

    /// Stable code string used in API error bodies and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            EngramError::InvalidArgument(_) => "invalid_argument",
            EngramError::NotFound(_) => "not_found",
            EngramError::Conflict(_) => "conflict",
            EngramError::FailedPrecondition(_) => "failed_precondition",
            EngramError::ResourceExhausted(_) => "resource_exhausted",
            EngramError::DeadlineExceeded => "deadline_exceeded",
            EngramError::Cancelled => "cancelled",
            EngramError::Unavailable(_) => "unavailable",
            EngramError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        EngramError::Internal(format!("json: {e}"))
    }
}
