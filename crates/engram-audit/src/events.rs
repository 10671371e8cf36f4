use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    UserSessionStart,
    UserSessionEnd,
    DocumentUpload,
    DocumentAccess,
    DocumentProcessing,
    RagQuery,
    RagSearch,
    RagResponse,
    AgentCreation,
    AgentMessage,
    AgentMemoryAccess,
    FinancialDataAccess,
    RiskAssessmentQuery,
    ProductInfoQuery,
    ComplianceCheck,
    SystemError,
    Authentication,
    PermissionCheck,
    EmbeddingGeneration,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::UserSessionStart => "USER_SESSION_START",
            AuditEventType::UserSessionEnd => "USER_SESSION_END",
            AuditEventType::DocumentUpload => "DOCUMENT_UPLOAD",
            AuditEventType::DocumentAccess => "DOCUMENT_ACCESS",
            AuditEventType::DocumentProcessing => "DOCUMENT_PROCESSING",
            AuditEventType::RagQuery => "RAG_QUERY",
            AuditEventType::RagSearch => "RAG_SEARCH",
            AuditEventType::RagResponse => "RAG_RESPONSE",
            AuditEventType::AgentCreation => "AGENT_CREATION",
            AuditEventType::AgentMessage => "AGENT_MESSAGE",
            AuditEventType::AgentMemoryAccess => "AGENT_MEMORY_ACCESS",
            AuditEventType::FinancialDataAccess => "FINANCIAL_DATA_ACCESS",
            AuditEventType::RiskAssessmentQuery => "RISK_ASSESSMENT_QUERY",
            AuditEventType::ProductInfoQuery => "PRODUCT_INFO_QUERY",
            AuditEventType::ComplianceCheck => "COMPLIANCE_CHECK",
            AuditEventType::SystemError => "SYSTEM_ERROR",
            AuditEventType::Authentication => "AUTHENTICATION",
            AuditEventType::PermissionCheck => "PERMISSION_CHECK",
            AuditEventType::EmbeddingGeneration => "EMBEDDING_GENERATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    /// Event types whose payload goes through content analysis.
    pub fn analyzes_content(&self) -> bool {
        matches!(
            self,
            AuditEventType::RagQuery
                | AuditEventType::FinancialDataAccess
                | AuditEventType::ProductInfoQuery
                | AuditEventType::RiskAssessmentQuery
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
    Security,
    Compliance,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Warn => "WARN",
            AuditLevel::Error => "ERROR",
            AuditLevel::Security => "SECURITY",
            AuditLevel::Compliance => "COMPLIANCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(AuditLevel::Info),
            "WARN" => Some(AuditLevel::Warn),
            "ERROR" => Some(AuditLevel::Error),
            "SECURITY" => Some(AuditLevel::Security),
            "COMPLIANCE" => Some(AuditLevel::Compliance),
            _ => None,
        }
    }
}

/// One row in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub level: AuditLevel,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub success: bool,
    pub risk_score: u8,
    pub compliance_flags: Vec<String>,
    pub category: Option<String>,
    /// SHA-256 prefix of the analyzed content, when any was attached.
    pub data_hash: Option<String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// What callers hand to the sink; id, timestamp, risk score, flags, and the
/// content hash are computed on capture.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: AuditEventType,
    pub level: AuditLevel,
    pub action: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub details: serde_json::Value,
    pub success: bool,
    /// Raw content to analyze for risk/compliance; only its hash is stored.
    pub data_content: Option<String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl EventDraft {
    pub fn new(
        event_type: AuditEventType,
        level: AuditLevel,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            level,
            action: action.into(),
            user_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            resource: None,
            details: serde_json::Value::Null,
            success: true,
            data_content: None,
            response_time_ms: None,
            error_message: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.data_content = Some(content.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }
}
