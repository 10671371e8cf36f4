pub mod analyzer;
pub mod events;
pub mod query;
pub mod report;
pub mod sink;

pub use analyzer::{AnalyzerConfig, ContentAnalyzer, RiskLevel};
pub use events::{AuditEvent, AuditEventType, AuditLevel, EventDraft};
pub use query::{AuditQuery, EventFilter, WindowAggregates};
pub use report::{generate_report, ReportFormat};
pub use sink::{AuditConfig, AuditSink, RealtimeStats};
