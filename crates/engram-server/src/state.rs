use std::sync::Arc;

use engram_audit::AuditQuery;
use engram_core::AgentEngine;
use engram_memory::FileIngestor;
use engram_schema::Actor;

/// Shared handles for the request handlers. The engine carries the store,
/// passage manager, job manager, and audit sink.
#[derive(Clone)]
pub struct AppState {
    pub engine: AgentEngine,
    pub ingestor: Arc<FileIngestor>,
    pub audit_query: AuditQuery,
    /// The identity requests run as. A front proxy that authenticates users
    /// would swap this per request; the core API is identity-agnostic.
    pub actor: Actor,
}
