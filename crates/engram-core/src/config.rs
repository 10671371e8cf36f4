use std::time::Duration;

/// Bounds and defaults of the agent message loop. Populated from the
/// environment by the binary; the defaults here are the documented ones.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on LLM calls within one turn.
    pub max_steps: usize,
    /// Wall-clock deadline for one turn.
    pub turn_deadline: Duration,
    /// Retrieval width per scope when the agent doesn't pin its own.
    pub default_top_k: usize,
    /// Similarity floor for retrieval; -1.0 disables the cutoff.
    pub min_retrieval_similarity: f64,
    /// Second concurrent turn on one agent: queue behind the lock (default)
    /// or fail fast with a conflict.
    pub reject_concurrent_turns: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            turn_deadline: Duration::from_secs(120),
            default_top_k: 3,
            min_retrieval_similarity: -1.0,
            reject_concurrent_turns: false,
        }
    }
}
