//! Per-agent turn serialization. Turns on the same agent run one at a time
//! to keep the message history linear; turns on different agents are
//! independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use engram_schema::{EngramError, Result};
use tokio::sync::OwnedMutexGuard;

#[derive(Clone, Default)]
pub struct SessionLockManager {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("session lock table");
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Queue behind any running turn on the same agent.
    pub async fn acquire(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(agent_id).lock_owned().await
    }

    /// Fail fast instead of queuing.
    pub fn try_acquire(&self, agent_id: &str) -> Result<OwnedMutexGuard<()>> {
        self.lock_for(agent_id).try_lock_owned().map_err(|_| {
            EngramError::conflict(format!("a turn is already running on agent {agent_id}"))
        })
    }
}
