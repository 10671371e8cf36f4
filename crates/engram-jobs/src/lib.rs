//! Job lifecycle: the guarded state machine, message and step association,
//! usage aggregation, and the terminal callback POST.
//!
//! ```text
//!  created ──► pending ──► running ──► {completed, failed, cancelled}
//!               │                       (terminal)
//!               └──────────► cancelled
//! ```
//!
//! `safe_update_status` validates every transition against the current row
//! inside the same logical update; invalid transitions are reported as
//! `Skipped` rather than errors so callers stay idempotent.

use std::time::Duration;

use chrono::Utc;
use engram_schema::{
    id_prefix, new_id, Actor, Job, JobStatus, Message, MessageRole, Result, Step, UsageStats,
};
use engram_store::{JobFilter, Page, Store};
use serde::Serialize;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Job),
    /// The requested transition is not legal from the current state. The
    /// row is untouched.
    Skipped { current: JobStatus },
}

impl TransitionOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Clone)]
pub struct JobManager {
    store: Store,
    http: reqwest::Client,
}

impl JobManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
        }
    }

    pub async fn create_job(&self, job: Job) -> Result<Job> {
        self.store.insert_job(job).await
    }

    pub async fn get_job(&self, job_id: &str, actor: &Actor) -> Result<Job> {
        self.store.get_job(job_id, actor).await
    }

    pub async fn list_jobs(
        &self,
        actor: &Actor,
        page: Page,
        filter: JobFilter,
    ) -> Result<Vec<Job>> {
        self.store.list_jobs(actor, page, filter).await
    }

    pub async fn delete_job(&self, job_id: &str, actor: &Actor) -> Result<()> {
        self.store.hard_delete_job(job_id, actor).await
    }

    /// Attach metadata without touching the state machine.
    pub async fn set_job_metadata(
        &self,
        job_id: &str,
        metadata: serde_json::Value,
        actor: &Actor,
    ) -> Result<Job> {
        let mut job = self.store.get_job(job_id, actor).await?;
        job.metadata = metadata;
        self.store.update_job(job, actor).await
    }

    /// Guarded status advance. Allowed transitions:
    /// - any non-terminal -> terminal, exactly once
    /// - created -> pending (or any forward move out of created)
    /// - pending -> running
    ///
    /// On the first terminal transition `completed_at` is stamped and, when
    /// a callback URL is present, the callback is dispatched; its outcome is
    /// recorded on the row and never fails the transition.
    pub async fn safe_update_status(
        &self,
        job_id: &str,
        new_status: JobStatus,
        actor: &Actor,
    ) -> Result<TransitionOutcome> {
        let mut job = self.store.get_job(job_id, actor).await?;
        let current = job.status;

        let allowed = (new_status.is_terminal() && !current.is_terminal())
            || (current == JobStatus::Created && new_status != JobStatus::Created)
            || (current == JobStatus::Pending && new_status == JobStatus::Running);
        if !allowed {
            tracing::warn!(
                job_id,
                from = current.as_str(),
                to = new_status.as_str(),
                "skipped, invalid job status transition"
            );
            return Ok(TransitionOutcome::Skipped { current });
        }

        job.status = new_status;
        if new_status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
            if job.callback_url.is_some() {
                self.dispatch_callback(&mut job).await;
            }
        }
        let updated = self.store.update_job(job, actor).await?;
        Ok(TransitionOutcome::Applied(updated))
    }

    /// POST `{job_id, status, completed_at, metadata}` to the callback URL
    /// with a bounded timeout. Failures are recorded on the job and
    /// swallowed.
    async fn dispatch_callback(&self, job: &mut Job) {
        let Some(url) = job.callback_url.clone() else {
            return;
        };
        let payload = CallbackPayload {
            job_id: &job.id,
            status: job.status.as_str(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            metadata: &job.metadata,
        };
        let result = self
            .http
            .post(&url)
            .timeout(CALLBACK_TIMEOUT)
            .json(&payload)
            .send()
            .await;
        job.callback_sent_at = Some(Utc::now());
        match result {
            Ok(resp) => {
                job.callback_status_code = Some(resp.status().as_u16());
            }
            Err(e) => {
                let message = format!("failed to dispatch callback for job {} to {url}: {e}", job.id);
                tracing::error!("{message}");
                job.callback_error = Some(message);
            }
        }
    }

    // ============================================================
    // Message association
    // ============================================================

    pub async fn add_messages_to_job(
        &self,
        job_id: &str,
        message_ids: Vec<String>,
        actor: &Actor,
    ) -> Result<()> {
        // Verify the job exists and is visible before associating.
        self.store.get_job(job_id, actor).await?;
        self.store.insert_job_messages(job_id, message_ids).await
    }

    pub async fn get_job_messages(
        &self,
        job_id: &str,
        actor: &Actor,
        page: Page,
        role: Option<MessageRole>,
    ) -> Result<Vec<Message>> {
        self.store.get_job(job_id, actor).await?;
        self.store.list_job_messages(job_id, actor, page, role).await
    }

    // ============================================================
    // Steps and usage
    // ============================================================

    pub async fn add_job_usage(
        &self,
        job_id: &str,
        usage: UsageStats,
        agent_id: Option<&str>,
        actor: &Actor,
    ) -> Result<Step> {
        self.store.get_job(job_id, actor).await?;
        let step = Step {
            id: new_id(id_prefix::STEP),
            organization_id: actor.organization_id.clone(),
            job_id: job_id.to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            created_at: Utc::now(),
        };
        self.store.insert_step(step).await
    }

    pub async fn get_job_usage(&self, job_id: &str, actor: &Actor) -> Result<UsageStats> {
        self.store.get_job(job_id, actor).await?;
        self.store.sum_job_usage(job_id, actor).await
    }

    pub async fn get_job_steps(&self, job_id: &str, actor: &Actor) -> Result<Vec<Step>> {
        self.store.get_job(job_id, actor).await?;
        self.store.list_steps(job_id, actor).await
    }
}

#[derive(Serialize)]
struct CallbackPayload<'a> {
    job_id: &'a str,
    status: &'a str,
    completed_at: Option<String>,
    metadata: &'a serde_json::Value,
}
