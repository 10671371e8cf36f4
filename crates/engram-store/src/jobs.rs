//! Row-level job, job_messages, and steps access. The transition guards and
//! callback dispatch live in the jobs crate; everything here is plain CRUD
//! scoped to the requesting user.

use chrono::Utc;
use engram_schema::{
    Actor, EngramError, Job, JobStatus, JobType, Message, MessageRole, Result, Step, UsageStats,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::messages::row_to_message;
use crate::{map_db_err, parse_datetime, parse_opt_datetime, Page, Store};

const JOB_COLUMNS: &str = "id, organization_id, user_id, job_type, status, metadata, \
     request_config, callback_url, completed_at, callback_sent_at, callback_status_code, \
     callback_error, created_at, updated_at, is_deleted";

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub job_type: Option<JobType>,
    pub source_id: Option<String>,
}

impl Store {
    pub async fn insert_job(&self, job: Job) -> Result<Job> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO jobs (
                    id, organization_id, user_id, job_type, status, metadata, request_config,
                    callback_url, completed_at, callback_sent_at, callback_status_code,
                    callback_error, created_at, updated_at, is_deleted
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0)
                "#,
                params![
                    job.id,
                    job.organization_id,
                    job.user_id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.metadata.to_string(),
                    job.request_config.to_string(),
                    job.callback_url,
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.callback_sent_at.map(|t| t.to_rfc3339()),
                    job.callback_status_code.map(|c| c as i64),
                    job.callback_error,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;
            Ok(job)
        })
        .await
    }

    /// Jobs are scoped to the user that created them, not just the
    /// organization.
    pub async fn get_job(&self, job_id: &str, actor: &Actor) -> Result<Job> {
        let job_id = job_id.to_string();
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE id = ?1 AND organization_id = ?2 AND user_id = ?3 AND is_deleted = 0"
            );
            conn.query_row(
                &sql,
                params![job_id, actor.organization_id, actor.id],
                row_to_job,
            )
            .optional()
            .map_err(map_db_err)?
            .transpose()?
            .ok_or_else(|| EngramError::not_found(format!("job {job_id}")))
        })
        .await
    }

    pub async fn update_job(&self, job: Job, actor: &Actor) -> Result<Job> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE jobs SET status = ?1, metadata = ?2, request_config = ?3, \
                     callback_url = ?4, completed_at = ?5, callback_sent_at = ?6, \
                     callback_status_code = ?7, callback_error = ?8, updated_at = ?9 \
                     WHERE id = ?10 AND organization_id = ?11 AND user_id = ?12 AND is_deleted = 0",
                    params![
                        job.status.as_str(),
                        job.metadata.to_string(),
                        job.request_config.to_string(),
                        job.callback_url,
                        job.completed_at.map(|t| t.to_rfc3339()),
                        job.callback_sent_at.map(|t| t.to_rfc3339()),
                        job.callback_status_code.map(|c| c as i64),
                        job.callback_error,
                        now,
                        job.id,
                        actor.organization_id,
                        actor.id,
                    ],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!("job {}", job.id)));
            }
            Ok(job)
        })
        .await
    }

    pub async fn list_jobs(
        &self,
        actor: &Actor,
        page: Page,
        filter: JobFilter,
    ) -> Result<Vec<Job>> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE organization_id = ? AND is_deleted = 0 AND user_id = ?"
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> =
                vec![Box::new(actor.organization_id), Box::new(actor.id)];
            if let Some(job_type) = filter.job_type {
                sql.push_str(" AND job_type = ?");
                boxed.push(Box::new(job_type.as_str().to_string()));
            }
            if let Some(statuses) = &filter.statuses {
                if !statuses.is_empty() {
                    let placeholders = vec!["?"; statuses.len()].join(", ");
                    sql.push_str(&format!(" AND status IN ({placeholders})"));
                    for status in statuses {
                        boxed.push(Box::new(status.as_str().to_string()));
                    }
                }
            }
            if let Some(source_id) = &filter.source_id {
                sql.push_str(" AND json_extract(metadata, '$.source_id') = ?");
                boxed.push(Box::new(source_id.clone()));
            }
            page.apply("jobs", &mut sql, &mut boxed);
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(crate::params_from(&boxed).as_slice(), row_to_job)
                .map_err(map_db_err)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row.map_err(map_db_err)??);
            }
            Ok(jobs)
        })
        .await
    }

    pub async fn hard_delete_job(&self, job_id: &str, actor: &Actor) -> Result<()> {
        let job_id = job_id.to_string();
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            let deleted = tx
                .execute(
                    "DELETE FROM jobs WHERE id = ?1 AND organization_id = ?2 AND user_id = ?3",
                    params![job_id, actor.organization_id, actor.id],
                )
                .map_err(map_db_err)?;
            if deleted == 0 {
                return Err(EngramError::not_found(format!("job {job_id}")));
            }
            tx.execute("DELETE FROM job_messages WHERE job_id = ?1", params![job_id])
                .map_err(map_db_err)?;
            tx.execute("DELETE FROM steps WHERE job_id = ?1", params![job_id])
                .map_err(map_db_err)?;
            tx.commit().map_err(map_db_err)?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // Message association
    // ============================================================

    /// Each message belongs to at most one job; re-associating an already
    /// claimed message is a `Conflict`.
    pub async fn insert_job_messages(
        &self,
        job_id: &str,
        message_ids: Vec<String>,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            let now = Utc::now().to_rfc3339();
            for message_id in &message_ids {
                tx.execute(
                    "INSERT INTO job_messages (job_id, message_id, created_at) VALUES (?1, ?2, ?3)",
                    params![job_id, message_id, now],
                )
                .map_err(map_db_err)?;
            }
            tx.commit().map_err(map_db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn list_job_messages(
        &self,
        job_id: &str,
        actor: &Actor,
        page: Page,
        role: Option<MessageRole>,
    ) -> Result<Vec<Message>> {
        let job_id = job_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT m.id, m.organization_id, m.agent_id, m.role, m.content, m.tool_calls, \
                 m.tool_call_id, m.step_id, m.created_at, m.updated_at, m.is_deleted, m.created_by \
                 FROM messages m JOIN job_messages jm ON m.id = jm.message_id \
                 WHERE jm.job_id = ? AND m.organization_id = ? AND m.is_deleted = 0",
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> =
                vec![Box::new(job_id), Box::new(org)];
            if let Some(role) = role {
                sql.push_str(" AND m.role = ?");
                boxed.push(Box::new(role.as_str().to_string()));
            }
            // Cursor over the joined message rows.
            let (after_op, before_op) = if page.ascending { (">", "<") } else { ("<", ">") };
            if let Some(after) = &page.after {
                sql.push_str(&format!(
                    " AND (m.created_at, m.id) {after_op} (SELECT created_at, id FROM messages WHERE id = ?)"
                ));
                boxed.push(Box::new(after.clone()));
            }
            if let Some(before) = &page.before {
                sql.push_str(&format!(
                    " AND (m.created_at, m.id) {before_op} (SELECT created_at, id FROM messages WHERE id = ?)"
                ));
                boxed.push(Box::new(before.clone()));
            }
            let dir = if page.ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY m.created_at {dir}, m.id {dir} LIMIT ?"));
            boxed.push(Box::new(page.limit as i64));

            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(crate::params_from(&boxed).as_slice(), row_to_message)
                .map_err(map_db_err)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.map_err(map_db_err)??);
            }
            Ok(messages)
        })
        .await
    }

    // ============================================================
    // Steps and usage
    // ============================================================

    pub async fn insert_step(&self, step: Step) -> Result<Step> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO steps (
                    id, organization_id, job_id, agent_id, prompt_tokens,
                    completion_tokens, total_tokens, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    step.id,
                    step.organization_id,
                    step.job_id,
                    step.agent_id,
                    step.prompt_tokens as i64,
                    step.completion_tokens as i64,
                    step.total_tokens as i64,
                    step.created_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;
            Ok(step)
        })
        .await
    }

    pub async fn list_steps(&self, job_id: &str, actor: &Actor) -> Result<Vec<Step>> {
        let job_id = job_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, organization_id, job_id, agent_id, prompt_tokens, \
                     completion_tokens, total_tokens, created_at FROM steps \
                     WHERE job_id = ?1 AND organization_id = ?2 \
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![job_id, org], row_to_step)
                .map_err(map_db_err)?;
            let mut steps = Vec::new();
            for row in rows {
                steps.push(row.map_err(map_db_err)??);
            }
            Ok(steps)
        })
        .await
    }

    /// Sum a job's step counters. Equals the aggregate of `list_steps`.
    pub async fn sum_job_usage(&self, job_id: &str, actor: &Actor) -> Result<UsageStats> {
        let job_id = job_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let (prompt, completion, total, count): (i64, i64, i64, i64) = conn
                .query_row(
                    "SELECT COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0), \
                     COALESCE(SUM(total_tokens), 0), COUNT(*) FROM steps \
                     WHERE job_id = ?1 AND organization_id = ?2",
                    params![job_id, org],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .map_err(map_db_err)?;
            Ok(UsageStats {
                prompt_tokens: prompt as u64,
                completion_tokens: completion as u64,
                total_tokens: total as u64,
                step_count: count as u64,
            })
        })
        .await
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Result<Job>> {
    Ok(build_job(row))
}

fn build_job(row: &Row<'_>) -> Result<Job> {
    let job_type_raw: String = row.get(3).map_err(map_db_err)?;
    let status_raw: String = row.get(4).map_err(map_db_err)?;
    let metadata_raw: String = row.get(5).map_err(map_db_err)?;
    let request_config_raw: String = row.get(6).map_err(map_db_err)?;
    let created_raw: String = row.get(12).map_err(map_db_err)?;
    let updated_raw: String = row.get(13).map_err(map_db_err)?;
    Ok(Job {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        user_id: row.get(2).map_err(map_db_err)?,
        job_type: JobType::parse(&job_type_raw)
            .ok_or_else(|| EngramError::internal(format!("unknown job type {job_type_raw:?}")))?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| EngramError::internal(format!("unknown job status {status_raw:?}")))?,
        metadata: serde_json::from_str(&metadata_raw)?,
        request_config: serde_json::from_str(&request_config_raw)?,
        callback_url: row.get(7).map_err(map_db_err)?,
        completed_at: parse_opt_datetime(row.get(8).map_err(map_db_err)?)?,
        callback_sent_at: parse_opt_datetime(row.get(9).map_err(map_db_err)?)?,
        callback_status_code: row
            .get::<_, Option<i64>>(10)
            .map_err(map_db_err)?
            .map(|c| c as u16),
        callback_error: row.get(11).map_err(map_db_err)?,
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(14).map_err(map_db_err)? != 0,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<Result<Step>> {
    Ok(build_step(row))
}

fn build_step(row: &Row<'_>) -> Result<Step> {
    let created_raw: String = row.get(7).map_err(map_db_err)?;
    Ok(Step {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        job_id: row.get(2).map_err(map_db_err)?,
        agent_id: row.get(3).map_err(map_db_err)?,
        prompt_tokens: row.get::<_, i64>(4).map_err(map_db_err)? as u64,
        completion_tokens: row.get::<_, i64>(5).map_err(map_db_err)? as u64,
        total_tokens: row.get::<_, i64>(6).map_err(map_db_err)? as u64,
        created_at: parse_datetime(&created_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_schema::{id_prefix, new_id};

    fn actor() -> Actor {
        Actor::new("user-1", "org-1")
    }

    fn job() -> Job {
        Job::new(&actor(), JobType::Job)
    }

    fn step(job_id: &str, tokens: u64) -> Step {
        Step {
            id: new_id(id_prefix::STEP),
            organization_id: "org-1".into(),
            job_id: job_id.into(),
            agent_id: None,
            prompt_tokens: tokens,
            completion_tokens: tokens / 2,
            total_tokens: tokens + tokens / 2,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn job_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut j = job();
        j.metadata = serde_json::json!({ "source_id": "source-1" });
        let id = j.id.clone();
        store.insert_job(j).await.unwrap();

        let loaded = store.get_job(&id, &actor()).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Created);
        assert_eq!(loaded.metadata["source_id"], "source-1");
    }

    #[tokio::test]
    async fn job_hidden_from_other_users() {
        let store = Store::open_in_memory().unwrap();
        let j = job();
        let id = j.id.clone();
        store.insert_job(j).await.unwrap();

        let other = Actor::new("user-2", "org-1");
        assert_eq!(
            store.get_job(&id, &other).await.unwrap_err().code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status_and_source() {
        let store = Store::open_in_memory().unwrap();
        let mut running = job();
        running.status = JobStatus::Running;
        running.metadata = serde_json::json!({ "source_id": "source-1" });
        let mut done = job();
        done.status = JobStatus::Completed;
        store.insert_job(running.clone()).await.unwrap();
        store.insert_job(done).await.unwrap();

        let filtered = store
            .list_jobs(
                &actor(),
                Page::ascending(10),
                JobFilter {
                    statuses: Some(vec![JobStatus::Running]),
                    job_type: Some(JobType::Job),
                    source_id: Some("source-1".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, running.id);
    }

    #[tokio::test]
    async fn message_belongs_to_at_most_one_job() {
        let store = Store::open_in_memory().unwrap();
        let first = job();
        let second = job();
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        store.insert_job(first).await.unwrap();
        store.insert_job(second).await.unwrap();

        store
            .insert_job_messages(&first_id, vec!["message-1".into()])
            .await
            .unwrap();
        let err = store
            .insert_job_messages(&second_id, vec!["message-1".into()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn usage_sums_match_steps() {
        let store = Store::open_in_memory().unwrap();
        let j = job();
        let job_id = j.id.clone();
        store.insert_job(j).await.unwrap();

        store.insert_step(step(&job_id, 100)).await.unwrap();
        store.insert_step(step(&job_id, 40)).await.unwrap();

        let usage = store.sum_job_usage(&job_id, &actor()).await.unwrap();
        assert_eq!(usage.prompt_tokens, 140);
        assert_eq!(usage.completion_tokens, 70);
        assert_eq!(usage.total_tokens, 210);
        assert_eq!(usage.step_count, 2);

        let steps = store.list_steps(&job_id, &actor()).await.unwrap();
        let total: u64 = steps.iter().map(|s| s.total_tokens).sum();
        assert_eq!(total, usage.total_tokens);
    }

    #[tokio::test]
    async fn empty_usage_is_zero() {
        let store = Store::open_in_memory().unwrap();
        let j = job();
        let job_id = j.id.clone();
        store.insert_job(j).await.unwrap();
        let usage = store.sum_job_usage(&job_id, &actor()).await.unwrap();
        assert_eq!(usage, UsageStats::default());
    }
}
