//! Read side of the audit store. Queries open their own connection so the
//! sink's writer connection never contends with the HTTP surface.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use engram_schema::{EngramError, Result};
use rusqlite::{params_from_iter, Connection, Row};

use crate::events::{AuditEvent, AuditEventType, AuditLevel};

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<AuditEventType>,
    pub min_risk: Option<u8>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AuditQuery {
    db_path: PathBuf,
}

impl AuditQuery {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .map_err(|e| EngramError::internal(format!("open audit db: {e}")))
    }

    /// Newest first, filtered, at most `limit` rows.
    pub async fn list_events(&self, filter: EventFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let mut sql = String::from(
                "SELECT id, timestamp, event_type, level, user_id, session_id, ip_address, \
                 user_agent, resource, action, details, success, risk_score, compliance_flags, \
                 category, data_hash, response_time_ms, error_message \
                 FROM audit_events WHERE 1 = 1",
            );
            let mut args: Vec<String> = Vec::new();
            if let Some(event_type) = filter.event_type {
                sql.push_str(" AND event_type = ?");
                args.push(event_type.as_str().to_string());
            }
            if let Some(min_risk) = filter.min_risk {
                sql.push_str(" AND risk_score >= ?");
                args.push(min_risk.to_string());
            }
            if let Some(user_id) = &filter.user_id {
                sql.push_str(" AND user_id = ?");
                args.push(user_id.clone());
            }
            if let Some(since) = filter.since {
                sql.push_str(" AND timestamp >= ?");
                args.push(since.to_rfc3339());
            }
            sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT {limit}"));

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| EngramError::internal(format!("audit query: {e}")))?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), row_to_event)
                .map_err(|e| EngramError::internal(format!("audit query: {e}")))?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row.map_err(|e| EngramError::internal(format!("audit row: {e}")))??);
            }
            Ok(events)
        })
        .await
        .map_err(|e| EngramError::internal(format!("blocking task: {e}")))?
    }

    /// Aggregates over a time window, the raw material for reports.
    pub async fn window_aggregates(&self, since: DateTime<Utc>) -> Result<WindowAggregates> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.open()?;
            let cutoff = since.to_rfc3339();
            let internal = |e: rusqlite::Error| EngramError::internal(format!("audit query: {e}"));

            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM audit_events WHERE timestamp >= ?1",
                    [&cutoff],
                    |r| r.get(0),
                )
                .map_err(internal)?;

            let (high, medium, low): (i64, i64, i64) = conn
                .query_row(
                    "SELECT \
                     COALESCE(SUM(CASE WHEN risk_score >= 70 THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN risk_score >= 40 AND risk_score < 70 THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN risk_score < 40 THEN 1 ELSE 0 END), 0) \
                     FROM audit_events WHERE timestamp >= ?1",
                    [&cutoff],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .map_err(internal)?;

            let failures: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM audit_events WHERE timestamp >= ?1 AND success = 0",
                    [&cutoff],
                    |r| r.get(0),
                )
                .map_err(internal)?;

            let compliance_violations: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM audit_events \
                     WHERE timestamp >= ?1 AND compliance_flags IS NOT NULL \
                     AND compliance_flags != '[]'",
                    [&cutoff],
                    |r| r.get(0),
                )
                .map_err(internal)?;

            let categorized: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM audit_events \
                     WHERE timestamp >= ?1 AND category IS NOT NULL",
                    [&cutoff],
                    |r| r.get(0),
                )
                .map_err(internal)?;

            let by_type = group_counts(
                &conn,
                "SELECT event_type, COUNT(*) FROM audit_events \
                 WHERE timestamp >= ?1 GROUP BY event_type ORDER BY COUNT(*) DESC",
                &cutoff,
            )?;
            let by_user = group_counts(
                &conn,
                "SELECT COALESCE(user_id, '-'), COUNT(*) FROM audit_events \
                 WHERE timestamp >= ?1 GROUP BY user_id ORDER BY COUNT(*) DESC",
                &cutoff,
            )?;
            let by_hour = group_counts(
                &conn,
                "SELECT strftime('%H', timestamp), COUNT(*) FROM audit_events \
                 WHERE timestamp >= ?1 GROUP BY strftime('%H', timestamp) ORDER BY 1",
                &cutoff,
            )?;
            let by_category = group_counts(
                &conn,
                "SELECT category, COUNT(*) FROM audit_events \
                 WHERE timestamp >= ?1 AND category IS NOT NULL \
                 GROUP BY category ORDER BY COUNT(*) DESC",
                &cutoff,
            )?;

            Ok(WindowAggregates {
                total_events: total as u64,
                high_risk_events: high as u64,
                medium_risk_events: medium as u64,
                low_risk_events: low as u64,
                failed_events: failures as u64,
                compliance_violations: compliance_violations as u64,
                categorized_events: categorized as u64,
                by_type,
                by_user,
                by_hour,
                by_category,
            })
        })
        .await
        .map_err(|e| EngramError::internal(format!("blocking task: {e}")))?
    }
}

fn group_counts(
    conn: &Connection,
    sql: &str,
    cutoff: &str,
) -> Result<Vec<(String, u64)>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| EngramError::internal(format!("audit query: {e}")))?;
    let rows = stmt
        .query_map([cutoff], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| EngramError::internal(format!("audit query: {e}")))?;
    let mut out = Vec::new();
    for row in rows {
        let (key, count) = row.map_err(|e| EngramError::internal(format!("audit row: {e}")))?;
        out.push((key, count as u64));
    }
    Ok(out)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WindowAggregates {
    pub total_events: u64,
    pub high_risk_events: u64,
    pub medium_risk_events: u64,
    pub low_risk_events: u64,
    pub failed_events: u64,
    pub compliance_violations: u64,
    pub categorized_events: u64,
    pub by_type: Vec<(String, u64)>,
    pub by_user: Vec<(String, u64)>,
    pub by_hour: Vec<(String, u64)>,
    pub by_category: Vec<(String, u64)>,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Result<AuditEvent>> {
    Ok(build_event(row))
}

fn build_event(row: &Row<'_>) -> Result<AuditEvent> {
    let internal = |e: rusqlite::Error| EngramError::internal(format!("audit row: {e}"));
    let timestamp_raw: String = row.get(1).map_err(internal)?;
    let event_type_raw: String = row.get(2).map_err(internal)?;
    let level_raw: String = row.get(3).map_err(internal)?;
    let details_raw: Option<String> = row.get(10).map_err(internal)?;
    let flags_raw: Option<String> = row.get(13).map_err(internal)?;

    Ok(AuditEvent {
        id: row.get(0).map_err(internal)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_raw)
            .map_err(|e| EngramError::internal(format!("audit timestamp: {e}")))?
            .with_timezone(&Utc),
        event_type: AuditEventType::parse(&event_type_raw).ok_or_else(|| {
            EngramError::internal(format!("unknown audit event type {event_type_raw:?}"))
        })?,
        level: AuditLevel::parse(&level_raw)
            .ok_or_else(|| EngramError::internal(format!("unknown audit level {level_raw:?}")))?,
        user_id: row.get(4).map_err(internal)?,
        session_id: row.get(5).map_err(internal)?,
        ip_address: row.get(6).map_err(internal)?,
        user_agent: row.get(7).map_err(internal)?,
        resource: row.get(8).map_err(internal)?,
        action: row.get(9).map_err(internal)?,
        details: details_raw
            .map(|d| serde_json::from_str(&d))
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
        success: row.get::<_, i64>(11).map_err(internal)? != 0,
        risk_score: row.get::<_, i64>(12).map_err(internal)? as u8,
        compliance_flags: flags_raw
            .map(|f| serde_json::from_str(&f))
            .transpose()?
            .unwrap_or_default(),
        category: row.get(14).map_err(internal)?,
        data_hash: row.get(15).map_err(internal)?,
        response_time_ms: row
            .get::<_, Option<i64>>(16)
            .map_err(internal)?
            .map(|ms| ms as u64),
        error_message: row.get(17).map_err(internal)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use crate::sink::{AuditConfig, AuditSink};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn populated() -> (TempDir, AuditQuery) {
        let dir = TempDir::new().unwrap();
        let sink = AuditSink::open(AuditConfig::new(dir.path())).unwrap();
        sink.log(
            EventDraft::new(AuditEventType::RagSearch, AuditLevel::Info, "search")
                .user("user-1"),
        );
        sink.log(
            EventDraft::new(AuditEventType::DocumentProcessing, AuditLevel::Info, "ingest")
                .user("user-1"),
        );
        sink.log(
            EventDraft::new(AuditEventType::SystemError, AuditLevel::Error, "boom")
                .user("user-2")
                .failed("panic"),
        );
        assert!(sink.flush(Duration::from_secs(5)));
        sink.close();
        let query = AuditQuery::new(dir.path().join("audit.db"));
        (dir, query)
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let (_dir, query) = populated().await;
        let events = query
            .list_events(
                EventFilter {
                    event_type: Some(AuditEventType::RagSearch),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::RagSearch);
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn list_filters_by_min_risk() {
        let (_dir, query) = populated().await;
        let events = query
            .list_events(
                EventFilter {
                    min_risk: Some(70),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SystemError);
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let (_dir, query) = populated().await;
        let events = query.list_events(EventFilter::default(), 2).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn aggregates_cover_window() {
        let (_dir, query) = populated().await;
        let aggregates = query
            .window_aggregates(Utc::now() - chrono::TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(aggregates.total_events, 3);
        assert_eq!(aggregates.failed_events, 1);
        assert_eq!(aggregates.high_risk_events, 1);
        assert!(aggregates
            .by_type
            .iter()
            .any(|(t, n)| t == "RAG_SEARCH" && *n == 1));
        assert!(aggregates.by_user.iter().any(|(u, n)| u == "user-1" && *n == 2));
    }

    #[tokio::test]
    async fn aggregates_exclude_older_events() {
        let (_dir, query) = populated().await;
        let aggregates = query
            .window_aggregates(Utc::now() + chrono::TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(aggregates.total_events, 0);
    }
}
