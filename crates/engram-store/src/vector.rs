//! Vector mirror of the passage tables: one embedding row per passage id
//! with JSON metadata, answering top-K cosine similarity queries.
//!
//! Two column backends hide whether the engine can score vectors natively:
//! `SqliteVec` pushes the cosine distance into SQL through the sqlite-vec
//! scalar functions; `JsonText` scans dimension-matching rows and scores in
//! process. The backend is probed once at startup and callers never see the
//! difference.

use chrono::Utc;
use engram_schema::{EngramError, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{embedding_from_json, embedding_to_json, map_db_err, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    /// sqlite-vec is loaded; similarity is computed in SQL.
    SqliteVec,
    /// Text-encoded float arrays; similarity is computed in process.
    JsonText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub passage_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub agent_id: Option<String>,
    pub source_id: Option<String>,
}

impl VectorFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            source_id: None,
        }
    }

    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            agent_id: None,
            source_id: Some(source_id.into()),
        }
    }
}

#[derive(Clone)]
pub struct VectorStore {
    store: Store,
    backend: VectorBackend,
}

impl VectorStore {
    /// Probe the connection for sqlite-vec and pick the backend once.
    pub async fn new(store: Store) -> Result<Self> {
        let backend = store
            .with_conn(|conn| {
                let probe: std::result::Result<String, _> =
                    conn.query_row("SELECT vec_version()", [], |row| row.get(0));
                Ok(match probe {
                    Ok(_) => VectorBackend::SqliteVec,
                    Err(_) => VectorBackend::JsonText,
                })
            })
            .await?;
        if backend == VectorBackend::JsonText {
            tracing::warn!("sqlite-vec unavailable, falling back to in-process similarity");
        }
        Ok(Self { store, backend })
    }

    pub fn backend(&self) -> VectorBackend {
        self.backend
    }

    pub async fn upsert(
        &self,
        passage_id: &str,
        embedding: &[f32],
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(EngramError::invalid_argument("embedding must not be empty"));
        }
        let passage_id = passage_id.to_string();
        let payload = embedding_to_json(embedding);
        let dim = embedding.len() as i64;
        let metadata_json = metadata.map(|m| m.to_string());
        self.store
            .with_conn(move |conn| {
                upsert_row(conn, &passage_id, &payload, dim, metadata_json.as_deref())
            })
            .await
    }

    /// Atomic per batch: either every row lands or none do.
    pub async fn batch_upsert(
        &self,
        rows: Vec<(String, Vec<f32>, Option<serde_json::Value>)>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if rows.iter().any(|(_, embedding, _)| embedding.is_empty()) {
            return Err(EngramError::invalid_argument("embedding must not be empty"));
        }
        self.store
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction().map_err(map_db_err)?;
                for (passage_id, embedding, metadata) in &rows {
                    let payload = embedding_to_json(embedding);
                    let metadata_json = metadata.as_ref().map(|m| m.to_string());
                    upsert_row(
                        &tx,
                        passage_id,
                        &payload,
                        embedding.len() as i64,
                        metadata_json.as_deref(),
                    )?;
                }
                tx.commit().map_err(map_db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, passage_id: &str) -> Result<bool> {
        let passage_id = passage_id.to_string();
        self.store
            .with_conn(move |conn| {
                let deleted = conn
                    .execute(
                        "DELETE FROM passage_embeddings WHERE passage_id = ?1",
                        params![passage_id],
                    )
                    .map_err(map_db_err)?;
                Ok(deleted > 0)
            })
            .await
    }

    pub async fn get(
        &self,
        passage_id: &str,
    ) -> Result<Option<(Vec<f32>, Option<serde_json::Value>)>> {
        let passage_id = passage_id.to_string();
        self.store
            .with_conn(move |conn| {
                let row: Option<(String, Option<String>)> = conn
                    .query_row(
                        "SELECT embedding, metadata FROM passage_embeddings WHERE passage_id = ?1",
                        params![passage_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(map_db_err)?;
                match row {
                    Some((payload, metadata)) => {
                        let embedding = embedding_from_json(&payload)?;
                        let metadata = metadata
                            .map(|m| serde_json::from_str(&m))
                            .transpose()
                            .map_err(|e| EngramError::internal(format!("bad metadata: {e}")))?;
                        Ok(Some((embedding, metadata)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Top-K cosine similarity over rows whose stored dimension matches the
    /// query. Scores land in [-1, 1], sorted descending with id-ascending
    /// tie-break.
    pub async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        min_similarity: f64,
        filter: VectorFilter,
    ) -> Result<Vec<VectorMatch>> {
        if top_k == 0 || query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        let backend = self.backend;
        let query = query_embedding.to_vec();
        self.store
            .with_conn(move |conn| match backend {
                VectorBackend::SqliteVec => {
                    search_sql(conn, &query, top_k, min_similarity, &filter)
                }
                VectorBackend::JsonText => {
                    search_in_process(conn, &query, top_k, min_similarity, &filter)
                }
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.store
            .with_conn(|conn| {
                let n: i64 = conn
                    .query_row("SELECT COUNT(*) FROM passage_embeddings", [], |row| {
                        row.get(0)
                    })
                    .map_err(map_db_err)?;
                Ok(n as u64)
            })
            .await
    }
}

fn upsert_row(
    conn: &Connection,
    passage_id: &str,
    payload: &str,
    dim: i64,
    metadata: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO passage_embeddings (passage_id, embedding, embedding_dim, metadata, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT(passage_id) DO UPDATE SET
            embedding = excluded.embedding,
            embedding_dim = excluded.embedding_dim,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at
        "#,
        params![passage_id, payload, dim, metadata, now],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn filter_clause(filter: &VectorFilter, sql: &mut String, params: &mut Vec<String>) {
    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND json_extract(metadata, '$.agent_id') = ?");
        params.push(agent_id.clone());
    }
    if let Some(source_id) = &filter.source_id {
        sql.push_str(" AND json_extract(metadata, '$.source_id') = ?");
        params.push(source_id.clone());
    }
}

fn search_sql(
    conn: &Connection,
    query: &[f32],
    top_k: usize,
    min_similarity: f64,
    filter: &VectorFilter,
) -> Result<Vec<VectorMatch>> {
    let query_json = embedding_to_json(query);
    let mut sql = String::from(
        "SELECT passage_id, 1.0 - vec_distance_cosine(embedding, ?1) AS score \
         FROM passage_embeddings WHERE embedding_dim = ?2 \
         AND 1.0 - vec_distance_cosine(embedding, ?1) >= ?3",
    );
    let mut extra = Vec::new();
    filter_clause(filter, &mut sql, &mut extra);
    sql.push_str(" ORDER BY score DESC, passage_id ASC LIMIT ?");

    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
    params.push(&query_json);
    let dim = query.len() as i64;
    params.push(&dim);
    params.push(&min_similarity);
    for value in &extra {
        params.push(value);
    }
    let limit = top_k as i64;
    params.push(&limit);

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(VectorMatch {
                passage_id: row.get(0)?,
                score: row.get(1)?,
            })
        })
        .map_err(map_db_err)?;
    let mut matches = Vec::new();
    for row in rows {
        matches.push(row.map_err(map_db_err)?);
    }
    Ok(matches)
}

fn search_in_process(
    conn: &Connection,
    query: &[f32],
    top_k: usize,
    min_similarity: f64,
    filter: &VectorFilter,
) -> Result<Vec<VectorMatch>> {
    let mut sql = String::from(
        "SELECT passage_id, embedding FROM passage_embeddings WHERE embedding_dim = ?",
    );
    let mut extra = Vec::new();
    filter_clause(filter, &mut sql, &mut extra);

    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
    let dim = query.len() as i64;
    params.push(&dim);
    for value in &extra {
        params.push(value);
    }

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(map_db_err)?;

    let mut matches = Vec::new();
    for row in rows {
        let (passage_id, payload) = row.map_err(map_db_err)?;
        let candidate = embedding_from_json(&payload)?;
        let score = cosine_similarity(query, &candidate);
        if score >= min_similarity {
            matches.push(VectorMatch { passage_id, score });
        }
    }
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.passage_id.cmp(&b.passage_id))
    });
    matches.truncate(top_k);
    Ok(matches)
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vector_store() -> VectorStore {
        let store = Store::open_in_memory().expect("store");
        VectorStore::new(store).await.expect("vector store")
    }

    fn meta_for_agent(agent_id: &str) -> serde_json::Value {
        serde_json::json!({ "agent_id": agent_id, "source_id": null })
    }

    #[tokio::test]
    async fn backend_probe_picks_sqlite_vec() {
        let vs = vector_store().await;
        assert_eq!(vs.backend(), VectorBackend::SqliteVec);
    }

    #[tokio::test]
    async fn upsert_rejects_empty_embedding() {
        let vs = vector_store().await;
        let err = vs.upsert("passage-1", &[], None).await.unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let vs = vector_store().await;
        let embedding = vec![1.0, 0.0, 0.0];
        vs.upsert("passage-1", &embedding, Some(meta_for_agent("agent-1")))
            .await
            .expect("first upsert");
        vs.upsert("passage-1", &embedding, Some(meta_for_agent("agent-1")))
            .await
            .expect("second upsert");
        assert_eq!(vs.count().await.expect("count"), 1);
        let (stored, metadata) = vs.get("passage-1").await.expect("get").expect("row");
        assert_eq!(stored, embedding);
        assert_eq!(metadata.unwrap()["agent_id"], "agent-1");
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let vs = vector_store().await;
        vs.upsert("passage-1", &[0.5, 0.5], None)
            .await
            .expect("upsert");
        assert!(vs.delete("passage-1").await.expect("delete"));
        assert!(!vs.delete("passage-1").await.expect("second delete"));
        assert!(vs.get("passage-1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let vs = vector_store().await;
        vs.upsert("passage-a", &[1.0, 0.0, 0.0], Some(meta_for_agent("agent-1")))
            .await
            .unwrap();
        vs.upsert("passage-b", &[0.9, 0.1, 0.0], Some(meta_for_agent("agent-1")))
            .await
            .unwrap();
        vs.upsert("passage-c", &[0.0, 1.0, 0.0], Some(meta_for_agent("agent-1")))
            .await
            .unwrap();

        let matches = vs
            .search_similar(&[1.0, 0.0, 0.0], 2, -1.0, VectorFilter::for_agent("agent-1"))
            .await
            .expect("search");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].passage_id, "passage-a");
        assert!((matches[0].score - 1.0).abs() < 1e-6);
        assert_eq!(matches[1].passage_id, "passage-b");
        assert!(matches[0].score >= matches[1].score);
    }

    #[tokio::test]
    async fn search_filters_by_owner_metadata() {
        let vs = vector_store().await;
        vs.upsert("passage-a", &[1.0, 0.0], Some(meta_for_agent("agent-1")))
            .await
            .unwrap();
        vs.upsert(
            "passage-b",
            &[1.0, 0.0],
            Some(serde_json::json!({ "agent_id": null, "source_id": "source-1" })),
        )
        .await
        .unwrap();

        let matches = vs
            .search_similar(&[1.0, 0.0], 10, -1.0, VectorFilter::for_source("source-1"))
            .await
            .expect("search");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].passage_id, "passage-b");
    }

    #[tokio::test]
    async fn search_skips_dimension_mismatches() {
        let vs = vector_store().await;
        vs.upsert("passage-2d", &[1.0, 0.0], None).await.unwrap();
        vs.upsert("passage-3d", &[1.0, 0.0, 0.0], None).await.unwrap();

        let matches = vs
            .search_similar(&[1.0, 0.0], 10, -1.0, VectorFilter::default())
            .await
            .expect("search");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].passage_id, "passage-2d");
    }

    #[tokio::test]
    async fn search_top_k_zero_returns_empty() {
        let vs = vector_store().await;
        vs.upsert("passage-a", &[1.0, 0.0], None).await.unwrap();
        let matches = vs
            .search_similar(&[1.0, 0.0], 0, -1.0, VectorFilter::default())
            .await
            .expect("search");
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn search_top_k_beyond_count_returns_all() {
        let vs = vector_store().await;
        vs.upsert("passage-a", &[1.0, 0.0], None).await.unwrap();
        vs.upsert("passage-b", &[0.0, 1.0], None).await.unwrap();
        let matches = vs
            .search_similar(&[1.0, 0.0], 50, -1.0, VectorFilter::default())
            .await
            .expect("search");
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn batch_upsert_is_atomic_on_bad_input() {
        let vs = vector_store().await;
        let err = vs
            .batch_upsert(vec![
                ("passage-a".into(), vec![1.0, 0.0], None),
                ("passage-b".into(), vec![], None),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(vs.count().await.unwrap(), 0);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
