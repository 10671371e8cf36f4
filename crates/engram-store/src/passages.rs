//! Row-level CRUD for the two passage tables. The typed business API lives
//! in the memory crate; this module only moves validated rows in and out.

use chrono::Utc;
use engram_schema::{
    Actor, EmbeddingConfig, EngramError, Passage, PassageOwner, Result,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{embedding_from_json, embedding_to_json, map_db_err, parse_datetime, Page, Store};

const AGENT_COLUMNS: &str = "id, organization_id, agent_id, text, embedding, embedding_model, \
     embedding_endpoint, embedding_dim, created_at, updated_at, is_deleted, created_by, updated_by";
const SOURCE_COLUMNS: &str = "id, organization_id, source_id, file_id, file_name, text, embedding, \
     embedding_model, embedding_endpoint, embedding_dim, created_at, updated_at, is_deleted, \
     created_by, updated_by";

impl Store {
    pub async fn insert_agent_passage(&self, passage: Passage, actor: &Actor) -> Result<Passage> {
        passage.validate()?;
        let agent_id = match &passage.owner {
            PassageOwner::Agent { agent_id } => agent_id.clone(),
            PassageOwner::Source { .. } => {
                return Err(EngramError::invalid_argument(
                    "agent passage must be owned by an agent",
                ))
            }
        };
        let actor = actor.clone();
        self.with_conn(move |conn| {
            insert_agent_row(conn, &passage, &agent_id, &actor)?;
            Ok(passage)
        })
        .await
    }

    pub async fn insert_source_passage(&self, passage: Passage, actor: &Actor) -> Result<Passage> {
        passage.validate()?;
        if passage.owner.source_id().is_none() {
            return Err(EngramError::invalid_argument(
                "source passage must be owned by a source",
            ));
        }
        let actor = actor.clone();
        self.with_conn(move |conn| {
            insert_source_row(conn, &passage, &actor)?;
            Ok(passage)
        })
        .await
    }

    /// Bulk insert in one transaction; any invalid row aborts the batch.
    pub async fn insert_many_agent_passages(
        &self,
        passages: Vec<Passage>,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        for passage in &passages {
            passage.validate()?;
            if passage.owner.agent_id().is_none() {
                return Err(EngramError::invalid_argument(
                    "agent passage must be owned by an agent",
                ));
            }
        }
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            for passage in &passages {
                let agent_id = passage.owner.agent_id().unwrap_or_default().to_string();
                insert_agent_row(&tx, passage, &agent_id, &actor)?;
            }
            tx.commit().map_err(map_db_err)?;
            Ok(passages)
        })
        .await
    }

    pub async fn insert_many_source_passages(
        &self,
        passages: Vec<Passage>,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        for passage in &passages {
            passage.validate()?;
            if passage.owner.source_id().is_none() {
                return Err(EngramError::invalid_argument(
                    "source passage must be owned by a source",
                ));
            }
        }
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            for passage in &passages {
                insert_source_row(&tx, passage, &actor)?;
            }
            tx.commit().map_err(map_db_err)?;
            Ok(passages)
        })
        .await
    }

    pub async fn get_agent_passage(&self, passage_id: &str, actor: &Actor) -> Result<Passage> {
        let passage_id = passage_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {AGENT_COLUMNS} FROM passages_agent \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![passage_id, org], row_to_agent_passage)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("agent passage {passage_id}")))
        })
        .await
    }

    pub async fn get_source_passage(&self, passage_id: &str, actor: &Actor) -> Result<Passage> {
        let passage_id = passage_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SOURCE_COLUMNS} FROM passages_source \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![passage_id, org], row_to_source_passage)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("source passage {passage_id}")))
        })
        .await
    }

    /// Hydrate passages by id in the given order, skipping ids that no
    /// longer resolve. Agent and source rows are looked up in turn.
    pub async fn get_passages_by_ids(
        &self,
        passage_ids: Vec<String>,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let agent_sql = format!(
                "SELECT {AGENT_COLUMNS} FROM passages_agent \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            let source_sql = format!(
                "SELECT {SOURCE_COLUMNS} FROM passages_source \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            let mut out = Vec::with_capacity(passage_ids.len());
            for id in &passage_ids {
                let hit = conn
                    .query_row(&agent_sql, params![id, org], row_to_agent_passage)
                    .optional()
                    .map_err(map_db_err)?
                    .transpose()?;
                let hit = match hit {
                    Some(p) => Some(p),
                    None => conn
                        .query_row(&source_sql, params![id, org], row_to_source_passage)
                        .optional()
                        .map_err(map_db_err)?
                        .transpose()?,
                };
                if let Some(p) = hit {
                    out.push(p);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn update_agent_passage(
        &self,
        passage: Passage,
        actor: &Actor,
    ) -> Result<Passage> {
        passage.validate()?;
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE passages_agent SET text = ?1, embedding = ?2, embedding_model = ?3, \
                     embedding_endpoint = ?4, embedding_dim = ?5, updated_at = ?6, updated_by = ?7 \
                     WHERE id = ?8 AND organization_id = ?9 AND is_deleted = 0",
                    params![
                        passage.text,
                        embedding_to_json(&passage.embedding),
                        passage.embedding_config.model,
                        passage.embedding_config.endpoint,
                        passage.embedding_config.dim as i64,
                        now,
                        actor.id,
                        passage.id,
                        actor.organization_id,
                    ],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!(
                    "agent passage {}",
                    passage.id
                )));
            }
            Ok(passage)
        })
        .await
    }

    pub async fn update_source_passage(
        &self,
        passage: Passage,
        actor: &Actor,
    ) -> Result<Passage> {
        passage.validate()?;
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE passages_source SET text = ?1, embedding = ?2, embedding_model = ?3, \
                     embedding_endpoint = ?4, embedding_dim = ?5, updated_at = ?6, updated_by = ?7 \
                     WHERE id = ?8 AND organization_id = ?9 AND is_deleted = 0",
                    params![
                        passage.text,
                        embedding_to_json(&passage.embedding),
                        passage.embedding_config.model,
                        passage.embedding_config.endpoint,
                        passage.embedding_config.dim as i64,
                        now,
                        actor.id,
                        passage.id,
                        actor.organization_id,
                    ],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!(
                    "source passage {}",
                    passage.id
                )));
            }
            Ok(passage)
        })
        .await
    }

    pub async fn hard_delete_agent_passage(&self, passage_id: &str, actor: &Actor) -> Result<bool> {
        let passage_id = passage_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM passages_agent WHERE id = ?1 AND organization_id = ?2",
                    params![passage_id, org],
                )
                .map_err(map_db_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn hard_delete_source_passage(
        &self,
        passage_id: &str,
        actor: &Actor,
    ) -> Result<bool> {
        let passage_id = passage_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM passages_source WHERE id = ?1 AND organization_id = ?2",
                    params![passage_id, org],
                )
                .map_err(map_db_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Cascade helper: remove every archival passage an agent owns and
    /// return the deleted ids so the vector mirror can follow.
    pub async fn delete_agent_passages_for_agent(
        &self,
        agent_id: &str,
        actor: &Actor,
    ) -> Result<Vec<String>> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM passages_agent WHERE agent_id = ?1 AND organization_id = ?2",
                )
                .map_err(map_db_err)?;
            let ids: Vec<String> = stmt
                .query_map(params![agent_id, org], |row| row.get(0))
                .map_err(map_db_err)?
                .filter_map(|r| r.ok())
                .collect();
            conn.execute(
                "DELETE FROM passages_agent WHERE agent_id = ?1 AND organization_id = ?2",
                params![agent_id, org],
            )
            .map_err(map_db_err)?;
            Ok(ids)
        })
        .await
    }

    pub async fn agent_passage_size(&self, actor: &Actor, agent_id: Option<&str>) -> Result<u64> {
        let org = actor.organization_id.clone();
        let agent_id = agent_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let n: i64 = match agent_id {
                Some(agent_id) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM passages_agent \
                         WHERE organization_id = ?1 AND is_deleted = 0 AND agent_id = ?2",
                        params![org, agent_id],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?,
                None => conn
                    .query_row(
                        "SELECT COUNT(*) FROM passages_agent \
                         WHERE organization_id = ?1 AND is_deleted = 0",
                        params![org],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?,
            };
            Ok(n as u64)
        })
        .await
    }

    pub async fn source_passage_size(
        &self,
        actor: &Actor,
        source_id: Option<&str>,
    ) -> Result<u64> {
        let org = actor.organization_id.clone();
        let source_id = source_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let n: i64 = match source_id {
                Some(source_id) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM passages_source \
                         WHERE organization_id = ?1 AND is_deleted = 0 AND source_id = ?2",
                        params![org, source_id],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?,
                None => conn
                    .query_row(
                        "SELECT COUNT(*) FROM passages_source \
                         WHERE organization_id = ?1 AND is_deleted = 0",
                        params![org],
                        |row| row.get(0),
                    )
                    .map_err(map_db_err)?,
            };
            Ok(n as u64)
        })
        .await
    }

    /// Total stored embedding dimensions across both passage tables, for
    /// storage accounting (`dims × 4` bytes).
    pub async fn total_embedding_dims(&self, actor: &Actor) -> Result<u64> {
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let agent_dims: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(embedding_dim), 0) FROM passages_agent \
                     WHERE organization_id = ?1 AND is_deleted = 0",
                    params![org],
                    |row| row.get(0),
                )
                .map_err(map_db_err)?;
            let source_dims: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(embedding_dim), 0) FROM passages_source \
                     WHERE organization_id = ?1 AND is_deleted = 0",
                    params![org],
                    |row| row.get(0),
                )
                .map_err(map_db_err)?;
            Ok((agent_dims + source_dims) as u64)
        })
        .await
    }

    pub async fn list_passages_by_file_id(
        &self,
        file_id: &str,
        actor: &Actor,
    ) -> Result<Vec<Passage>> {
        let file_id = file_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SOURCE_COLUMNS} FROM passages_source \
                 WHERE file_id = ?1 AND organization_id = ?2 AND is_deleted = 0 \
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![file_id, org], row_to_source_passage)
                .map_err(map_db_err)?;
            let mut passages = Vec::new();
            for row in rows {
                passages.push(row.map_err(map_db_err)??);
            }
            Ok(passages)
        })
        .await
    }

    pub async fn list_agent_passages(
        &self,
        agent_id: &str,
        actor: &Actor,
        page: Page,
    ) -> Result<Vec<Passage>> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {AGENT_COLUMNS} FROM passages_agent \
                 WHERE organization_id = ? AND is_deleted = 0 AND agent_id = ?"
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> =
                vec![Box::new(org), Box::new(agent_id)];
            page.apply("passages_agent", &mut sql, &mut boxed);
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(
                    crate::params_from(&boxed).as_slice(),
                    row_to_agent_passage,
                )
                .map_err(map_db_err)?;
            let mut passages = Vec::new();
            for row in rows {
                passages.push(row.map_err(map_db_err)??);
            }
            Ok(passages)
        })
        .await
    }
}

fn insert_agent_row(
    conn: &Connection,
    passage: &Passage,
    agent_id: &str,
    actor: &Actor,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO passages_agent (
            id, organization_id, agent_id, text, embedding, embedding_model,
            embedding_endpoint, embedding_dim, created_at, updated_at, is_deleted,
            created_by, updated_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
        "#,
        params![
            passage.id,
            actor.organization_id,
            agent_id,
            passage.text,
            embedding_to_json(&passage.embedding),
            passage.embedding_config.model,
            passage.embedding_config.endpoint,
            passage.embedding_config.dim as i64,
            passage.created_at.to_rfc3339(),
            passage.updated_at.to_rfc3339(),
            actor.id,
        ],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn insert_source_row(conn: &Connection, passage: &Passage, actor: &Actor) -> Result<()> {
    let (source_id, file_id, file_name) = match &passage.owner {
        PassageOwner::Source {
            source_id,
            file_id,
            file_name,
        } => (source_id, file_id, file_name),
        PassageOwner::Agent { .. } => {
            return Err(EngramError::invalid_argument(
                "source passage must be owned by a source",
            ))
        }
    };
    conn.execute(
        r#"
        INSERT INTO passages_source (
            id, organization_id, source_id, file_id, file_name, text, embedding,
            embedding_model, embedding_endpoint, embedding_dim, created_at, updated_at,
            is_deleted, created_by, updated_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)
        "#,
        params![
            passage.id,
            actor.organization_id,
            source_id,
            file_id,
            file_name,
            passage.text,
            embedding_to_json(&passage.embedding),
            passage.embedding_config.model,
            passage.embedding_config.endpoint,
            passage.embedding_config.dim as i64,
            passage.created_at.to_rfc3339(),
            passage.updated_at.to_rfc3339(),
            actor.id,
        ],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn row_to_agent_passage(row: &Row<'_>) -> rusqlite::Result<Result<Passage>> {
    Ok(build_agent_passage(row))
}

fn build_agent_passage(row: &Row<'_>) -> Result<Passage> {
    let embedding_raw: String = row.get(4).map_err(map_db_err)?;
    let created_raw: String = row.get(8).map_err(map_db_err)?;
    let updated_raw: String = row.get(9).map_err(map_db_err)?;
    Ok(Passage {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        owner: PassageOwner::Agent {
            agent_id: row.get(2).map_err(map_db_err)?,
        },
        text: row.get(3).map_err(map_db_err)?,
        embedding: embedding_from_json(&embedding_raw)?,
        embedding_config: EmbeddingConfig {
            model: row.get(5).map_err(map_db_err)?,
            endpoint: row.get(6).map_err(map_db_err)?,
            dim: row.get::<_, i64>(7).map_err(map_db_err)? as usize,
        },
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(10).map_err(map_db_err)? != 0,
        created_by: row.get(11).map_err(map_db_err)?,
        updated_by: row.get(12).map_err(map_db_err)?,
    })
}

fn row_to_source_passage(row: &Row<'_>) -> rusqlite::Result<Result<Passage>> {
    Ok(build_source_passage(row))
}

fn build_source_passage(row: &Row<'_>) -> Result<Passage> {
    let embedding_raw: String = row.get(6).map_err(map_db_err)?;
    let created_raw: String = row.get(10).map_err(map_db_err)?;
    let updated_raw: String = row.get(11).map_err(map_db_err)?;
    Ok(Passage {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        owner: PassageOwner::Source {
            source_id: row.get(2).map_err(map_db_err)?,
            file_id: row.get(3).map_err(map_db_err)?,
            file_name: row.get(4).map_err(map_db_err)?,
        },
        text: row.get(5).map_err(map_db_err)?,
        embedding: embedding_from_json(&embedding_raw)?,
        embedding_config: EmbeddingConfig {
            model: row.get(7).map_err(map_db_err)?,
            endpoint: row.get(8).map_err(map_db_err)?,
            dim: row.get::<_, i64>(9).map_err(map_db_err)? as usize,
        },
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(12).map_err(map_db_err)? != 0,
        created_by: row.get(13).map_err(map_db_err)?,
        updated_by: row.get(14).map_err(map_db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_schema::{id_prefix, new_id};

    fn actor() -> Actor {
        Actor::new("user-1", "org-1")
    }

    fn agent_passage(agent_id: &str, text: &str) -> Passage {
        let now = Utc::now();
        Passage {
            id: new_id(id_prefix::PASSAGE),
            organization_id: "org-1".into(),
            owner: PassageOwner::Agent {
                agent_id: agent_id.into(),
            },
            text: text.into(),
            embedding: vec![0.1, 0.2, 0.3],
            embedding_config: EmbeddingConfig::new("test-model", 3),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: None,
            updated_by: None,
        }
    }

    fn source_passage(source_id: &str, file_id: &str, text: &str) -> Passage {
        let mut passage = agent_passage("unused", text);
        passage.owner = PassageOwner::Source {
            source_id: source_id.into(),
            file_id: file_id.into(),
            file_name: "doc.txt".into(),
        };
        passage
    }

    #[tokio::test]
    async fn insert_and_read_agent_passage() {
        let store = Store::open_in_memory().unwrap();
        let passage = agent_passage("agent-1", "remembered fact");
        let id = passage.id.clone();
        store.insert_agent_passage(passage, &actor()).await.unwrap();

        let loaded = store.get_agent_passage(&id, &actor()).await.unwrap();
        assert_eq!(loaded.text, "remembered fact");
        assert_eq!(loaded.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(loaded.owner.agent_id(), Some("agent-1"));
    }

    #[tokio::test]
    async fn cross_org_read_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let passage = agent_passage("agent-1", "secret");
        let id = passage.id.clone();
        store.insert_agent_passage(passage, &actor()).await.unwrap();

        let other = Actor::new("user-2", "org-2");
        let err = store.get_agent_passage(&id, &other).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn dim_mismatch_rejected_before_write() {
        let store = Store::open_in_memory().unwrap();
        let mut passage = agent_passage("agent-1", "bad dims");
        passage.embedding = vec![0.1];
        let err = store
            .insert_agent_passage(passage, &actor())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(
            store.agent_passage_size(&actor(), None).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn source_passage_round_trip_and_file_listing() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_many_source_passages(
                vec![
                    source_passage("source-1", "file-1", "first chunk"),
                    source_passage("source-1", "file-1", "second chunk"),
                    source_passage("source-1", "file-2", "other file"),
                ],
                &actor(),
            )
            .await
            .unwrap();

        let by_file = store
            .list_passages_by_file_id("file-1", &actor())
            .await
            .unwrap();
        assert_eq!(by_file.len(), 2);
        assert!(by_file.iter().all(|p| p.owner.source_id() == Some("source-1")));

        assert_eq!(
            store
                .source_passage_size(&actor(), Some("source-1"))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn cascade_delete_returns_ids() {
        let store = Store::open_in_memory().unwrap();
        let first = agent_passage("agent-1", "one");
        let second = agent_passage("agent-1", "two");
        let other = agent_passage("agent-2", "keep");
        let mut expected = vec![first.id.clone(), second.id.clone()];
        expected.sort();
        store
            .insert_many_agent_passages(vec![first, second, other], &actor())
            .await
            .unwrap();

        let mut deleted = store
            .delete_agent_passages_for_agent("agent-1", &actor())
            .await
            .unwrap();
        deleted.sort();
        assert_eq!(deleted, expected);
        assert_eq!(
            store.agent_passage_size(&actor(), None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn hydration_preserves_requested_order() {
        let store = Store::open_in_memory().unwrap();
        let a = agent_passage("agent-1", "alpha");
        let b = source_passage("source-1", "file-1", "beta");
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        store.insert_agent_passage(a, &actor()).await.unwrap();
        store.insert_source_passage(b, &actor()).await.unwrap();

        let hydrated = store
            .get_passages_by_ids(
                vec![b_id.clone(), "passage-missing".into(), a_id.clone()],
                &actor(),
            )
            .await
            .unwrap();
        assert_eq!(hydrated.len(), 2);
        assert_eq!(hydrated[0].id, b_id);
        assert_eq!(hydrated[1].id, a_id);
    }

    #[tokio::test]
    async fn update_agent_passage_rewrites_embedding() {
        let store = Store::open_in_memory().unwrap();
        let mut passage = agent_passage("agent-1", "before");
        let id = passage.id.clone();
        store
            .insert_agent_passage(passage.clone(), &actor())
            .await
            .unwrap();

        passage.text = "after".into();
        passage.embedding = vec![0.9, 0.8, 0.7];
        store.update_agent_passage(passage, &actor()).await.unwrap();

        let loaded = store.get_agent_passage(&id, &actor()).await.unwrap();
        assert_eq!(loaded.text, "after");
        assert_eq!(loaded.embedding, vec![0.9, 0.8, 0.7]);
    }

    #[tokio::test]
    async fn hard_delete_agent_passage_reports_presence() {
        let store = Store::open_in_memory().unwrap();
        let passage = agent_passage("agent-1", "gone soon");
        let id = passage.id.clone();
        store.insert_agent_passage(passage, &actor()).await.unwrap();

        assert!(store.hard_delete_agent_passage(&id, &actor()).await.unwrap());
        assert!(!store.hard_delete_agent_passage(&id, &actor()).await.unwrap());
        assert_eq!(
            store
                .get_agent_passage(&id, &actor())
                .await
                .unwrap_err()
                .code(),
            "not_found"
        );
    }
}
