use chrono::Utc;
use engram_schema::{Actor, Agent, EngramError, MemoryBlock, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{map_db_err, parse_datetime, Page, Store};

const AGENT_COLUMNS: &str = "id, organization_id, name, tool_names, source_ids, llm_config, \
     embedding_config, top_k, created_at, updated_at, is_deleted, created_by, updated_by";

impl Store {
    /// Insert an agent together with its initial memory blocks in one
    /// transaction.
    pub async fn insert_agent(
        &self,
        agent: Agent,
        blocks: Vec<MemoryBlock>,
        actor: &Actor,
    ) -> Result<Agent> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            tx.execute(
                r#"
                INSERT INTO agents (
                    id, organization_id, name, tool_names, source_ids, llm_config,
                    embedding_config, top_k, created_at, updated_at, is_deleted,
                    created_by, updated_by
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
                "#,
                params![
                    agent.id,
                    actor.organization_id,
                    agent.name,
                    serde_json::to_string(&agent.tool_names)?,
                    serde_json::to_string(&agent.source_ids)?,
                    serde_json::to_string(&agent.llm_config)?,
                    serde_json::to_string(&agent.embedding_config)?,
                    agent.top_k.map(|k| k as i64),
                    agent.created_at.to_rfc3339(),
                    agent.updated_at.to_rfc3339(),
                    actor.id,
                ],
            )
            .map_err(map_db_err)?;
            for block in &blocks {
                insert_block_row(&tx, block)?;
            }
            tx.commit().map_err(map_db_err)?;
            Ok(agent)
        })
        .await
    }

    pub async fn get_agent(&self, agent_id: &str, actor: &Actor) -> Result<Agent> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {AGENT_COLUMNS} FROM agents \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![agent_id, org], row_to_agent)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("agent {agent_id}")))
        })
        .await
    }

    /// Lookup that sees soft-deleted rows, for callers that distinguish
    /// "gone" from "never existed".
    pub async fn get_agent_any(&self, agent_id: &str, actor: &Actor) -> Result<Agent> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1 AND organization_id = ?2"
            );
            conn.query_row(&sql, params![agent_id, org], row_to_agent)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("agent {agent_id}")))
        })
        .await
    }

    pub async fn list_agents(&self, actor: &Actor, page: Page) -> Result<Vec<Agent>> {
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {AGENT_COLUMNS} FROM agents WHERE organization_id = ? AND is_deleted = 0"
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> = vec![Box::new(org)];
            page.apply("agents", &mut sql, &mut boxed);
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(crate::params_from(&boxed).as_slice(), row_to_agent)
                .map_err(map_db_err)?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(row.map_err(map_db_err)??);
            }
            Ok(agents)
        })
        .await
    }

    pub async fn update_agent(&self, agent: Agent, actor: &Actor) -> Result<Agent> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE agents SET name = ?1, tool_names = ?2, source_ids = ?3, \
                     llm_config = ?4, embedding_config = ?5, top_k = ?6, updated_at = ?7, \
                     updated_by = ?8 WHERE id = ?9 AND organization_id = ?10 AND is_deleted = 0",
                    params![
                        agent.name,
                        serde_json::to_string(&agent.tool_names)?,
                        serde_json::to_string(&agent.source_ids)?,
                        serde_json::to_string(&agent.llm_config)?,
                        serde_json::to_string(&agent.embedding_config)?,
                        agent.top_k.map(|k| k as i64),
                        now,
                        actor.id,
                        agent.id,
                        actor.organization_id,
                    ],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!("agent {}", agent.id)));
            }
            Ok(agent)
        })
        .await
    }

    /// Soft-delete the agent row and hard-delete its memory blocks. The
    /// caller handles the archival passage cascade so the vector mirror can
    /// be kept in step.
    pub async fn soft_delete_agent(&self, agent_id: &str, actor: &Actor) -> Result<()> {
        let agent_id = agent_id.to_string();
        let actor = actor.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            let now = Utc::now().to_rfc3339();
            let changed = tx
                .execute(
                    "UPDATE agents SET is_deleted = 1, updated_at = ?1, updated_by = ?2 \
                     WHERE id = ?3 AND organization_id = ?4 AND is_deleted = 0",
                    params![now, actor.id, agent_id, actor.organization_id],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!("agent {agent_id}")));
            }
            tx.execute(
                "DELETE FROM memory_blocks WHERE agent_id = ?1 AND organization_id = ?2",
                params![agent_id, actor.organization_id],
            )
            .map_err(map_db_err)?;
            tx.commit().map_err(map_db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn attach_source_to_agent(
        &self,
        agent_id: &str,
        source_id: &str,
        actor: &Actor,
    ) -> Result<()> {
        let mut agent = self.get_agent(agent_id, actor).await?;
        if !agent.source_ids.iter().any(|s| s == source_id) {
            agent.source_ids.push(source_id.to_string());
            self.update_agent(agent, actor).await?;
        }
        let agent_id = agent_id.to_string();
        let source_id = source_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sources_agents (source_id, agent_id, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![source_id, agent_id, Utc::now().to_rfc3339()],
            )
            .map_err(map_db_err)?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // Memory blocks
    // ============================================================

    pub async fn insert_memory_block(&self, block: MemoryBlock) -> Result<MemoryBlock> {
        self.with_conn(move |conn| {
            insert_block_row(conn, &block)?;
            Ok(block)
        })
        .await
    }

    /// Blocks in label order, the order they are composed into the system
    /// prompt.
    pub async fn list_memory_blocks(
        &self,
        agent_id: &str,
        actor: &Actor,
    ) -> Result<Vec<MemoryBlock>> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, organization_id, agent_id, label, value, block_limit, \
                     created_at, updated_at, is_deleted FROM memory_blocks \
                     WHERE agent_id = ?1 AND organization_id = ?2 AND is_deleted = 0 \
                     ORDER BY label ASC",
                )
                .map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![agent_id, org], row_to_block)
                .map_err(map_db_err)?;
            let mut blocks = Vec::new();
            for row in rows {
                blocks.push(row.map_err(map_db_err)??);
            }
            Ok(blocks)
        })
        .await
    }

    pub async fn get_memory_block(
        &self,
        agent_id: &str,
        label: &str,
        actor: &Actor,
    ) -> Result<MemoryBlock> {
        let agent_id = agent_id.to_string();
        let label = label.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, organization_id, agent_id, label, value, block_limit, \
                 created_at, updated_at, is_deleted FROM memory_blocks \
                 WHERE agent_id = ?1 AND label = ?2 AND organization_id = ?3 AND is_deleted = 0",
                params![agent_id, label, org],
                row_to_block,
            )
            .optional()
            .map_err(map_db_err)?
            .transpose()?
            .ok_or_else(|| EngramError::not_found(format!("memory block {label}")))
        })
        .await
    }

    pub async fn update_memory_block_value(
        &self,
        agent_id: &str,
        label: &str,
        value: &str,
        actor: &Actor,
    ) -> Result<()> {
        let agent_id = agent_id.to_string();
        let label = label.to_string();
        let value = value.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE memory_blocks SET value = ?1, updated_at = ?2 \
                     WHERE agent_id = ?3 AND label = ?4 AND organization_id = ?5 AND is_deleted = 0",
                    params![value, now, agent_id, label, org],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                return Err(EngramError::not_found(format!("memory block {label}")));
            }
            Ok(())
        })
        .await
    }
}

fn insert_block_row(conn: &Connection, block: &MemoryBlock) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO memory_blocks (
            id, organization_id, agent_id, label, value, block_limit,
            created_at, updated_at, is_deleted
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
        "#,
        params![
            block.id,
            block.organization_id,
            block.agent_id,
            block.label,
            block.value,
            block.limit as i64,
            block.created_at.to_rfc3339(),
            block.updated_at.to_rfc3339(),
        ],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Result<Agent>> {
    Ok(build_agent(row))
}

fn build_agent(row: &Row<'_>) -> Result<Agent> {
    let tool_names_raw: String = row.get(3).map_err(map_db_err)?;
    let source_ids_raw: String = row.get(4).map_err(map_db_err)?;
    let llm_config_raw: String = row.get(5).map_err(map_db_err)?;
    let embedding_config_raw: String = row.get(6).map_err(map_db_err)?;
    let created_raw: String = row.get(8).map_err(map_db_err)?;
    let updated_raw: String = row.get(9).map_err(map_db_err)?;
    Ok(Agent {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        name: row.get(2).map_err(map_db_err)?,
        tool_names: serde_json::from_str(&tool_names_raw)?,
        source_ids: serde_json::from_str(&source_ids_raw)?,
        llm_config: serde_json::from_str(&llm_config_raw)?,
        embedding_config: serde_json::from_str(&embedding_config_raw)?,
        top_k: row
            .get::<_, Option<i64>>(7)
            .map_err(map_db_err)?
            .map(|k| k as usize),
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(10).map_err(map_db_err)? != 0,
        created_by: row.get(11).map_err(map_db_err)?,
        updated_by: row.get(12).map_err(map_db_err)?,
    })
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Result<MemoryBlock>> {
    Ok(build_block(row))
}

fn build_block(row: &Row<'_>) -> Result<MemoryBlock> {
    let created_raw: String = row.get(6).map_err(map_db_err)?;
    let updated_raw: String = row.get(7).map_err(map_db_err)?;
    Ok(MemoryBlock {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        agent_id: row.get(2).map_err(map_db_err)?,
        label: row.get(3).map_err(map_db_err)?,
        value: row.get(4).map_err(map_db_err)?,
        limit: row.get::<_, i64>(5).map_err(map_db_err)? as usize,
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(8).map_err(map_db_err)? != 0,
    })
}
