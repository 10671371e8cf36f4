use engram_schema::{Actor, EngramError, Message, MessageRole, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{map_db_err, parse_datetime, Page, Store};

const MESSAGE_COLUMNS: &str = "id, organization_id, agent_id, role, content, tool_calls, \
     tool_call_id, step_id, created_at, updated_at, is_deleted, created_by";

impl Store {
    pub async fn insert_message(&self, message: Message) -> Result<Message> {
        self.with_conn(move |conn| {
            insert_message_row(conn, &message)?;
            Ok(message)
        })
        .await
    }

    /// Insert a batch in one transaction, preserving the given order.
    pub async fn insert_many_messages(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(messages);
        }
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(map_db_err)?;
            for message in &messages {
                insert_message_row(&tx, message)?;
            }
            tx.commit().map_err(map_db_err)?;
            Ok(messages)
        })
        .await
    }

    pub async fn get_message(&self, message_id: &str, actor: &Actor) -> Result<Message> {
        let message_id = message_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![message_id, org], row_to_message)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("message {message_id}")))
        })
        .await
    }

    pub async fn list_messages(
        &self,
        agent_id: &str,
        actor: &Actor,
        page: Page,
        role: Option<MessageRole>,
    ) -> Result<Vec<Message>> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE organization_id = ? AND is_deleted = 0 AND agent_id = ?"
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> =
                vec![Box::new(org), Box::new(agent_id)];
            if let Some(role) = role {
                sql.push_str(" AND role = ?");
                boxed.push(Box::new(role.as_str().to_string()));
            }
            page.apply("messages", &mut sql, &mut boxed);
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

    /// Case-insensitive substring search over an agent's history, newest
    /// first. Backs the `conversation_search` tool.
    pub async fn search_messages(
        &self,
        agent_id: &str,
        actor: &Actor,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        let pattern = format!("%{query}%");
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE organization_id = ?1 AND is_deleted = 0 AND agent_id = ?2 \
                 AND content LIKE ?3 ORDER BY created_at DESC, id DESC LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(
                    params![org, agent_id, pattern, limit as i64],
                    row_to_message,
                )
                .map_err(map_db_err)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.map_err(map_db_err)??);
            }
            Ok(messages)
        })
        .await
    }

    pub async fn message_size(&self, agent_id: &str, actor: &Actor) -> Result<u64> {
        let agent_id = agent_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages \
                     WHERE organization_id = ?1 AND is_deleted = 0 AND agent_id = ?2",
                    params![org, agent_id],
                    |row| row.get(0),
                )
                .map_err(map_db_err)?;
            Ok(n as u64)
        })
        .await
    }
}

fn insert_message_row(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO messages (
            id, organization_id, agent_id, role, content, tool_calls, tool_call_id,
            step_id, created_at, updated_at, is_deleted, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)
        "#,
        params![
            message.id,
            message.organization_id,
            message.agent_id,
            message.role.as_str(),
            message.content,
            serde_json::to_string(&message.tool_calls)?,
            message.tool_call_id,
            message.step_id,
            message.created_at.to_rfc3339(),
            message.updated_at.to_rfc3339(),
            message.created_by,
        ],
    )
    .map_err(map_db_err)?;
    Ok(())
}

pub(crate) fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Result<Message>> {
    Ok(build_message(row))
}

fn build_message(row: &Row<'_>) -> Result<Message> {
    let role_raw: String = row.get(3).map_err(map_db_err)?;
    let tool_calls_raw: String = row.get(5).map_err(map_db_err)?;
    let created_raw: String = row.get(8).map_err(map_db_err)?;
    let updated_raw: String = row.get(9).map_err(map_db_err)?;
    Ok(Message {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        agent_id: row.get(2).map_err(map_db_err)?,
        role: MessageRole::parse(&role_raw)
            .ok_or_else(|| EngramError::internal(format!("unknown role {role_raw:?}")))?,
        content: row.get(4).map_err(map_db_err)?,
        tool_calls: serde_json::from_str(&tool_calls_raw)?,
        tool_call_id: row.get(6).map_err(map_db_err)?,
        step_id: row.get(7).map_err(map_db_err)?,
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(10).map_err(map_db_err)? != 0,
        created_by: row.get(11).map_err(map_db_err)?,
    })
}
