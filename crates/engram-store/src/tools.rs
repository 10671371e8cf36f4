use engram_schema::{Actor, EngramError, Result, Tool};
use rusqlite::{params, OptionalExtension, Row};

use crate::{map_db_err, parse_datetime, Store};

const TOOL_COLUMNS: &str =
    "id, organization_id, name, description, input_schema, created_at, updated_at, is_deleted";

impl Store {
    pub async fn insert_tool(&self, tool: Tool, actor: &Actor) -> Result<Tool> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO tools (
                    id, organization_id, name, description, input_schema,
                    created_at, updated_at, is_deleted
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                "#,
                params![
                    tool.id,
                    actor.organization_id,
                    tool.name,
                    tool.description,
                    tool.input_schema.to_string(),
                    tool.created_at.to_rfc3339(),
                    tool.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;
            Ok(tool)
        })
        .await
    }

    pub async fn get_tool_by_name(&self, name: &str, actor: &Actor) -> Result<Tool> {
        let name = name.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {TOOL_COLUMNS} FROM tools \
                 WHERE name = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![name, org], row_to_tool)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("tool {name}")))
        })
        .await
    }

    pub async fn list_tools(&self, actor: &Actor) -> Result<Vec<Tool>> {
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {TOOL_COLUMNS} FROM tools \
                 WHERE organization_id = ?1 AND is_deleted = 0 ORDER BY name ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![org], row_to_tool)
                .map_err(map_db_err)?;
            let mut tools = Vec::new();
            for row in rows {
                tools.push(row.map_err(map_db_err)??);
            }
            Ok(tools)
        })
        .await
    }
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<Result<Tool>> {
    Ok(build_tool(row))
}

fn build_tool(row: &Row<'_>) -> Result<Tool> {
    let schema_raw: String = row.get(4).map_err(map_db_err)?;
    let created_raw: String = row.get(5).map_err(map_db_err)?;
    let updated_raw: String = row.get(6).map_err(map_db_err)?;
    Ok(Tool {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        name: row.get(2).map_err(map_db_err)?,
        description: row.get(3).map_err(map_db_err)?,
        input_schema: serde_json::from_str(&schema_raw)?,
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(7).map_err(map_db_err)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use engram_schema::{id_prefix, new_id};

    fn actor() -> Actor {
        Actor::new("user-1", "org-1")
    }

    fn tool(name: &str) -> Tool {
        let now = Utc::now();
        Tool {
            id: new_id(id_prefix::TOOL),
            organization_id: "org-1".into(),
            name: name.into(),
            description: "test tool".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn tool_round_trip_by_name() {
        let store = Store::open_in_memory().unwrap();
        store.insert_tool(tool("summarize"), &actor()).await.unwrap();

        let loaded = store.get_tool_by_name("summarize", &actor()).await.unwrap();
        assert_eq!(loaded.name, "summarize");
        assert_eq!(loaded.input_schema["type"], "object");
    }

    #[tokio::test]
    async fn duplicate_name_in_org_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.insert_tool(tool("dup"), &actor()).await.unwrap();
        let err = store.insert_tool(tool("dup"), &actor()).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }
}
