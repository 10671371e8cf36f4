use engram_schema::{Actor, EmbeddingConfig, EngramError, FileMetadata, Result, Source};
use rusqlite::{params, OptionalExtension, Row};

use crate::{map_db_err, parse_datetime, Page, Store};

const SOURCE_COLUMNS: &str =
    "id, organization_id, name, embedding_config, created_at, updated_at, is_deleted, created_by";
const FILE_COLUMNS: &str = "id, organization_id, source_id, file_name, mime_type, size_bytes, \
     created_at, updated_at, is_deleted";

impl Store {
    pub async fn insert_source(&self, source: Source, actor: &Actor) -> Result<Source> {
        let actor = actor.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO sources (
                    id, organization_id, name, embedding_config, created_at, updated_at,
                    is_deleted, created_by
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                "#,
                params![
                    source.id,
                    actor.organization_id,
                    source.name,
                    serde_json::to_string(&source.embedding_config)?,
                    source.created_at.to_rfc3339(),
                    source.updated_at.to_rfc3339(),
                    actor.id,
                ],
            )
            .map_err(map_db_err)?;
            Ok(source)
        })
        .await
    }

    pub async fn get_source(&self, source_id: &str, actor: &Actor) -> Result<Source> {
        let source_id = source_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SOURCE_COLUMNS} FROM sources \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![source_id, org], row_to_source)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("source {source_id}")))
        })
        .await
    }

    pub async fn list_sources(&self, actor: &Actor, page: Page) -> Result<Vec<Source>> {
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let mut sql = format!(
                "SELECT {SOURCE_COLUMNS} FROM sources WHERE organization_id = ? AND is_deleted = 0"
            );
            let mut boxed: Vec<Box<dyn rusqlite::types::ToSql + Send>> = vec![Box::new(org)];
            page.apply("sources", &mut sql, &mut boxed);
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(crate::params_from(&boxed).as_slice(), row_to_source)
                .map_err(map_db_err)?;
            let mut sources = Vec::new();
            for row in rows {
                sources.push(row.map_err(map_db_err)??);
            }
            Ok(sources)
        })
        .await
    }

    pub async fn insert_file(&self, file: FileMetadata) -> Result<FileMetadata> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO files (
                    id, organization_id, source_id, file_name, mime_type, size_bytes,
                    created_at, updated_at, is_deleted
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
                "#,
                params![
                    file.id,
                    file.organization_id,
                    file.source_id,
                    file.file_name,
                    file.mime_type,
                    file.size_bytes.map(|s| s as i64),
                    file.created_at.to_rfc3339(),
                    file.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;
            Ok(file)
        })
        .await
    }

    pub async fn get_file(&self, file_id: &str, actor: &Actor) -> Result<FileMetadata> {
        let file_id = file_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files \
                 WHERE id = ?1 AND organization_id = ?2 AND is_deleted = 0"
            );
            conn.query_row(&sql, params![file_id, org], row_to_file)
                .optional()
                .map_err(map_db_err)?
                .transpose()?
                .ok_or_else(|| EngramError::not_found(format!("file {file_id}")))
        })
        .await
    }

    pub async fn list_files(&self, source_id: &str, actor: &Actor) -> Result<Vec<FileMetadata>> {
        let source_id = source_id.to_string();
        let org = actor.organization_id.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files \
                 WHERE source_id = ?1 AND organization_id = ?2 AND is_deleted = 0 \
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let rows = stmt
                .query_map(params![source_id, org], row_to_file)
                .map_err(map_db_err)?;
            let mut files = Vec::new();
            for row in rows {
                files.push(row.map_err(map_db_err)??);
            }
            Ok(files)
        })
        .await
    }
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Result<Source>> {
    Ok(build_source(row))
}

fn build_source(row: &Row<'_>) -> Result<Source> {
    let embedding_config_raw: String = row.get(3).map_err(map_db_err)?;
    let created_raw: String = row.get(4).map_err(map_db_err)?;
    let updated_raw: String = row.get(5).map_err(map_db_err)?;
    let config: EmbeddingConfig = serde_json::from_str(&embedding_config_raw)?;
    Ok(Source {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        name: row.get(2).map_err(map_db_err)?,
        embedding_config: config,
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(6).map_err(map_db_err)? != 0,
        created_by: row.get(7).map_err(map_db_err)?,
    })
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<Result<FileMetadata>> {
    Ok(build_file(row))
}

fn build_file(row: &Row<'_>) -> Result<FileMetadata> {
    let created_raw: String = row.get(6).map_err(map_db_err)?;
    let updated_raw: String = row.get(7).map_err(map_db_err)?;
    Ok(FileMetadata {
        id: row.get(0).map_err(map_db_err)?,
        organization_id: row.get(1).map_err(map_db_err)?,
        source_id: row.get(2).map_err(map_db_err)?,
        file_name: row.get(3).map_err(map_db_err)?,
        mime_type: row.get(4).map_err(map_db_err)?,
        size_bytes: row
            .get::<_, Option<i64>>(5)
            .map_err(map_db_err)?
            .map(|s| s as u64),
        created_at: parse_datetime(&created_raw)?,
        updated_at: parse_datetime(&updated_raw)?,
        is_deleted: row.get::<_, i64>(8).map_err(map_db_err)? != 0,
    })
}
