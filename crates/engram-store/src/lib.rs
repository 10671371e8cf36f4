//! Embedded relational store: typed row-level CRUD with organization-scoped
//! access, soft delete, cursor paging, and the passage vector mirror.
//!
//! All queries run on a shared `rusqlite::Connection` behind a mutex, moved
//! onto the blocking pool per call. Reads always carry the access predicate
//! (`organization_id = actor.org AND is_deleted = 0`); a row outside the
//! actor's organization is indistinguishable from a missing one.

mod agents;
mod jobs;
mod messages;
mod migrations;
mod passages;
mod sources;
mod tools;
pub mod vector;

pub use jobs::JobFilter;
pub use vector::{VectorBackend, VectorMatch, VectorStore};

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use engram_schema::{EngramError, Result};
use rusqlite::Connection;

use crate::migrations::run_migrations;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

/// Register sqlite-vec as an auto extension. Must run before the first
/// `Connection::open`.
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngramError::internal(format!("create db dir: {e}")))?;
        }
        init_sqlite_vec();
        let conn = Connection::open(path).map_err(map_db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_db_err)?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory().map_err(map_db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_db_err)?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    /// Run `f` with the locked connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| EngramError::internal("sqlite connection poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| EngramError::internal(format!("blocking task: {e}")))?
    }
}

pub(crate) fn map_db_err(e: rusqlite::Error) -> EngramError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => EngramError::not_found("row not found"),
        rusqlite::Error::SqliteFailure(code, msg) => {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                EngramError::conflict(
                    msg.clone()
                        .unwrap_or_else(|| "unique constraint violation".to_string()),
                )
            } else {
                EngramError::internal(format!("sqlite: {e}"))
            }
        }
        _ => EngramError::internal(format!("sqlite: {e}")),
    }
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngramError::internal(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_datetime(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => Ok(Some(parse_datetime(&s)?)),
        None => Ok(None),
    }
}

/// Cursor paging over `(created_at, id)`. `after` selects rows strictly
/// beyond the cursor in the requested order, `before` strictly before it;
/// ties break on id. Paging stays stable under concurrent inserts because
/// the cursor is an absolute position, not an offset.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
    pub ascending: bool,
}

impl Page {
    pub fn ascending(limit: usize) -> Self {
        Self {
            before: None,
            after: None,
            limit,
            ascending: true,
        }
    }

    pub fn descending(limit: usize) -> Self {
        Self {
            before: None,
            after: None,
            limit,
            ascending: false,
        }
    }

    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self
    }

    /// Append cursor predicates and the ORDER BY / LIMIT tail for `table`.
    /// Cursor ids are resolved through a correlated subquery so callers pass
    /// plain row ids.
    pub(crate) fn apply(
        &self,
        table: &str,
        sql: &mut String,
        params: &mut Vec<Box<dyn rusqlite::types::ToSql + Send>>,
    ) {
        let (after_op, before_op) = if self.ascending {
            (">", "<")
        } else {
            ("<", ">")
        };
        if let Some(after) = &self.after {
            sql.push_str(&format!(
                " AND (created_at, id) {after_op} (SELECT created_at, id FROM {table} WHERE id = ?)"
            ));
            params.push(Box::new(after.clone()));
        }
        if let Some(before) = &self.before {
            sql.push_str(&format!(
                " AND (created_at, id) {before_op} (SELECT created_at, id FROM {table} WHERE id = ?)"
            ));
            params.push(Box::new(before.clone()));
        }
        let dir = if self.ascending { "ASC" } else { "DESC" };
        sql.push_str(&format!(" ORDER BY created_at {dir}, id {dir} LIMIT ?"));
        params.push(Box::new(self.limit as i64));
    }
}

pub(crate) fn params_from(
    boxed: &[Box<dyn rusqlite::types::ToSql + Send>],
) -> Vec<&dyn rusqlite::types::ToSql> {
    boxed.iter().map(|b| b.as_ref() as &dyn rusqlite::types::ToSql).collect()
}

pub(crate) fn embedding_to_json(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 10 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{v}"));
    }
    out.push(']');
    out
}

pub(crate) fn embedding_from_json(raw: &str) -> Result<Vec<f32>> {
    serde_json::from_str(raw)
        .map_err(|e| EngramError::internal(format!("bad embedding payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_succeeds() {
        let store = Store::open_in_memory();
        assert!(store.is_ok());
    }

    #[test]
    fn sqlite_vec_extension_loaded() {
        let store = Store::open_in_memory().expect("store");
        let db = store.db.lock().expect("lock");
        let version: String = db
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .expect("vec_version");
        assert!(!version.is_empty());
    }

    #[test]
    fn embedding_json_round_trip() {
        let embedding = vec![0.25_f32, -1.5, 3.0];
        let json = embedding_to_json(&embedding);
        assert_eq!(embedding_from_json(&json).unwrap(), embedding);
    }

    #[test]
    fn map_db_err_translates_constraint_violations() {
        let store = Store::open_in_memory().expect("store");
        let db = store.db.lock().expect("lock");
        db.execute(
            "INSERT INTO organizations (id, name, created_at, updated_at, is_deleted) VALUES ('org-1', 'a', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 0)",
            [],
        )
        .expect("first insert");
        let err = db
            .execute(
                "INSERT INTO organizations (id, name, created_at, updated_at, is_deleted) VALUES ('org-1', 'b', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 0)",
                [],
            )
            .map_err(map_db_err)
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }
}
