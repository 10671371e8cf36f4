use engram_schema::Result;
use rusqlite::Connection;

use crate::map_db_err;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"#,
    )
    .map_err(map_db_err)?;

    let applied: std::collections::HashSet<i64> = {
        let mut stmt = conn
            .prepare("SELECT version FROM __schema_version")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(map_db_err)?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let migrations: Vec<(i64, &str)> = vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                tool_names TEXT NOT NULL DEFAULT '[]',
                source_ids TEXT NOT NULL DEFAULT '[]',
                llm_config TEXT NOT NULL,
                embedding_config TEXT NOT NULL,
                top_k INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                updated_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agents_org ON agents(organization_id, is_deleted);

            CREATE TABLE IF NOT EXISTS memory_blocks (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                label TEXT NOT NULL,
                value TEXT NOT NULL,
                block_limit INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                UNIQUE(agent_id, label)
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_agent ON memory_blocks(agent_id, is_deleted);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT NOT NULL DEFAULT '[]',
                tool_call_id TEXT,
                step_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(agent_id, created_at, id);

            CREATE TABLE IF NOT EXISTS passages_agent (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                embedding_endpoint TEXT,
                embedding_dim INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                updated_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_passages_agent_owner ON passages_agent(agent_id, is_deleted);

            CREATE TABLE IF NOT EXISTS passages_source (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                embedding_endpoint TEXT,
                embedding_dim INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                updated_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_passages_source_owner ON passages_source(source_id, is_deleted);
            CREATE INDEX IF NOT EXISTS idx_passages_source_file ON passages_source(file_id, is_deleted);

            CREATE TABLE IF NOT EXISTS passage_embeddings (
                passage_id TEXT PRIMARY KEY,
                embedding TEXT NOT NULL,
                embedding_dim INTEGER NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_passage_embeddings_dim ON passage_embeddings(embedding_dim);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',
                request_config TEXT NOT NULL DEFAULT 'null',
                callback_url TEXT,
                completed_at TEXT,
                callback_sent_at TEXT,
                callback_status_code INTEGER,
                callback_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id, job_type, is_deleted);

            CREATE TABLE IF NOT EXISTS job_messages (
                job_id TEXT NOT NULL,
                message_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                PRIMARY KEY (job_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                agent_id TEXT,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_job ON steps(job_id, created_at);

            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                embedding_config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_by TEXT
            );

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                mime_type TEXT,
                size_bytes INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_files_source ON files(source_id, is_deleted);

            CREATE TABLE IF NOT EXISTS sources_agents (
                source_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS tools (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                input_schema TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                UNIQUE(organization_id, name)
            );

            CREATE TABLE IF NOT EXISTS agents_tools (
                agent_id TEXT NOT NULL,
                tool_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (agent_id, tool_id)
            );
            "#,
        ),
    ];

    for (version, sql) in migrations {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql).map_err(map_db_err)?;
        conn.execute(
            "INSERT INTO __schema_version(version) VALUES (?1)",
            [version],
        )
        .map_err(map_db_err)?;
    }

    Ok(())
}
