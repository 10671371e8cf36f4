//! Environment-driven configuration. Every variable is optional; the
//! defaults give a fully local deployment (embedded DB, stub providers).

use std::path::PathBuf;
use std::time::Duration;

use engram_core::EngineConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Relational DB URI. Unset means the embedded file DB under
    /// `data_dir`. A Postgres DSN is accepted for forward compatibility but
    /// this build still opens the embedded store.
    pub pg_uri: Option<String>,
    pub data_dir: PathBuf,
    pub db_pool_size: Option<u32>,
    pub db_max_overflow: Option<u32>,
    pub db_pool_timeout: Option<u32>,
    pub db_pool_recycle: Option<u32>,
    pub llm_api_base: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub embedding_api_base: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub audit_dir: PathBuf,
    pub audit_enable_realtime_monitoring: bool,
    pub engine: EngineConfig,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env_string(name) {
        Some(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring unparseable {name}={raw:?}");
                None
            }
        },
        None => None,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        Some(other) => {
            tracing::warn!("ignoring unparseable {name}={other:?}");
            default
        }
        None => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut engine = EngineConfig::default();
        if let Some(max_steps) = env_parse::<usize>("MAX_STEPS_PER_TURN") {
            engine.max_steps = max_steps;
        }
        if let Some(seconds) = env_parse::<u64>("PER_TURN_DEADLINE_SECONDS") {
            engine.turn_deadline = Duration::from_secs(seconds);
        }
        if let Some(top_k) = env_parse::<usize>("DEFAULT_TOP_K") {
            engine.default_top_k = top_k;
        }

        Self {
            pg_uri: env_string("PG_URI"),
            data_dir: env_string("ENGRAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            db_pool_size: env_parse("DB_POOL_SIZE"),
            db_max_overflow: env_parse("DB_MAX_OVERFLOW"),
            db_pool_timeout: env_parse("DB_POOL_TIMEOUT"),
            db_pool_recycle: env_parse("DB_POOL_RECYCLE"),
            llm_api_base: env_string("LLM_API_BASE"),
            llm_api_key: env_string("LLM_API_KEY"),
            llm_model: env_string("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            embedding_api_base: env_string("EMBEDDING_API_BASE"),
            embedding_api_key: env_string("EMBEDDING_API_KEY"),
            embedding_model: env_string("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_dim: env_parse("EMBEDDING_DIM").unwrap_or(1536),
            audit_dir: env_string("AUDIT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
            audit_enable_realtime_monitoring: env_bool("AUDIT_ENABLE_REALTIME_MONITORING", true),
            engine,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("engram.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local() {
        // env-free construction of the defaults
        let config = ServerConfig {
            pg_uri: None,
            data_dir: PathBuf::from("./data"),
            db_pool_size: None,
            db_max_overflow: None,
            db_pool_timeout: None,
            db_pool_recycle: None,
            llm_api_base: None,
            llm_api_key: None,
            llm_model: "gpt-4o-mini".into(),
            embedding_api_base: None,
            embedding_api_key: None,
            embedding_model: "text-embedding-3-small".into(),
            embedding_dim: 1536,
            audit_dir: PathBuf::from("./logs"),
            audit_enable_realtime_monitoring: true,
            engine: EngineConfig::default(),
        };
        assert_eq!(config.db_path(), PathBuf::from("./data/engram.db"));
        assert_eq!(config.engine.max_steps, 8);
        assert_eq!(config.engine.default_top_k, 3);
    }
}
