mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engram_audit::{AuditConfig, AuditQuery, AuditSink};
use engram_core::AgentEngine;
use engram_jobs::JobManager;
use engram_memory::{
    BatchEmbedder, EmbeddingProvider, FileIngestor, HashEmbeddingProvider, OpenAiEmbeddingProvider,
    PassageManager,
};
use engram_provider::{LlmProvider, OpenAiProvider, StubProvider};
use engram_schema::Actor;
use engram_server::state::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "engram", about = "Stateful agent server with memory, retrieval, and audit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8283")]
        addr: String,
    },
}

fn init_tracing(config: &ServerConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.data_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "engram.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

async fn build_state(config: &ServerConfig) -> Result<AppState> {
    if let Some(pg_uri) = &config.pg_uri {
        tracing::warn!(
            "PG_URI is set ({pg_uri:?}) but this build uses the embedded store at {:?}; \
             pool settings: size={:?} overflow={:?} timeout={:?} recycle={:?}",
            config.db_path(),
            config.db_pool_size,
            config.db_max_overflow,
            config.db_pool_timeout,
            config.db_pool_recycle,
        );
    }

    let store = engram_store::Store::open(&config.db_path())
        .context("open relational store")?;
    let vector = engram_store::VectorStore::new(store.clone())
        .await
        .context("open vector store")?;
    let passages = PassageManager::new(store.clone(), vector);

    let audit = AuditSink::open(
        AuditConfig {
            audit_dir: config.audit_dir.clone(),
            queue_capacity: 8192,
            workers: 2,
            enable_realtime_monitoring: config.audit_enable_realtime_monitoring,
            analyzer: Default::default(),
        },
    )
    .context("open audit sink")?;
    let audit_query = AuditQuery::new(audit.config().db_path());

    let provider: Arc<dyn LlmProvider> = match &config.llm_api_key {
        Some(key) => {
            let base = config
                .llm_api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Arc::new(OpenAiProvider::new(key.clone(), base))
        }
        None => {
            tracing::warn!("LLM_API_KEY unset, using the echo stub provider");
            Arc::new(StubProvider)
        }
    };

    let embedder: Arc<dyn EmbeddingProvider> = match &config.embedding_api_key {
        Some(key) => {
            let mut provider = OpenAiEmbeddingProvider::with_model(
                key.clone(),
                config.embedding_model.clone(),
                config.embedding_dim,
            );
            if let Some(base) = &config.embedding_api_base {
                provider = provider.with_base_url(base.clone());
            }
            Arc::new(provider)
        }
        None => {
            tracing::warn!("EMBEDDING_API_KEY unset, using the deterministic hash embedder");
            Arc::new(HashEmbeddingProvider::new(config.embedding_dim))
        }
    };

    let jobs = JobManager::new(store.clone());
    let engine = AgentEngine::new(
        store,
        passages.clone(),
        embedder.clone(),
        provider,
        jobs,
        audit,
        config.engine.clone(),
    );
    let ingestor = Arc::new(FileIngestor::new(
        passages,
        Arc::new(BatchEmbedder::new(embedder)),
    ));

    Ok(AppState {
        engine,
        ingestor,
        audit_query,
        actor: Actor::new("user-default", "org-default"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env();
    let _guard = init_tracing(&config)?;

    match cli.command {
        Command::Serve { addr } => {
            let state = build_state(&config).await?;
            engram_server::serve(state, &addr).await
        }
    }
}
