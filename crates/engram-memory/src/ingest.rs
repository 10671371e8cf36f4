//! Document ingestion: parse an uploaded file, chunk it, embed the chunks,
//! and write source passages (with their vector mirror). The job lifecycle
//! around an ingestion run is driven by the caller.

use std::sync::Arc;

use chrono::Utc;
use engram_schema::{
    id_prefix, new_id, Actor, EngramError, FileMetadata, Result, Source, UsageStats,
};

use crate::chunker::{chunk_text, ChunkerConfig};
use crate::embedding::BatchEmbedder;
use crate::parser::extract_text;
use crate::passages::PassageManager;

#[derive(Debug)]
pub struct IngestOutcome {
    pub file: FileMetadata,
    pub passage_count: usize,
    /// Rough token accounting for the embedding calls (chars / 4).
    pub usage: UsageStats,
}

pub struct FileIngestor {
    passages: PassageManager,
    embedder: Arc<BatchEmbedder>,
    chunker: ChunkerConfig,
}

impl FileIngestor {
    pub fn new(passages: PassageManager, embedder: Arc<BatchEmbedder>) -> Self {
        Self {
            passages,
            embedder,
            chunker: ChunkerConfig::default(),
        }
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    /// Run one file through parse -> chunk -> embed -> write. The file row
    /// is created even when the document yields no chunks, so re-uploads
    /// stay traceable.
    pub async fn ingest_file(
        &self,
        source: &Source,
        file_name: &str,
        mime_type: Option<&str>,
        content: &[u8],
        actor: &Actor,
    ) -> Result<IngestOutcome> {
        let provider = self.embedder.provider();
        if provider.dimensions() != source.embedding_config.dim {
            return Err(EngramError::invalid_argument(format!(
                "embedder produces {} dims but source {} is pinned to {}",
                provider.dimensions(),
                source.id,
                source.embedding_config.dim
            )));
        }

        let text = extract_text(content, file_name, mime_type)?;
        let chunks = chunk_text(&text, &self.chunker);

        let now = Utc::now();
        let file = FileMetadata {
            id: new_id(id_prefix::FILE),
            organization_id: actor.organization_id.clone(),
            source_id: source.id.clone(),
            file_name: file_name.to_string(),
            mime_type: mime_type.map(|m| m.to_string()),
            size_bytes: Some(content.len() as u64),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        let file = self.passages.store().insert_file(file).await?;

        if chunks.is_empty() {
            return Ok(IngestOutcome {
                file,
                passage_count: 0,
                usage: UsageStats::default(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded_chars: usize = texts.iter().map(|t| t.chars().count()).sum();
        let embeddings = self.embedder.embed_all(texts).await?;

        let passages: Vec<_> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                PassageManager::new_source_passage(
                    &source.id,
                    &file.id,
                    &file.file_name,
                    chunk.text.clone(),
                    embedding,
                    source.embedding_config.clone(),
                    actor,
                )
            })
            .collect();
        let created = self
            .passages
            .create_many_source_passages(passages, actor)
            .await?;

        let token_estimate = (embedded_chars / 4) as u64;
        Ok(IngestOutcome {
            file,
            passage_count: created.len(),
            usage: UsageStats {
                prompt_tokens: token_estimate,
                completion_tokens: 0,
                total_tokens: token_estimate,
                step_count: 1,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashEmbeddingProvider};
    use crate::passages::SearchScope;
    use engram_schema::EmbeddingConfig;
    use engram_store::{Store, VectorStore};

    async fn fixture() -> (FileIngestor, PassageManager, Source, Actor) {
        let store = Store::open_in_memory().unwrap();
        let vector = VectorStore::new(store.clone()).await.unwrap();
        let passages = PassageManager::new(store.clone(), vector);
        let actor = Actor::new("user-1", "org-1");

        let now = Utc::now();
        let source = Source {
            id: new_id(id_prefix::SOURCE),
            organization_id: "org-1".into(),
            name: "docs".into(),
            embedding_config: EmbeddingConfig::new("hash-embedder", 16),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            created_by: None,
        };
        store.insert_source(source.clone(), &actor).await.unwrap();

        let embedder = Arc::new(BatchEmbedder::new(Arc::new(HashEmbeddingProvider::new(16))));
        let ingestor = FileIngestor::new(passages.clone(), embedder);
        (ingestor, passages, source, actor)
    }

    #[tokio::test]
    async fn ingest_then_retrieve() {
        let (ingestor, passages, source, actor) = fixture().await;
        let outcome = ingestor
            .ingest_file(
                &source,
                "sky.txt",
                Some("text/plain"),
                b"The sky is blue.",
                &actor,
            )
            .await
            .unwrap();
        assert_eq!(outcome.passage_count, 1);
        assert!(outcome.usage.total_tokens > 0);

        // the ingested chunk is retrievable with the embedding of its own text
        let provider = HashEmbeddingProvider::new(16);
        let query = provider
            .embed(&["The sky is blue.".into()])
            .await
            .unwrap()
            .embeddings
            .remove(0);
        let hits = passages
            .search_similar(&query, 3, 0.5, SearchScope::Source(source.id.clone()), &actor)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].passage.text.contains("blue"));
    }

    #[tokio::test]
    async fn ingest_empty_file_writes_file_row_only() {
        let (ingestor, passages, source, actor) = fixture().await;
        let outcome = ingestor
            .ingest_file(&source, "empty.txt", Some("text/plain"), b"  \n\n ", &actor)
            .await
            .unwrap();
        assert_eq!(outcome.passage_count, 0);
        assert_eq!(
            passages.source_passage_size(&actor, Some(&source.id)).await.unwrap(),
            0
        );
        let files = passages
            .store()
            .list_files(&source.id, &actor)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "empty.txt");
    }

    #[tokio::test]
    async fn ingest_rejects_dimension_mismatch() {
        let (_, passages, mut source, actor) = fixture().await;
        source.embedding_config.dim = 32;
        let embedder = Arc::new(BatchEmbedder::new(Arc::new(HashEmbeddingProvider::new(16))));
        let ingestor = FileIngestor::new(passages, embedder);
        let err = ingestor
            .ingest_file(&source, "a.txt", Some("text/plain"), b"text", &actor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn passages_carry_file_identity() {
        let (ingestor, passages, source, actor) = fixture().await;
        let outcome = ingestor
            .ingest_file(
                &source,
                "handbook.md",
                None,
                "# One\n\nalpha\n\n# Two\n\nbeta".as_bytes(),
                &actor,
            )
            .await
            .unwrap();
        assert!(outcome.passage_count >= 1);

        let by_file = passages
            .list_passages_by_file_id(&outcome.file.id, &actor)
            .await
            .unwrap();
        assert_eq!(by_file.len(), outcome.passage_count);
        for passage in by_file {
            match passage.owner {
                engram_schema::PassageOwner::Source {
                    ref file_id,
                    ref file_name,
                    ..
                } => {
                    assert_eq!(file_id, &outcome.file.id);
                    assert_eq!(file_name, "handbook.md");
                }
                _ => panic!("expected source passage"),
            }
        }
    }

    #[tokio::test]
    async fn unsupported_type_surfaces_invalid_argument() {
        let (ingestor, _, source, actor) = fixture().await;
        let err = ingestor
            .ingest_file(&source, "image.png", Some("image/png"), &[0u8; 8], &actor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }
}
