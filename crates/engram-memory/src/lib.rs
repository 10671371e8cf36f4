pub mod chunker;
pub mod embedding;
pub mod ingest;
pub mod parser;
pub mod passages;

pub use chunker::{chunk_text, ChunkerConfig, TextChunk};
pub use embedding::{BatchEmbedder, EmbeddingProvider, EmbeddingResult, HashEmbeddingProvider, OpenAiEmbeddingProvider};
pub use ingest::{FileIngestor, IngestOutcome};
pub use passages::{PassageManager, PassageUpdate, ScoredPassage, SearchScope, StorageUnit};
