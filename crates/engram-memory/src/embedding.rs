use async_trait::async_trait;
use engram_schema::{EngramError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible embedding endpoint (covers BGE-style servers too)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dimensions,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    model: String,
    data: Vec<OpenAiEmbeddingItem>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

fn extract_ordered_embeddings(parsed: OpenAiEmbeddingResponse) -> Result<Vec<Vec<f32>>> {
    let mut items = parsed.data;
    items.sort_by_key(|item| item.index);
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model: self.model.clone(),
                dimensions: self.dimensions,
            });
        }

        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = OpenAiEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".to_string(),
        };

        let response = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EngramError::unavailable(format!("embedding endpoint: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                EngramError::unavailable(format!("embedding endpoint {status}: {detail}"))
            } else {
                EngramError::invalid_argument(format!("embedding request rejected: {detail}"))
            });
        }

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngramError::unavailable(format!("embedding response: {e}")))?;
        let model = parsed.model.clone();
        let embeddings = extract_ordered_embeddings(parsed)?;

        if embeddings.len() != texts.len() {
            return Err(EngramError::internal(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        if embeddings.iter().any(|item| item.len() != self.dimensions) {
            return Err(EngramError::internal(format!(
                "embedding dimensions mismatch with configured dimensions {}",
                self.dimensions
            )));
        }

        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Deterministic provider for tests and offline runs
// ---------------------------------------------------------------------------

/// Hashes each text into a unit vector. Identical texts embed identically,
/// which is all retrieval tests need.
#[derive(Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter = 0u32;
        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            for pair in digest.chunks(2) {
                if values.len() >= self.dimensions {
                    break;
                }
                let raw = u16::from_le_bytes([pair[0], pair[1]]) as f32;
                values.push(raw / u16::MAX as f32 - 0.5);
            }
            counter += 1;
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        values
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        Ok(EmbeddingResult {
            embeddings: texts.iter().map(|t| self.embed_one(t)).collect(),
            model: "hash-embedder".to_string(),
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        "hash-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Batched embedding with bounded concurrency
// ---------------------------------------------------------------------------

/// Splits inputs into batches and runs up to `max_concurrent` provider calls
/// at once. Output order always matches input order regardless of which
/// batch lands first.
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_concurrent: usize,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: 32,
            max_concurrent: 8,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.provider)
    }

    pub async fn embed_all(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::new();
        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let batch: Vec<String> = batch.to_vec();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngramError::internal("embed semaphore closed"))?;
                let result = provider.embed(&batch).await?;
                Ok::<(usize, Vec<Vec<f32>>), EngramError>((batch_index, result.embeddings))
            }));
        }

        let mut by_batch: Vec<Option<Vec<Vec<f32>>>> = vec![None; handles.len()];
        for handle in handles {
            let (batch_index, embeddings) = handle
                .await
                .map_err(|e| EngramError::internal(format!("embed task: {e}")))??;
            by_batch[batch_index] = Some(embeddings);
        }

        let mut out = Vec::with_capacity(texts.len());
        for embeddings in by_batch {
            out.extend(embeddings.unwrap_or_default());
        }
        if out.len() != texts.len() {
            return Err(EngramError::internal(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                out.len()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hash_provider_is_deterministic() {
        let provider = HashEmbeddingProvider::new(16);
        let a = provider.embed(&["hello".into()]).await.unwrap();
        let b = provider.embed(&["hello".into()]).await.unwrap();
        assert_eq!(a.embeddings, b.embeddings);
        assert_eq!(a.embeddings[0].len(), 16);

        let c = provider.embed(&["different".into()]).await.unwrap();
        assert_ne!(a.embeddings[0], c.embeddings[0]);
    }

    #[tokio::test]
    async fn hash_provider_vectors_are_unit_length() {
        let provider = HashEmbeddingProvider::new(8);
        let result = provider.embed(&["norm me".into()]).await.unwrap();
        let norm: f32 = result.embeddings[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_embedder_preserves_input_order() {
        let provider = Arc::new(HashEmbeddingProvider::new(8));
        let embedder = BatchEmbedder::new(provider.clone())
            .with_batch_size(2)
            .with_max_concurrent(4);

        let texts: Vec<String> = (0..7).map(|i| format!("text number {i}")).collect();
        let batched = embedder.embed_all(texts.clone()).await.unwrap();
        let direct = provider.embed(&texts).await.unwrap().embeddings;
        assert_eq!(batched, direct);
    }

    #[tokio::test]
    async fn batch_embedder_empty_input() {
        let embedder = BatchEmbedder::new(Arc::new(HashEmbeddingProvider::new(8)));
        assert!(embedder.embed_all(vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn openai_provider_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-embed",
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] }
                ]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiEmbeddingProvider::with_model("key".into(), "test-embed".into(), 2)
            .with_base_url(server.uri());
        let result = provider
            .embed(&["first".into(), "second".into()])
            .await
            .unwrap();
        assert_eq!(result.embeddings[0], vec![1.0, 0.0]);
        assert_eq!(result.embeddings[1], vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn openai_provider_maps_5xx_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = OpenAiEmbeddingProvider::with_model("key".into(), "test-embed".into(), 2)
            .with_base_url(server.uri());
        let err = provider.embed(&["x".into()]).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }
}
