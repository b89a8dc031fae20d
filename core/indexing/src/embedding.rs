use crate::error::BackendError;
use crate::tokenizer::WordTokenizer;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Standard size for MiniLM-class sentence encoders.
pub const DEFAULT_DIMENSION: usize = 384;

/// Text to vector collaborator.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this backend produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

/// Deterministic feature-hashing embedder.
///
/// Each term is hashed into a signed bucket and the result is L2-normalized,
/// so texts sharing vocabulary land close together. Needs no model and no
/// network; useful offline and in tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    tokenizer: WordTokenizer,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            tokenizer: WordTokenizer::new(),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];

        for term in self.tokenizer.words(text) {
            let hash = fnv1a(term.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }
        embedding
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Embeddings served by a local Ollama instance.
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let request_body = json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    BackendError::unavailable("ollama embeddings", e.to_string())
                } else {
                    BackendError::failed("ollama embeddings", e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::failed(
                "ollama embeddings",
                format!("{}: {}", status, error_text),
            ));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| BackendError::failed("ollama embeddings", e.to_string()))?;

        if parsed.embedding.len() != self.dimension {
            return Err(BackendError::failed(
                "ollama embeddings",
                format!(
                    "model {} returned {} dimensions, expected {}",
                    self.model,
                    parsed.embedding.len(),
                    self.dimension
                ),
            ));
        }

        debug!("Embedded {} chars with {}", text.len(), self.model);
        Ok(parsed.embedding)
    }
}

/// Select an embedding backend from environment variables.
///
/// `EMBEDDING_PROVIDER` is `ollama`, `hashing` or unset (no vector search).
/// `EMBEDDING_MODEL`, `EMBEDDING_DIMENSION` and `OLLAMA_URL` tune the
/// Ollama backend.
pub fn embedder_from_env() -> Option<Arc<dyn EmbeddingBackend>> {
    let provider = std::env::var("EMBEDDING_PROVIDER").ok()?;
    let dimension = std::env::var("EMBEDDING_DIMENSION")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_DIMENSION);

    match provider.to_lowercase().as_str() {
        "ollama" => {
            let base_url = std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            let model = std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "all-minilm".to_string());
            info!("Using Ollama embeddings: {} at {} ({} dims)", model, base_url, dimension);
            Some(Arc::new(OllamaEmbedder::new(base_url, model, dimension)))
        }
        "hashing" => {
            info!("Using hashing embeddings ({} dims)", dimension);
            Some(Arc::new(HashingEmbedder::new(dimension)))
        }
        "" | "none" | "disabled" => None,
        other => {
            warn!("Unknown EMBEDDING_PROVIDER '{}', vector search disabled", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("user prefers green tea").await.unwrap();
        let b = embedder.embed("user prefers green tea").await.unwrap();
        assert_eq!(a.len(), DEFAULT_DIMENSION);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shared_vocabulary_is_closer() {
        let embedder = HashingEmbedder::new(256);
        let tea = embedder.embed_sync("green tea every morning");
        let tea2 = embedder.embed_sync("green tea in the morning");
        let cars = embedder.embed_sync("sports cars racing engines");

        assert!(cosine_similarity(&tea, &tea2) > cosine_similarity(&tea, &cars));
    }

    #[test]
    fn test_empty_text_gives_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let embedding = embedder.embed_sync("");
        assert!(embedding.iter().all(|v| *v == 0.0));
    }
}
