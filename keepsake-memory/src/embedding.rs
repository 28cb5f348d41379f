//! Embedding generation: fastembed locally, or deterministic feature hashing

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{Config, EmbeddingProvider};
use crate::error::{Error, Result};

/// Anything that turns text into a fixed-width vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

/// Pick the configured embedder. If the fastembed model cannot be loaded
/// (first run offline, corrupt cache) fall back to hashing.
pub fn build_embedder(config: &Config) -> Arc<dyn Embedder> {
    match config.embedding.provider {
        EmbeddingProvider::Hash => Arc::new(HashingEmbedder::new(config.embedding.hash_dimensions)),
        EmbeddingProvider::Fastembed => match EmbeddingService::new(config) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                warn!(error = %e, "falling back to hashing embedder");
                Arc::new(HashingEmbedder::new(config.embedding.hash_dimensions))
            }
        },
    }
}

/// Embedding service for generating vector embeddings locally
pub struct EmbeddingService {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl EmbeddingService {
    /// all-MiniLM-L6-v2, 384 dimensions. Downloads into the model cache on
    /// first use.
    pub fn new(config: &Config) -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_cache_dir(config.model_cache_dir())
                .with_show_download_progress(false),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions: 384,
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![text.to_string()], None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Signed feature hashing over word unigrams and bigrams, L2-normalized.
/// Identical text always yields the identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= 2)
            .map(str::to_lowercase)
            .collect();

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cosine similarity of two equal-length vectors; 0.0 when either is zero
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        dot / (na * nb)
    }

    #[tokio::test]
    async fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("SQLite stores the metadata").await.unwrap();
        let b = embedder.embed("SQLite stores the metadata").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn related_text_is_closer_than_unrelated() {
        let embedder = HashingEmbedder::new(256);
        let base = embedder.embed("retry the flaky network test").await.unwrap();
        let near = embedder.embed("the network test is flaky, retry it").await.unwrap();
        let far = embedder.embed("quarterly budget spreadsheet").await.unwrap();

        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[tokio::test]
    async fn empty_text_is_the_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("  ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn hash_provider_skips_model_download() {
        let mut config = Config::with_data_dir("/nonexistent");
        config.embedding.provider = EmbeddingProvider::Hash;
        config.embedding.hash_dimensions = 32;
        assert_eq!(build_embedder(&config).dimensions(), 32);
    }
}
