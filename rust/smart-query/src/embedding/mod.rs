//! Schema embeddings and similarity search.
//!
//! An [`EmbeddingProvider`] turns text into fixed-length vectors. The
//! [`EmbeddingIndex`] embeds every entity of a schema snapshot and publishes
//! the result as one immutable [`IndexGeneration`].

pub mod index;
pub mod providers;

pub use index::{EmbeddingIndex, IndexGeneration, ScoredEntity};
pub use providers::{HashingEmbedder, OpenAiEmbedder};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, EmbeddingProviderKind};
use crate::error::ProviderError;

/// Text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed several texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Malformed("provider returned no embedding".to_string()))
    }

    /// Declared vector length.
    fn dimension(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Create the embedding provider selected by `embedding.provider`.
pub fn create_embedder(config: &AppConfig) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    let embedding = &config.embedding;
    match embedding.provider {
        EmbeddingProviderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(embedding.dimension))),
        EmbeddingProviderKind::OpenAi => {
            let openai = &config.providers.openai;
            Ok(Arc::new(OpenAiEmbedder::new(
                openai
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                openai.api_key.clone(),
                embedding.model.clone(),
                embedding.dimension,
                embedding.timeout(),
            )?))
        }
    }
}

/// Cosine similarity; zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
