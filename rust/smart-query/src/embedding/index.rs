//! Generation-swapped vector index over schema entities.
//!
//! Readers take an `Arc<IndexGeneration>` and keep using it for the rest of
//! their request, so a rebuild never changes what an in-flight request sees.
//! Builds are serialized; a build for a revision that is not newer than the
//! published one is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::embedding::{EmbeddingProvider, cosine_similarity};
use crate::error::{PipelineError, PipelineResult, ProviderError};
use crate::schema::SchemaSnapshot;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntity {
    pub qualified_name: String,
    pub score: f32,
}

/// Immutable embeddings for one schema revision.
#[derive(Debug)]
pub struct IndexGeneration {
    revision: u64,
    dimension: usize,
    snapshot: Arc<SchemaSnapshot>,
    entries: Vec<(String, Vec<f32>)>,
}

impl IndexGeneration {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Snapshot the embeddings were computed from.
    pub fn snapshot(&self) -> &Arc<SchemaSnapshot> {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` entities by cosine similarity, best first. Ties are broken by
    /// qualified name so results are deterministic.
    pub fn similarity_search(&self, query: &[f32], k: usize) -> PipelineResult<Vec<ScoredEntity>> {
        if query.len() != self.dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }

        let mut scored: Vec<ScoredEntity> = self
            .entries
            .iter()
            .map(|(name, vector)| ScoredEntity {
                qualified_name: name.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.qualified_name.cmp(&b.qualified_name))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Embedding index shared by all requests.
pub struct EmbeddingIndex {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    current: RwLock<Option<Arc<IndexGeneration>>>,
    build_lock: tokio::sync::Mutex<()>,
    /// Vectors by embedding text, reused across rebuilds.
    memo: Mutex<HashMap<String, Vec<f32>>>,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("provider", &self.provider.name())
            .field("batch_size", &self.batch_size)
            .field("revision", &self.published_revision())
            .finish_non_exhaustive()
    }
}

impl EmbeddingIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            current: RwLock::new(None),
            build_lock: tokio::sync::Mutex::new(()),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// The published generation.
    pub fn current(&self) -> PipelineResult<Arc<IndexGeneration>> {
        self.current
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(PipelineError::IndexNotReady)
    }

    pub fn published_revision(&self) -> Option<u64> {
        self.current.read().as_ref().map(|g| g.revision)
    }

    /// Embed every entity of `snapshot` and publish the result.
    ///
    /// Texts embedded by an earlier build are reused. On failure the
    /// previous generation stays published.
    pub async fn build(&self, snapshot: Arc<SchemaSnapshot>) -> PipelineResult<Arc<IndexGeneration>> {
        let _guard = self.build_lock.lock().await;

        if let Ok(current) = self.current() {
            if current.revision >= snapshot.revision() {
                tracing::debug!(
                    requested = snapshot.revision(),
                    published = current.revision,
                    "Index already at or beyond requested revision"
                );
                return Ok(current);
            }
        }

        let dimension = self.provider.dimension();
        let missing: Vec<String> = {
            let memo = self.memo.lock();
            let mut seen = std::collections::HashSet::new();
            snapshot
                .entities()
                .iter()
                .map(|e| &e.embedding_text)
                .filter(|text| !memo.contains_key(*text) && seen.insert(*text))
                .cloned()
                .collect()
        };

        tracing::info!(
            revision = snapshot.revision(),
            entities = snapshot.entities().len(),
            to_embed = missing.len(),
            provider = self.provider.name(),
            "Building embedding index"
        );

        for batch in missing.chunks(self.batch_size) {
            let vectors = self.provider.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(ProviderError::Malformed(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                ))
                .into());
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                return Err(ProviderError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len(),
                }
                .into());
            }
            let mut memo = self.memo.lock();
            for (text, vector) in batch.iter().zip(vectors) {
                memo.insert(text.clone(), vector);
            }
        }

        let generation = {
            let mut memo = self.memo.lock();
            let entries: Vec<(String, Vec<f32>)> = snapshot
                .entities()
                .iter()
                .filter_map(|e| {
                    memo.get(&e.embedding_text)
                        .map(|v| (e.qualified_name.clone(), v.clone()))
                })
                .collect();
            let live: std::collections::HashSet<&str> = snapshot
                .entities()
                .iter()
                .map(|e| e.embedding_text.as_str())
                .collect();
            memo.retain(|text, _| live.contains(text.as_str()));

            Arc::new(IndexGeneration {
                revision: snapshot.revision(),
                dimension,
                snapshot: Arc::clone(&snapshot),
                entries,
            })
        };

        *self.current.write() = Some(Arc::clone(&generation));
        tracing::info!(
            revision = generation.revision,
            entries = generation.len(),
            "Embedding index published"
        );
        Ok(generation)
    }

    /// Embed `query` and search the published generation.
    pub async fn similarity_search(&self, query: &str, k: usize) -> PipelineResult<Vec<ScoredEntity>> {
        let generation = self.current()?;
        let vector = self.provider.embed(query).await?;
        generation.similarity_search(&vector, k)
    }
}
