use std::sync::Arc;

use async_trait::async_trait;
use regflow_cache::{CacheConfig, CacheHit, CacheStats, MultiTierCache};
use regflow_core::Embedding;
use regflow_memory::MemoryPressure;
use regflow_scheduler::ProcessingError;

/// The embedding collaborator: turns chunk text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every input, returning one vector per input in order.
    async fn embed_batch(&self, input: &[String]) -> Result<Vec<Embedding>, ProcessingError>;
}

/// Fronts an [`Embedder`] with a two-tier cache keyed by the exact input text.
///
/// Only cache misses reach the embedder, in one call per [`CachedEmbedder::embed`].
pub struct CachedEmbedder {
    embedder: Arc<dyn Embedder>,
    cache: MultiTierCache<String, Embedding>,
}

impl CachedEmbedder {
    pub fn new(embedder: Arc<dyn Embedder>, config: CacheConfig) -> Self {
        Self {
            embedder,
            cache: MultiTierCache::new(config).with_weigher(Embedding::size_bytes),
        }
    }

    pub async fn embed(&self, input: &[String]) -> Result<Vec<Embedding>, ProcessingError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = vec![None::<Embedding>; input.len()];
        let mut miss_indices = Vec::new();
        let mut miss_inputs = Vec::new();
        for (idx, text) in input.iter().enumerate() {
            match self.cache.get(text) {
                Some(hit) => out[idx] = Some(hit),
                None => {
                    miss_indices.push(idx);
                    miss_inputs.push(text.clone());
                }
            }
        }

        if !miss_inputs.is_empty() {
            let embeddings = self.embedder.embed_batch(&miss_inputs).await?;
            if embeddings.len() != miss_inputs.len() {
                return Err(ProcessingError::permanent(format!(
                    "embedder returned unexpected batch size: expected {}, got {}",
                    miss_inputs.len(),
                    embeddings.len()
                )));
            }
            tracing::trace!(
                target = "regflow.pipeline",
                hits = input.len() - miss_inputs.len(),
                misses = miss_inputs.len(),
                "embedded batch"
            );

            for ((idx, text), embedding) in miss_indices.into_iter().zip(miss_inputs).zip(embeddings)
            {
                self.cache.set(text, embedding.clone());
                out[idx] = Some(embedding);
            }
        }

        out.into_iter()
            .enumerate()
            .map(|(idx, item)| {
                item.ok_or_else(|| {
                    ProcessingError::permanent(format!("missing embedding output for index {idx}"))
                })
            })
            .collect()
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Embedding, ProcessingError> {
        let mut out = self.embed(&[text.to_owned()]).await?;
        out.pop()
            .ok_or_else(|| ProcessingError::permanent("embedder returned no output"))
    }

    /// Exact lookup for `text`, falling back to the cached vector most similar to `query`.
    ///
    /// Never calls the embedder.
    pub fn lookup(&self, text: &str, query: &[f32]) -> Option<CacheHit<String, Embedding>> {
        self.cache.get_or_similar(&text.to_owned(), query)
    }

    pub fn shrink_for_pressure(&self, pressure: MemoryPressure) -> usize {
        self.cache.shrink_for_pressure(pressure)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl std::fmt::Debug for CachedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEmbedder")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
