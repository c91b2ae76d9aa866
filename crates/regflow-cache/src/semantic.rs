use regflow_core::{ChunkRecord, Embedding};

/// Values that can take part in semantic lookups.
pub trait Embedded {
    fn embedding(&self) -> Option<&[f32]>;
}

impl Embedded for Embedding {
    fn embedding(&self) -> Option<&[f32]> {
        Some(self.as_slice())
    }
}

impl Embedded for ChunkRecord {
    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_ref().map(Embedding::as_slice)
    }
}

impl<T: Embedded + ?Sized> Embedded for std::sync::Arc<T> {
    fn embedding(&self) -> Option<&[f32]> {
        (**self).embedding()
    }
}

/// Outcome of a successful [`crate::MultiTierCache::get_or_similar`] lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit<K, V> {
    /// The requested key itself was cached.
    Exact(V),
    /// A different key whose embedding is close enough to the query.
    Semantic { key: K, value: V, similarity: f64 },
}

impl<K, V> CacheHit<K, V> {
    pub fn value(&self) -> &V {
        match self {
            CacheHit::Exact(value) => value,
            CacheHit::Semantic { value, .. } => value,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            CacheHit::Exact(value) => value,
            CacheHit::Semantic { value, .. } => value,
        }
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self, CacheHit::Semantic { .. })
    }
}
