use std::sync::Arc;

use regflow_cache::{CacheConfig, CacheHit, CacheStats, Embedded, MultiTierCache};
use regflow_core::{ChunkId, ChunkRecord, Embedding, SharedClock, SystemClock};
use regflow_integrity::{
    CorruptionEvent, DetectionReport, IntegrityConfig, IntegrityError, IntegrityStore,
    RecoveryReport, RecoveryStrategy, ScanScope, StoredRecord,
};
use regflow_memory::MemoryPressure;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct CachedRecord(Arc<StoredRecord>);

impl Embedded for CachedRecord {
    fn embedding(&self) -> Option<&[f32]> {
        self.0.embedding.as_ref().map(Embedding::as_slice)
    }
}

fn record_size(record: &CachedRecord) -> usize {
    record.0.content.len() + record.0.embedding.as_ref().map_or(0, Embedding::size_bytes)
}

/// Integrity-checked chunk storage with a read-through cache.
///
/// Cached copies are dropped as soon as a scan reports their record corrupted, so a read
/// never serves data the store itself would refuse.
#[derive(Clone)]
pub struct ChunkStore {
    store: IntegrityStore,
    cache: Arc<MultiTierCache<ChunkId, CachedRecord>>,
}

impl ChunkStore {
    pub fn new(integrity: IntegrityConfig, cache: CacheConfig) -> Self {
        Self::with_clock(integrity, cache, SystemClock::shared())
    }

    pub fn with_clock(integrity: IntegrityConfig, cache: CacheConfig, clock: SharedClock) -> Self {
        let store = IntegrityStore::new(integrity);
        let cache = Arc::new(MultiTierCache::with_clock(cache, clock).with_weigher(record_size));

        let invalidate = Arc::clone(&cache);
        store.subscribe(Arc::new(move |event: &CorruptionEvent| {
            for id in &event.ids {
                invalidate.remove(id);
            }
            tracing::debug!(
                target = "regflow.pipeline",
                invalidated = event.ids.len(),
                "dropped cached copies of corrupted chunks"
            );
        }));

        Self { store, cache }
    }

    pub fn put(&self, chunk: &ChunkRecord) -> StoredRecord {
        let record = self.store.insert(chunk);
        self.cache
            .set(record.id, CachedRecord(Arc::new(record.clone())));
        record
    }

    pub fn get(&self, id: ChunkId) -> Result<StoredRecord, IntegrityError> {
        if let Some(CachedRecord(record)) = self.cache.get(&id) {
            return Ok(StoredRecord::clone(&record));
        }
        let record = self.store.get(id)?;
        self.cache.set(id, CachedRecord(Arc::new(record.clone())));
        Ok(record)
    }

    /// Cached record for `id`, or the cached record whose embedding is closest to `query`.
    pub fn find_similar(&self, id: ChunkId, query: &[f32]) -> Option<CacheHit<ChunkId, StoredRecord>> {
        let hit = self.cache.get_or_similar(&id, query)?;
        Some(match hit {
            CacheHit::Exact(CachedRecord(record)) => CacheHit::Exact(StoredRecord::clone(&record)),
            CacheHit::Semantic {
                key,
                value: CachedRecord(record),
                similarity,
            } => CacheHit::Semantic {
                key,
                value: StoredRecord::clone(&record),
                similarity,
            },
        })
    }

    pub fn remove(&self, id: ChunkId) -> bool {
        self.cache.remove(&id);
        self.store.remove(id)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn scan(&self, scope: ScanScope) -> DetectionReport {
        self.store.detect(scope)
    }

    pub fn recover(&self, scope: ScanScope, strategy: RecoveryStrategy) -> RecoveryReport {
        self.store.recover(scope, strategy)
    }

    /// Scan on the configured interval until `token` is cancelled.
    pub fn spawn_periodic_scan(&self, scope: ScanScope, token: CancellationToken) -> JoinHandle<()> {
        self.store
            .spawn_periodic_scan(self.store.config().scan_interval, scope, token)
    }

    pub fn shrink_for_pressure(&self, pressure: MemoryPressure) -> usize {
        self.cache.shrink_for_pressure(pressure)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn integrity(&self) -> &IntegrityStore {
        &self.store
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .finish()
    }
}
