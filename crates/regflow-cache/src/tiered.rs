use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use regflow_core::{cosine_similarity, SharedClock, SystemClock};
use regflow_memory::MemoryPressure;
use serde::{Deserialize, Serialize};

use crate::semantic::{CacheHit, Embedded};
use crate::stats::{CacheStats, Counters};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    /// Minimum cosine similarity for a semantic hit.
    pub similarity_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 100,
            l2_capacity: 500,
            similarity_threshold: 0.95,
        }
    }
}

/// Which tier currently owns a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    L1,
    L2,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    size_bytes: usize,
}

struct Tiers<K: Hash + Eq, V> {
    l1: LruCache<K, CacheEntry<V>>,
    l2: LruCache<K, CacheEntry<V>>,
    size_bytes: usize,
    counters: Counters,
}

/// Bounded L1/L2 cache.
///
/// Every entry lives in exactly one tier. L1 evictions are demoted into L2; L2 evictions
/// leave the cache. Both tiers are guarded by a single mutex so promotion and demotion are
/// atomic with respect to other callers.
pub struct MultiTierCache<K: Hash + Eq, V> {
    similarity_threshold: f64,
    weigher: fn(&V) -> usize,
    clock: SharedClock,
    tiers: Mutex<Tiers<K, V>>,
}

impl<K, V> MultiTierCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            weigher: shallow_size::<V>,
            clock,
            tiers: Mutex::new(Tiers {
                l1: LruCache::new(non_zero(config.l1_capacity)),
                l2: LruCache::new(non_zero(config.l2_capacity)),
                size_bytes: 0,
                counters: Counters::default(),
            }),
        }
    }

    /// Use `weigher` to estimate the footprint of each value reported by [`Self::stats`].
    pub fn with_weigher(mut self, weigher: fn(&V) -> usize) -> Self {
        self.weigher = weigher;
        self
    }

    /// Exact lookup. An L2 hit is promoted into L1.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut tiers = self.tiers.lock();
        let found = tiers.lookup_exact(key);
        if found.is_none() {
            tiers.counters.misses += 1;
        }
        found
    }

    /// Insert or replace `key`, evicting L1's least-recently-used entry into L2 if needed.
    pub fn set(&self, key: K, value: V) {
        let entry = CacheEntry {
            size_bytes: (self.weigher)(&value),
            value,
            inserted_at: self.clock.now(),
        };
        let mut tiers = self.tiers.lock();
        if let Some(stale) = tiers.l2.pop(&key) {
            tiers.size_bytes = tiers.size_bytes.saturating_sub(stale.size_bytes);
        }
        tiers.insert_l1(key, entry);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut tiers = self.tiers.lock();
        let entry = match tiers.l1.pop(key) {
            Some(entry) => entry,
            None => tiers.l2.pop(key)?,
        };
        tiers.size_bytes = tiers.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tier_of(key).is_some()
    }

    /// Tier that currently holds `key`, without touching recency.
    pub fn tier_of(&self, key: &K) -> Option<CacheTier> {
        let tiers = self.tiers.lock();
        if tiers.l1.contains(key) {
            Some(CacheTier::L1)
        } else if tiers.l2.contains(key) {
            Some(CacheTier::L2)
        } else {
            None
        }
    }

    /// Time since `key` was last written, without touching recency.
    pub fn age_of(&self, key: &K) -> Option<Duration> {
        let inserted_at = {
            let tiers = self.tiers.lock();
            tiers.l1.peek(key).or_else(|| tiers.l2.peek(key))?.inserted_at
        };
        Some(self.clock.now().saturating_duration_since(inserted_at))
    }

    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.l1.len() + tiers.l2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut tiers = self.tiers.lock();
        tiers.l1.clear();
        tiers.l2.clear();
        tiers.size_bytes = 0;
    }

    /// Shed entries in response to memory pressure and return how many were dropped.
    ///
    /// `High` drops L2; `Critical` drops both tiers.
    pub fn shrink_for_pressure(&self, pressure: MemoryPressure) -> usize {
        let mut tiers = self.tiers.lock();
        let dropped = match pressure {
            MemoryPressure::Normal | MemoryPressure::Moderate => 0,
            MemoryPressure::High => {
                let dropped = tiers.l2.len();
                tiers.l2.clear();
                dropped
            }
            MemoryPressure::Critical => {
                let dropped = tiers.l1.len() + tiers.l2.len();
                tiers.l1.clear();
                tiers.l2.clear();
                dropped
            }
        };
        if dropped > 0 {
            tiers.size_bytes = tiers.l1.iter().map(|(_, entry)| entry.size_bytes).sum();
            tiers.counters.pressure_evictions += dropped as u64;
            tracing::debug!(
                target = "regflow.cache",
                ?pressure,
                dropped,
                "shed cache entries under memory pressure"
            );
        }
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self.tiers.lock();
        let c = tiers.counters;
        CacheStats {
            l1_hits: c.l1_hits,
            l2_hits: c.l2_hits,
            semantic_hits: c.semantic_hits,
            misses: c.misses,
            lru_evictions: c.lru_evictions,
            semantic_evictions: c.semantic_evictions,
            pressure_evictions: c.pressure_evictions,
            l1_len: tiers.l1.len(),
            l2_len: tiers.l2.len(),
            l1_capacity: tiers.l1.cap().get(),
            l2_capacity: tiers.l2.cap().get(),
            size_bytes: tiers.size_bytes,
        }
    }
}

impl<K, V> MultiTierCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Embedded,
{
    /// Exact lookup, falling back to the most similar cached embedding.
    ///
    /// A semantic hit is returned as-is: it is neither promoted nor written back under `key`.
    pub fn get_or_similar(&self, key: &K, query: &[f32]) -> Option<CacheHit<K, V>> {
        let mut tiers = self.tiers.lock();
        if let Some(value) = tiers.lookup_exact(key) {
            return Some(CacheHit::Exact(value));
        }

        let best = tiers
            .l1
            .iter()
            .chain(tiers.l2.iter())
            .filter_map(|(candidate, entry)| {
                let embedding = entry.value.embedding()?;
                Some((candidate, entry, cosine_similarity(query, embedding)))
            })
            .filter(|(_, _, similarity)| *similarity >= self.similarity_threshold)
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(candidate, entry, similarity)| CacheHit::Semantic {
                key: candidate.clone(),
                value: entry.value.clone(),
                similarity,
            });

        match best {
            Some(hit) => {
                tiers.counters.semantic_hits += 1;
                Some(hit)
            }
            None => {
                tiers.counters.misses += 1;
                None
            }
        }
    }
}

impl<K: Hash + Eq, V> Tiers<K, V> {
    fn lookup_exact(&mut self, key: &K) -> Option<V>
    where
        K: Clone,
        V: Clone,
    {
        if let Some(entry) = self.l1.get(key) {
            let value = entry.value.clone();
            self.counters.l1_hits += 1;
            return Some(value);
        }

        let entry = self.l2.pop(key)?;
        let value = entry.value.clone();
        self.counters.l2_hits += 1;
        // The entry is not in L1 and L2 just freed a slot, so promotion never drops anything.
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        self.insert_l1(key.clone(), entry);
        Some(value)
    }

    fn insert_l1(&mut self, key: K, entry: CacheEntry<V>) {
        self.size_bytes = self.size_bytes.saturating_add(entry.size_bytes);

        if !self.l1.contains(&key) && self.l1.len() >= self.l1.cap().get() {
            if let Some((demoted_key, demoted)) = self.l1.pop_lru() {
                self.counters.lru_evictions += 1;
                self.insert_l2(demoted_key, demoted);
            }
        }
        if let Some(previous) = self.l1.put(key, entry) {
            self.size_bytes = self.size_bytes.saturating_sub(previous.size_bytes);
        }
    }

    fn insert_l2(&mut self, key: K, entry: CacheEntry<V>) {
        if self.l2.len() >= self.l2.cap().get() && !self.l2.contains(&key) {
            if let Some((_, dropped)) = self.l2.pop_lru() {
                self.counters.semantic_evictions += 1;
                self.size_bytes = self.size_bytes.saturating_sub(dropped.size_bytes);
            }
        }
        if let Some(previous) = self.l2.put(key, entry) {
            self.size_bytes = self.size_bytes.saturating_sub(previous.size_bytes);
        }
    }
}

impl<K: Hash + Eq, V> fmt::Debug for MultiTierCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers = self.tiers.lock();
        f.debug_struct("MultiTierCache")
            .field("l1_len", &tiers.l1.len())
            .field("l2_len", &tiers.l2.len())
            .field("similarity_threshold", &self.similarity_threshold)
            .finish()
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

fn shallow_size<V>(_: &V) -> usize {
    std::mem::size_of::<V>()
}
