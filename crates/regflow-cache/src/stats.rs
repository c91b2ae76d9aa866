use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub lru_evictions: u64,
    pub semantic_evictions: u64,
    pub pressure_evictions: u64,
}

/// Point-in-time cache statistics.
///
/// `lru_evictions` counts entries pushed out of L1 (and demoted to L2);
/// `semantic_evictions` counts entries that left the cache entirely from L2 and are
/// therefore no longer reachable by similarity search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub lru_evictions: u64,
    pub semantic_evictions: u64,
    pub pressure_evictions: u64,
    pub l1_len: usize,
    pub l2_len: usize,
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    pub size_bytes: usize,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.semantic_hits
    }

    pub fn lookups(&self) -> u64 {
        self.hits() + self.misses
    }

    /// Fraction of lookups served from either tier, exact or semantic.
    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            lookups => self.hits() as f64 / lookups as f64,
        }
    }
}
