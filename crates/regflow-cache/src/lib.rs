//! Bounded two-tier cache used in front of the embedding service.
//!
//! L1 is a small strict-LRU tier; entries it evicts are demoted into the larger L2 tier
//! instead of being dropped. An L2 hit promotes the entry back into L1. For values that carry
//! an embedding, [`MultiTierCache::get_or_similar`] falls back to a cosine-similarity scan
//! over both tiers when the exact key is absent.

mod semantic;
mod stats;
mod tiered;

pub use semantic::{CacheHit, Embedded};
pub use stats::CacheStats;
pub use tiered::{CacheConfig, CacheTier, MultiTierCache};
