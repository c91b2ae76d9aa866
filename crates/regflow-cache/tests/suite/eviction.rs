use proptest::prelude::*;
use regflow_cache::{CacheConfig, CacheTier, MultiTierCache};

fn cache(l1: usize, l2: usize) -> MultiTierCache<u32, u32> {
    MultiTierCache::new(CacheConfig {
        l1_capacity: l1,
        l2_capacity: l2,
        ..CacheConfig::default()
    })
}

#[test]
fn evicts_exactly_the_least_recently_accessed_key() {
    let cache = cache(3, 10);
    cache.set(1, 1);
    cache.set(2, 2);
    cache.set(3, 3);

    // Touch 1 and 3; 2 becomes the least recently used entry in L1.
    assert_eq!(cache.get(&1), Some(1));
    assert_eq!(cache.get(&3), Some(3));

    cache.set(4, 4);

    assert_eq!(cache.tier_of(&2), Some(CacheTier::L2));
    for key in [1, 3, 4] {
        assert_eq!(cache.tier_of(&key), Some(CacheTier::L1), "key {key}");
    }
    assert_eq!(cache.stats().lru_evictions, 1);
}

#[test]
fn default_capacities_match_tier_sizes() {
    let cache: MultiTierCache<u32, u32> = MultiTierCache::new(CacheConfig::default());
    for key in 0..700 {
        cache.set(key, key);
    }
    let stats = cache.stats();
    assert_eq!(stats.l1_len, 100);
    assert_eq!(stats.l2_len, 500);
    assert_eq!(stats.lru_evictions, 600);
    assert_eq!(stats.semantic_evictions, 100);

    // The oldest hundred keys fell out of L2 entirely.
    assert!(!cache.contains(&99));
    assert_eq!(cache.tier_of(&100), Some(CacheTier::L2));
    assert_eq!(cache.tier_of(&699), Some(CacheTier::L1));
}

#[derive(Debug, Clone)]
enum Op {
    Set(u8),
    Get(u8),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..32).prop_map(Op::Set),
        (0u8..32).prop_map(Op::Get),
        (0u8..32).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn tiers_never_exceed_capacity(
        l1 in 1usize..6,
        l2 in 1usize..6,
        ops in prop::collection::vec(op(), 0..200),
    ) {
        let cache = cache(l1, l2);
        for op in ops {
            match op {
                Op::Set(k) => cache.set(u32::from(k), u32::from(k) * 10),
                Op::Get(k) => {
                    if let Some(value) = cache.get(&u32::from(k)) {
                        prop_assert_eq!(value, u32::from(k) * 10);
                    }
                }
                Op::Remove(k) => {
                    cache.remove(&u32::from(k));
                }
            }
            let stats = cache.stats();
            prop_assert!(stats.l1_len <= l1);
            prop_assert!(stats.l2_len <= l2);
            prop_assert_eq!(stats.l1_len + stats.l2_len, cache.len());
        }
    }
}
