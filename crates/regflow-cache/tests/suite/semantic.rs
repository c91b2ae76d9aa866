use regflow_cache::{CacheConfig, CacheHit, MultiTierCache};
use regflow_core::Embedding;

fn cache() -> MultiTierCache<String, Embedding> {
    MultiTierCache::new(CacheConfig {
        l1_capacity: 4,
        l2_capacity: 4,
        similarity_threshold: 0.95,
    })
}

// Unit vectors at a known cosine similarity from `[1, 0]`.
fn at_similarity(similarity: f32) -> Embedding {
    Embedding::new(vec![similarity, (1.0 - similarity * similarity).sqrt()])
}

#[test]
fn similarity_above_threshold_is_a_semantic_hit() {
    let cache = cache();
    cache.set("cost accounting standards".into(), at_similarity(0.96));

    let hit = cache
        .get_or_similar(&"cost accounting rules".to_string(), &[1.0, 0.0])
        .expect("semantic hit");
    match hit {
        CacheHit::Semantic { key, similarity, .. } => {
            assert_eq!(key, "cost accounting standards");
            assert!((similarity - 0.96).abs() < 1e-4);
        }
        other => panic!("expected semantic hit, got {other:?}"),
    }

    // Semantic hits are not written back under the queried key.
    assert!(!cache.contains(&"cost accounting rules".to_string()));
    let stats = cache.stats();
    assert_eq!(stats.semantic_hits, 1);
    assert_eq!(stats.misses, 0);
}

#[test]
fn similarity_below_threshold_misses() {
    let cache = cache();
    cache.set("small business set-asides".into(), at_similarity(0.80));

    assert!(cache
        .get_or_similar(&"unrelated".to_string(), &[1.0, 0.0])
        .is_none());
    let stats = cache.stats();
    assert_eq!(stats.semantic_hits, 0);
    assert_eq!(stats.misses, 1);
}

#[test]
fn exact_key_wins_over_similar_entries() {
    let cache = cache();
    cache.set("a".into(), at_similarity(0.99));
    cache.set("b".into(), at_similarity(0.10));

    let hit = cache.get_or_similar(&"b".to_string(), &[1.0, 0.0]).unwrap();
    assert_eq!(hit, CacheHit::Exact(at_similarity(0.10)));
    assert_eq!(cache.stats().l1_hits, 1);
}

#[test]
fn best_match_is_chosen_across_both_tiers() {
    let cache = MultiTierCache::<String, Embedding>::new(CacheConfig {
        l1_capacity: 1,
        l2_capacity: 4,
        similarity_threshold: 0.95,
    });
    cache.set("close".into(), at_similarity(0.99));
    cache.set("closer".into(), at_similarity(0.999));
    cache.set("far".into(), at_similarity(0.5));

    let hit = cache.get_or_similar(&"query".to_string(), &[1.0, 0.0]).unwrap();
    assert!(hit.is_semantic());
    match hit {
        CacheHit::Semantic { key, .. } => assert_eq!(key, "closer"),
        CacheHit::Exact(_) => unreachable!(),
    }
}

#[test]
fn similar_keys_are_never_merged() {
    let cache = cache();
    cache.set("far 15.404".into(), at_similarity(0.99));
    cache.set("far 15.404-1".into(), at_similarity(0.99));
    assert_eq!(cache.len(), 2);
    assert_eq!(
        cache.get(&"far 15.404".to_string()),
        Some(at_similarity(0.99))
    );
}

#[test]
fn mismatched_dimensions_never_match() {
    let cache = cache();
    cache.set("3d".into(), Embedding::new(vec![1.0, 0.0, 0.0]));
    assert!(cache.get_or_similar(&"q".to_string(), &[1.0, 0.0]).is_none());
}
