use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regflow_cache::CacheConfig;
use regflow_core::Embedding;
use regflow_pipeline::{CachedEmbedder, Embedder};
use regflow_scheduler::ProcessingError;

/// Embeds text as `[len, vowels]` and records every batch it is asked for.
#[derive(Default)]
struct RecordingEmbedder {
    calls: Mutex<Vec<Vec<String>>>,
    truncate: bool,
}

#[async_trait]
impl Embedder for RecordingEmbedder {
    async fn embed_batch(&self, input: &[String]) -> Result<Vec<Embedding>, ProcessingError> {
        self.calls.lock().push(input.to_vec());
        let mut out: Vec<Embedding> = input
            .iter()
            .map(|text| {
                let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
                Embedding::new(vec![text.len() as f32, vowels as f32])
            })
            .collect();
        if self.truncate {
            out.pop();
        }
        Ok(out)
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

#[tokio::test]
async fn only_misses_reach_the_embedder() {
    let inner = Arc::new(RecordingEmbedder::default());
    let embedder = CachedEmbedder::new(inner.clone(), CacheConfig::default());

    let first = embedder.embed(&strings(&["price", "cost"])).await.unwrap();
    let second = embedder.embed(&strings(&["cost", "award"])).await.unwrap();

    assert_eq!(first[1], second[0]);
    assert_eq!(second[1], Embedding::new(vec![5.0, 2.0]));
    assert_eq!(
        *inner.calls.lock(),
        [strings(&["price", "cost"]), strings(&["award"])]
    );

    let stats = embedder.stats();
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.misses, 3);
}

#[tokio::test]
async fn fully_cached_batches_skip_the_embedder() {
    let inner = Arc::new(RecordingEmbedder::default());
    let embedder = CachedEmbedder::new(inner.clone(), CacheConfig::default());
    embedder.embed_one("subcontract").await.unwrap();
    embedder.embed_one("subcontract").await.unwrap();
    assert!(embedder.embed(&[]).await.unwrap().is_empty());
    assert_eq!(inner.calls.lock().len(), 1);
}

#[tokio::test]
async fn short_embedder_output_is_a_permanent_error() {
    let inner = Arc::new(RecordingEmbedder {
        truncate: true,
        ..RecordingEmbedder::default()
    });
    let embedder = CachedEmbedder::new(inner, CacheConfig::default());
    let err = embedder.embed(&strings(&["a", "b"])).await.unwrap_err();
    assert!(matches!(err, ProcessingError::Permanent(_)));
}

#[tokio::test]
async fn lookup_falls_back_to_a_similar_vector() {
    let embedder = CachedEmbedder::new(
        Arc::new(RecordingEmbedder::default()),
        CacheConfig::default(),
    );
    embedder.embed_one("pricing").await.unwrap();

    let hit = embedder.lookup("price analysis", &[7.0, 2.1]).unwrap();
    assert!(hit.is_semantic());
    assert_eq!(hit.value(), &Embedding::new(vec![7.0, 2.0]));
    assert!(embedder.lookup("price analysis", &[0.0, 1.0]).is_none());
}
