use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regflow_config::PipelineConfig;
use regflow_core::{
    ChunkId, ChunkRecord, FailureClass, FailureInjector, ManualClock, Priority, ScriptedFailures,
};
use regflow_integrity::{RecordCopy, RecoveryStrategy, ScanScope};
use regflow_memory::{ManualMemorySampler, MemoryPressure};
use regflow_pipeline::{PipelineCoordinator, PipelineError};
use regflow_scheduler::{AdjustmentReason, CircuitState, ItemFailure, PermitError, ProcessingError};

struct Fixture {
    coordinator: PipelineCoordinator,
    clock: ManualClock,
    sampler: ManualMemorySampler,
}

fn fixture(config: PipelineConfig, failures: impl FailureInjector + 'static) -> Fixture {
    let clock = ManualClock::new();
    let sampler = ManualMemorySampler::with_total_mb(1_000.0);
    let coordinator = PipelineCoordinator::builder(config)
        .clock(clock.shared())
        .sampler(Arc::new(sampler.clone()))
        .failures(Arc::new(failures))
        .build();
    Fixture {
        coordinator,
        clock,
        sampler,
    }
}

fn sequential_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.batching.max_concurrency = 1;
    config.retry.max_attempts = 1;
    config.circuit.max_failures = 5;
    config.circuit.cooldown_ms = 10_000;
    config
}

fn chunks(ids: std::ops::Range<u64>) -> Vec<ChunkRecord> {
    ids.map(|id| ChunkRecord::new(ChunkId(id), format!("FAR 52.219-{id} Small business program")))
        .collect()
}

async fn count_tokens(chunk: ChunkRecord) -> Result<u32, ProcessingError> {
    Ok(chunk.token_count)
}

#[tokio::test]
async fn healthy_batch_processes_every_item() {
    let f = fixture(PipelineConfig::default(), ScriptedFailures::new());
    let report = f
        .coordinator
        .process_batch(chunks(0..25), count_tokens)
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 25);
    assert!(report
        .results
        .iter()
        .all(|r| matches!(r, Ok(retried) if retried.value == 5 && retried.retry_count == 0)));
    // Zero elapsed time on the manual clock counts as fast, so chunks grow.
    assert_eq!(report.chunk_sizes, [10, 15]);
    assert_eq!(f.coordinator.breaker().state(), CircuitState::Closed);

    let metrics = f.coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["batch"].request_count, 1);
}

#[tokio::test]
async fn consecutive_failures_open_the_circuit_mid_batch() {
    let failures = (0..8).fold(ScriptedFailures::new(), |failures, id| {
        failures.always(ChunkId(id), FailureClass::Permanent)
    });
    let f = fixture(sequential_config(), failures);

    let report = f
        .coordinator
        .process_batch(chunks(0..8), count_tokens)
        .await
        .unwrap();
    assert_eq!(report.failed(), 8);
    let short_circuited = report
        .errors()
        .filter(|err| matches!(err, ItemFailure::Process(PipelineError::CircuitOpen(_))))
        .count();
    assert_eq!(short_circuited, 3);

    assert_eq!(f.coordinator.breaker().state(), CircuitState::Open);
    assert_eq!(f.coordinator.activated_breakers(), ["pipeline"]);

    let rejected = f.coordinator.process_batch(chunks(8..10), count_tokens).await;
    assert!(matches!(rejected, Err(PipelineError::CircuitOpen(_))));

    let metrics = f.coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["batch"].rejection_count, 1);
    assert_eq!(metrics.operations["item"].rejection_count, 3);
    assert_eq!(metrics.operations["item"].error_count, 8);
}

#[tokio::test]
async fn half_open_batch_closes_the_circuit_on_success() {
    let failures = (0..5).fold(ScriptedFailures::new(), |failures, id| {
        failures.always(ChunkId(id), FailureClass::Permanent)
    });
    let f = fixture(sequential_config(), failures);
    f.coordinator
        .process_batch(chunks(0..5), count_tokens)
        .await
        .unwrap();
    assert_eq!(f.coordinator.breaker().state(), CircuitState::Open);

    f.clock.advance(Duration::from_secs(11));
    assert_eq!(f.coordinator.breaker().state(), CircuitState::HalfOpen);

    let report = f
        .coordinator
        .process_batch(chunks(10..13), count_tokens)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 3);
    assert_eq!(f.coordinator.breaker().state(), CircuitState::Closed);
    assert!(f.coordinator.activated_breakers().is_empty());
}

#[tokio::test]
async fn empty_half_open_batch_leaves_the_trial_available() {
    let failures = (0..5).fold(ScriptedFailures::new(), |failures, id| {
        failures.always(ChunkId(id), FailureClass::Permanent)
    });
    let f = fixture(sequential_config(), failures);
    f.coordinator
        .process_batch(chunks(0..5), count_tokens)
        .await
        .unwrap();
    f.clock.advance(Duration::from_secs(11));

    let report = f.coordinator.process_batch(Vec::new(), count_tokens).await.unwrap();
    assert!(report.results.is_empty());
    let report = f
        .coordinator
        .process_batch(chunks(10..11), count_tokens)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
}

fn concurrent_config() -> PipelineConfig {
    let mut config = sequential_config();
    config.batching.max_concurrency = 4;
    config
}

fn open_then_cool_down(f: &Fixture) {
    for _ in 0..5 {
        f.coordinator.breaker().record_failure();
    }
    f.clock.advance(Duration::from_secs(11));
    assert_eq!(f.coordinator.breaker().state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn half_open_batch_sends_a_single_trial_when_it_fails() {
    let f = fixture(concurrent_config(), ScriptedFailures::new());
    open_then_cool_down(&f);

    let attempts = AtomicUsize::new(0);
    let report = f
        .coordinator
        .process_batch(chunks(0..8), |_chunk| {
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Err::<u32, _>(ProcessingError::permanent("embedding service down"))
            }
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(report.failed(), 8);
    let short_circuited = report
        .errors()
        .filter(|err| matches!(err, ItemFailure::Process(PipelineError::CircuitOpen(_))))
        .count();
    assert_eq!(short_circuited, 7);
    assert_eq!(f.coordinator.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn half_open_batch_resumes_concurrency_after_a_successful_trial() {
    let f = fixture(concurrent_config(), ScriptedFailures::new());
    open_then_cool_down(&f);

    let in_flight = AtomicUsize::new(0);
    let peak_while_half_open = AtomicUsize::new(0);
    let breaker = f.coordinator.breaker();
    let report = f
        .coordinator
        .process_batch(chunks(0..8), |chunk| {
            let (in_flight, peak) = (&in_flight, &peak_while_half_open);
            async move {
                let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                if breaker.state() == CircuitState::HalfOpen {
                    peak.fetch_max(running, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ProcessingError>(chunk.token_count)
            }
        })
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 8);
    assert_eq!(peak_while_half_open.load(Ordering::SeqCst), 1);
    assert_eq!(f.coordinator.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn usage_over_the_hard_limit_fails_items_and_sheds_permits() {
    let f = fixture(sequential_config(), ScriptedFailures::new());
    let permits = f.coordinator.permits();
    let held: Vec<_> = (0..4)
        .map(|_| permits.try_acquire(1.0, Priority::Normal).unwrap())
        .collect();

    // 950mb of 1000mb is critical, and above 0.875 * 1024mb.
    f.sampler.set_used_mb(950.0);
    let report = f
        .coordinator
        .process_batch(chunks(0..1), count_tokens)
        .await
        .unwrap();

    assert!(matches!(
        &report.results[0],
        Err(ItemFailure::Process(PipelineError::Permit(
            PermitError::HardLimitExceeded { threshold_mb, .. }
        ))) if *threshold_mb == 896.0
    ));
    let last = permits.adjustments().pop().unwrap();
    assert_eq!(last.reason, AdjustmentReason::EmergencyCleanup);
    assert_eq!((last.old_capacity, last.new_capacity), (5, 3));
    assert_eq!(permits.stats().usage.emergency_cleanups, 1);
    // Resource exhaustion is not a dependency failure.
    assert_eq!(f.coordinator.breaker().snapshot().failure_count, 0);
    let metrics = f.coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["item"].rejection_count, 1);

    for permit in &held {
        permits.release(permit.id);
    }
    f.sampler.set_used_mb(100.0);
    let report = f
        .coordinator
        .process_batch(chunks(1..3), count_tokens)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 2);
    assert_eq!(permits.stats().capacity, 8);
}

#[tokio::test]
async fn hard_limit_without_cleanup_keeps_capacity() {
    let mut config = sequential_config();
    config.permits.emergency_cleanup = false;
    let f = fixture(config, ScriptedFailures::new());

    f.sampler.set_used_mb(900.0);
    let report = f
        .coordinator
        .process_batch(chunks(0..2), count_tokens)
        .await
        .unwrap();
    assert_eq!(report.failed(), 2);
    assert_eq!(f.coordinator.permits().stats().usage.emergency_cleanups, 0);
    assert!(f
        .coordinator
        .permits()
        .adjustments()
        .iter()
        .all(|adjustment| adjustment.reason == AdjustmentReason::Pressure));
}

#[test]
fn default_sampler_measures_against_the_memory_limit() {
    let mut config = PipelineConfig::default();
    config.permits.memory_limit_mb = 1.0;
    let coordinator = PipelineCoordinator::new(config);

    let pressure = coordinator.adapt_to_memory();
    assert!(pressure >= MemoryPressure::High, "pressure was {pressure:?}");
    assert_eq!(coordinator.monitor().report().total_bytes, 1024 * 1024);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_per_item() {
    let failures = ScriptedFailures::new()
        .fail(ChunkId(1), [FailureClass::Transient, FailureClass::Transient])
        .always(ChunkId(2), FailureClass::Transient);
    let f = fixture(PipelineConfig::default(), failures);

    let report = f
        .coordinator
        .process_batch(chunks(0..3), count_tokens)
        .await
        .unwrap();

    assert!(matches!(&report.results[0], Ok(r) if r.retry_count == 0));
    assert!(matches!(&report.results[1], Ok(r) if r.retry_count == 2));
    assert!(matches!(
        &report.results[2],
        Err(ItemFailure::Process(PipelineError::Processing(
            ProcessingError::Transient { retry_count: 2, .. }
        )))
    ));

    let metrics = f.coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["item"].retry_count, 4);
    assert_eq!(metrics.operations["item"].error_count, 1);
}

#[tokio::test]
async fn memory_pressure_shrinks_permits_and_cache() {
    let f = fixture(PipelineConfig::default(), ScriptedFailures::new());
    let store = f.coordinator.store();
    for chunk in chunks(0..3) {
        store.put(&chunk);
    }
    assert_eq!(store.cache_stats().l1_len, 3);

    f.sampler.set_used_mb(900.0);
    assert_eq!(f.coordinator.adapt_to_memory(), MemoryPressure::High);
    assert_eq!(f.coordinator.permits().stats().capacity, 6);
    // L1 survives high pressure; only L2 is dropped.
    assert_eq!(store.cache_stats().l1_len, 3);

    f.sampler.set_used_mb(980.0);
    assert_eq!(f.coordinator.adapt_to_memory(), MemoryPressure::Critical);
    assert_eq!(f.coordinator.permits().stats().capacity, 5);
    assert_eq!(store.cache_stats().l1_len, 0);

    f.sampler.set_used_mb(100.0);
    f.coordinator.adapt_to_memory();
    f.coordinator.adapt_to_memory();
    assert_eq!(f.coordinator.permits().stats().capacity, 10);
}

#[tokio::test]
async fn integrity_workflow_runs_through_the_coordinator() {
    let f = fixture(PipelineConfig::default(), ScriptedFailures::new());
    let store = f.coordinator.store();
    for chunk in chunks(0..4) {
        store.put(&chunk);
    }
    store
        .integrity()
        .tamper(RecordCopy::Primary, ChunkId(2), |r| r.content.push_str(" (rev)"));

    let detection = f.coordinator.scan_integrity(ScanScope::Checksum);
    assert_eq!(detection.corrupted, [ChunkId(2)]);
    assert!((detection.integrity_score - 0.75).abs() < 1e-9);
    assert!(store.get(ChunkId(2)).is_err());

    let recovery = f
        .coordinator
        .recover_integrity(ScanScope::All, RecoveryStrategy::BackupRestore);
    assert_eq!(recovery.recovery_rate, 1.0);
    assert!(store.get(ChunkId(2)).is_ok());

    let metrics = f.coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["integrity.scan"].error_count, 1);
}

#[tokio::test]
async fn snapshot_is_serializable() {
    let f = fixture(PipelineConfig::default(), ScriptedFailures::new());
    f.coordinator
        .process_batch(chunks(0..12), count_tokens)
        .await
        .unwrap();
    f.coordinator.stage_breaker("embedding");

    let snapshot = f.coordinator.snapshot();
    assert_eq!(snapshot.current_batch_size, 20);
    assert_eq!(snapshot.breakers.len(), 2);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["currentBatchSize"], 20);
    assert_eq!(json["breakers"][1]["name"], "embedding");
    assert_eq!(json["memory"]["pressure"], "normal");
    assert_eq!(json["adaptationHistory"].as_array().map(Vec::len), Some(2));
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = PipelineCoordinator::from_config_path("/nonexistent/regflow.toml").unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}
