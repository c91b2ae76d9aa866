use std::sync::Arc;
use std::time::Duration;

use regflow_config::PipelineConfig;
use regflow_core::ManualClock;
use regflow_memory::ManualMemorySampler;
use regflow_pipeline::{PipelineCoordinator, PipelineError};
use regflow_scheduler::{CircuitState, ProcessingError};

fn coordinator(clock: &ManualClock) -> PipelineCoordinator {
    let mut config = PipelineConfig::default();
    config.circuit.max_failures = 3;
    config.circuit.cooldown_ms = 5_000;
    PipelineCoordinator::builder(config)
        .clock(clock.shared())
        .sampler(Arc::new(ManualMemorySampler::with_total_mb(1_000.0)))
        .build()
}

async fn flaky_upstream() -> Result<u32, ProcessingError> {
    Err(ProcessingError::transient("embedding service unavailable"))
}

#[tokio::test]
async fn stage_breakers_trip_independently() {
    let clock = ManualClock::new();
    let coordinator = coordinator(&clock);

    for _ in 0..3 {
        let err = coordinator
            .run_stage("embedding", flaky_upstream())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
        assert!(!err.is_rejection());
    }

    let err = coordinator
        .run_stage("embedding", async { Ok::<_, ProcessingError>(1) })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CircuitOpen(ref open) if open.name == "embedding"));
    assert!(err.is_rejection());

    assert_eq!(
        coordinator
            .run_stage("storage", async { Ok::<_, ProcessingError>(7) })
            .await
            .unwrap(),
        7
    );
    assert_eq!(coordinator.activated_breakers(), ["embedding"]);
    assert_eq!(coordinator.breaker().state(), CircuitState::Closed);

    let metrics = coordinator.metrics().snapshot();
    assert_eq!(metrics.operations["embedding"].error_count, 3);
    assert_eq!(metrics.operations["embedding"].rejection_count, 1);
    assert_eq!(metrics.operations["storage"].request_count, 1);
}

#[tokio::test]
async fn stage_recovers_after_cooldown() {
    let clock = ManualClock::new();
    let coordinator = coordinator(&clock);
    for _ in 0..3 {
        let _ = coordinator.run_stage("embedding", flaky_upstream()).await;
    }
    let breaker = coordinator.stage_breaker("embedding");
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(5));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    coordinator
        .run_stage("embedding", async { Ok::<_, ProcessingError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(coordinator.activated_breakers().is_empty());
}
