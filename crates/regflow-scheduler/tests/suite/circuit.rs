use std::time::Duration;

use regflow_core::ManualClock;
use regflow_scheduler::{CircuitBreaker, CircuitConfig, CircuitState};

fn breaker(clock: &ManualClock) -> CircuitBreaker {
    CircuitBreaker::with_clock(
        "pipeline",
        CircuitConfig {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
        },
        clock.shared(),
    )
}

#[test]
fn consecutive_failures_open_the_circuit() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);

    for _ in 0..4 {
        breaker.record_failure();
        assert!(breaker.is_healthy());
    }
    breaker.record_failure();
    assert!(!breaker.is_healthy());
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = breaker.try_acquire().unwrap_err();
    assert_eq!(err.name, "pipeline");
    assert_eq!(err.to_string(), "circuit `pipeline` is open");
}

#[test]
fn cooldown_restores_health_once_without_a_success() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);
    for _ in 0..5 {
        breaker.record_failure();
    }

    clock.advance(Duration::from_secs(29));
    assert!(!breaker.is_healthy());

    clock.advance(Duration::from_secs(1));
    assert!(breaker.is_healthy());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    // Stays healthy on subsequent checks; the flip happened exactly once.
    assert!(breaker.is_healthy());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[test]
fn half_open_admits_a_single_trial() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);
    for _ in 0..5 {
        breaker.record_failure();
    }
    clock.advance(Duration::from_secs(30));

    assert!(breaker.try_acquire().is_ok());
    assert!(breaker.try_acquire().is_err());

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.try_acquire().is_ok());
    assert!(breaker.try_acquire().is_ok());
    assert_eq!(breaker.snapshot().failure_count, 0);
}

#[test]
fn failed_trial_reopens_for_another_cooldown() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);
    for _ in 0..5 {
        breaker.record_failure();
    }
    clock.advance(Duration::from_secs(30));
    assert!(breaker.try_acquire().is_ok());

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    clock.advance(Duration::from_secs(29));
    assert!(!breaker.is_healthy());
    clock.advance(Duration::from_secs(1));
    assert!(breaker.is_healthy());
}
