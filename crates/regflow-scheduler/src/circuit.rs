use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regflow_core::{SharedClock, SystemClock};
use serde::{Deserialize, Serialize};

use crate::error::CircuitOpen;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Time after the last failure before an open circuit lets a trial through.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
///
/// `Open` becomes `HalfOpen` lazily, the first time health is checked after the cooldown. A
/// half-open breaker admits one trial at a time; its outcome closes or re-opens the circuit.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state);
        state.state
    }

    /// `false` only while the circuit is open and cooling down.
    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Ask to run one request through the breaker.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state);
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(CircuitOpen {
                name: self.name.clone(),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.trial_in_flight = false;
        if state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Closed;
            tracing::info!(target = "regflow.circuit", name = %self.name, "circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(now);
        state.trial_in_flight = false;

        let opens = match state.state {
            CircuitState::Closed => state.failure_count >= self.config.max_failures,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if opens {
            state.state = CircuitState::Open;
            tracing::warn!(
                target = "regflow.circuit",
                name = %self.name,
                failures = state.failure_count,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Give back an admitted half-open trial that produced no outcome.
    pub fn release_trial(&self) {
        self.state.lock().trial_in_flight = false;
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure = None;
        state.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut state = self.state.lock();
        self.refresh_locked(&mut state);
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
        }
    }

    fn refresh_locked(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let cooled = state.last_failure.map_or(true, |at| {
            self.clock.now().saturating_duration_since(at) >= self.config.cooldown
        });
        if cooled {
            state.state = CircuitState::HalfOpen;
            state.trial_in_flight = false;
            tracing::info!(target = "regflow.circuit", name = %self.name, "circuit half-open");
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}
