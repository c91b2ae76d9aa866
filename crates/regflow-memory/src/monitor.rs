use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regflow_core::{SharedClock, SystemClock, MB};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pressure::{MemoryPressure, MemoryPressureThresholds};
use crate::report::MemoryReport;
use crate::sampler::{MemorySample, MemorySampler};

type MemoryEventListener = Arc<dyn Fn(MemoryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryMonitorConfig {
    pub sample_interval: Duration,
    pub thresholds: MemoryPressureThresholds,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            thresholds: MemoryPressureThresholds::default(),
        }
    }
}

/// Emitted whenever a sample moves the pressure level.
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    pub previous_pressure: MemoryPressure,
    pub pressure: MemoryPressure,
    pub report: MemoryReport,
}

struct State {
    current: MemorySample,
    peak_bytes: u64,
    pressure: MemoryPressure,
    last_sampled_at: Instant,
    checkpoints: HashMap<String, u64>,
}

struct Inner {
    config: MemoryMonitorConfig,
    sampler: Arc<dyn MemorySampler>,
    clock: SharedClock,
    state: Mutex<State>,
    listeners: Mutex<Vec<MemoryEventListener>>,
}

/// Samples memory usage, classifies pressure and tracks the running peak.
#[derive(Clone)]
pub struct MemoryMonitor {
    inner: Arc<Inner>,
}

impl MemoryMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>) -> Self {
        Self::with_config(sampler, MemoryMonitorConfig::default(), SystemClock::shared())
    }

    pub fn with_config(
        sampler: Arc<dyn MemorySampler>,
        config: MemoryMonitorConfig,
        clock: SharedClock,
    ) -> Self {
        let current = sampler.sample();
        let pressure = classify(config.thresholds, current);
        let now = clock.now();
        Self {
            inner: Arc::new(Inner {
                config,
                sampler,
                clock,
                state: Mutex::new(State {
                    current,
                    peak_bytes: current.used_bytes,
                    pressure,
                    last_sampled_at: now,
                    checkpoints: HashMap::new(),
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> MemoryMonitorConfig {
        self.inner.config
    }

    /// Subscribe to pressure-change events.
    pub fn subscribe(&self, listener: MemoryEventListener) {
        self.inner.listeners.lock().push(listener);
    }

    /// Take a fresh sample, update peak and pressure, and notify subscribers on change.
    pub fn sample(&self) -> MemoryReport {
        let sample = self.inner.sampler.sample();
        let pressure = classify(self.inner.config.thresholds, sample);
        let now = self.inner.clock.now();

        let (previous_pressure, report) = {
            let mut state = self.inner.state.lock();
            let previous = state.pressure;
            state.current = sample;
            state.peak_bytes = state.peak_bytes.max(sample.used_bytes);
            state.pressure = pressure;
            state.last_sampled_at = now;
            (previous, report_from(&state))
        };

        if previous_pressure != pressure {
            tracing::debug!(
                target = "regflow.memory",
                previous = ?previous_pressure,
                pressure = ?pressure,
                used_mb = report.used_mb(),
                "memory pressure changed"
            );
            self.emit(MemoryEvent {
                previous_pressure,
                pressure,
                report: report.clone(),
            });
        }

        report
    }

    /// Report built from the most recent sample (no new sampling).
    pub fn report(&self) -> MemoryReport {
        report_from(&self.inner.state.lock())
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.inner.state.lock().pressure
    }

    pub fn current_usage(&self) -> u64 {
        self.inner.state.lock().current.used_bytes
    }

    pub fn current_usage_mb(&self) -> f64 {
        self.current_usage() as f64 / MB
    }

    pub fn peak_usage(&self) -> u64 {
        self.inner.state.lock().peak_bytes
    }

    /// Time elapsed since the last sample, per the monitor's clock.
    pub fn sample_age(&self) -> Duration {
        let last = self.inner.state.lock().last_sampled_at;
        self.inner.clock.now().saturating_duration_since(last)
    }

    /// Whether an operation needing `required_mb` can start right now.
    ///
    /// Requires a fresh sample showing enough available memory and pressure below
    /// [`MemoryPressure::Critical`].
    pub fn can_perform_operation(&self, required_mb: f64) -> bool {
        let report = self.sample();
        report.pressure != MemoryPressure::Critical && report.available_mb() >= required_mb
    }

    /// Remember current usage under `label` for later leak checks.
    pub fn record_checkpoint(&self, label: impl Into<String>) {
        let used = self.sample().used_bytes;
        self.inner
            .state
            .lock()
            .checkpoints
            .insert(label.into(), used);
    }

    /// Signed growth in bytes since the checkpoint named `label`.
    pub fn growth_since(&self, label: &str) -> Option<i64> {
        let baseline = self.inner.state.lock().checkpoints.get(label).copied()?;
        let now = self.sample().used_bytes;
        Some(now as i64 - baseline as i64)
    }

    pub fn clear_checkpoint(&self, label: &str) -> bool {
        self.inner.state.lock().checkpoints.remove(label).is_some()
    }

    /// Spawn a task that samples every `sample_interval` until `token` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, token: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = self.inner.config.sample_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
            tracing::debug!(target = "regflow.memory", "memory sampling stopped");
        })
    }

    fn emit(&self, event: MemoryEvent) {
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener(event.clone());
        }
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("sampler", &self.inner.sampler)
            .field("report", &self.report())
            .finish()
    }
}

fn classify(thresholds: MemoryPressureThresholds, sample: MemorySample) -> MemoryPressure {
    let ratio = sample.used_bytes as f64 / sample.total_bytes.max(1) as f64;
    thresholds.level_for_ratio(ratio)
}

fn report_from(state: &State) -> MemoryReport {
    MemoryReport {
        used_bytes: state.current.used_bytes,
        available_bytes: state.current.available_bytes,
        total_bytes: state.current.total_bytes,
        peak_bytes: state.peak_bytes,
        pressure: state.pressure,
    }
}
