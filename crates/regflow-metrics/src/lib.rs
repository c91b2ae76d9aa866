use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

// Latencies are recorded in microseconds.
const LATENCY_SIGFIG: u8 = 3;
// Batches of slow embeddings can take minutes; anything longer is clamped.
const MAX_LATENCY_US: u64 = 30 * 60 * 1_000_000;

/// Thread-safe per-operation metrics (counters + latency histograms).
///
/// Operations are free-form names such as `"batch"`, `"embed"` or `"integrity.scan"`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<HashMap<String, OperationMetrics>>,
}

#[derive(Debug)]
struct OperationMetrics {
    request_count: u64,
    error_count: u64,
    timeout_count: u64,
    rejection_count: u64,
    retry_count: u64,
    // `None` only if the histogram could not be allocated; counters still work.
    latency_us: Option<Histogram<u64>>,
}

impl OperationMetrics {
    fn new() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            timeout_count: 0,
            rejection_count: 0,
            retry_count: 0,
            latency_us: new_histogram(),
        }
    }
}

fn new_histogram() -> Option<Histogram<u64>> {
    static HISTOGRAM_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

    Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, LATENCY_SIGFIG)
        .or_else(|_| Histogram::<u64>::new(LATENCY_SIGFIG))
        .map_err(|err| {
            if HISTOGRAM_ERROR_LOGGED.set(()).is_ok() {
                tracing::debug!(
                    target = "regflow.metrics",
                    error = %err,
                    "failed to construct latency histogram; latencies will not be recorded"
                );
            }
        })
        .ok()
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_operation(&self, operation: &str, f: impl FnOnce(&mut OperationMetrics)) {
        let mut inner = self.inner.lock();
        let metrics = inner
            .entry(operation.to_owned())
            .or_insert_with(OperationMetrics::new);
        f(metrics);
    }

    /// Record one completed `operation` and how long it took.
    pub fn record_request(&self, operation: &str, duration: Duration) {
        static RECORD_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

        let micros = (duration.as_micros().min(u128::from(MAX_LATENCY_US)) as u64).max(1);
        self.with_operation(operation, |metrics| {
            metrics.request_count = metrics.request_count.saturating_add(1);
            let Some(histogram) = metrics.latency_us.as_mut() else {
                return;
            };
            if let Err(err) = histogram.record(micros) {
                if RECORD_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "regflow.metrics",
                        operation,
                        micros,
                        error = %err,
                        "failed to record latency sample"
                    );
                }
            }
        });
    }

    /// Record `count` failed items of `operation`.
    pub fn record_errors(&self, operation: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.with_operation(operation, |metrics| {
            metrics.error_count = metrics.error_count.saturating_add(count);
        });
    }

    pub fn record_error(&self, operation: &str) {
        self.record_errors(operation, 1);
    }

    /// Record a permit wait or other deadline that expired.
    pub fn record_timeout(&self, operation: &str) {
        self.with_operation(operation, |metrics| {
            metrics.timeout_count = metrics.timeout_count.saturating_add(1);
        });
    }

    /// Record work refused up front, e.g. by an open circuit.
    pub fn record_rejection(&self, operation: &str) {
        self.with_operation(operation, |metrics| {
            metrics.rejection_count = metrics.rejection_count.saturating_add(1);
        });
    }

    pub fn record_retries(&self, operation: &str, retries: u64) {
        if retries == 0 {
            return;
        }
        self.with_operation(operation, |metrics| {
            metrics.retry_count = metrics.retry_count.saturating_add(retries);
        });
    }

    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Snapshot of every operation seen so far, plus totals across them.
    pub fn snapshot(&self) -> MetricsSnapshot {
        static TOTAL_ADD_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

        let inner = self.inner.lock();
        let mut operations = BTreeMap::new();
        let mut totals = OperationSnapshot::default();
        let mut total_hist = new_histogram();

        for (operation, metrics) in inner.iter() {
            totals.request_count = totals.request_count.saturating_add(metrics.request_count);
            totals.error_count = totals.error_count.saturating_add(metrics.error_count);
            totals.timeout_count = totals.timeout_count.saturating_add(metrics.timeout_count);
            totals.rejection_count = totals
                .rejection_count
                .saturating_add(metrics.rejection_count);
            totals.retry_count = totals.retry_count.saturating_add(metrics.retry_count);

            if let (Some(total), Some(hist)) = (total_hist.as_mut(), metrics.latency_us.as_ref()) {
                if let Err(err) = total.add(hist) {
                    if TOTAL_ADD_ERROR_LOGGED.set(()).is_ok() {
                        tracing::debug!(
                            target = "regflow.metrics",
                            operation,
                            error = %err,
                            "failed to merge latency histogram into totals"
                        );
                    }
                }
            }

            operations.insert(
                operation.clone(),
                OperationSnapshot {
                    request_count: metrics.request_count,
                    error_count: metrics.error_count,
                    timeout_count: metrics.timeout_count,
                    rejection_count: metrics.rejection_count,
                    retry_count: metrics.retry_count,
                    latency_us: latency_summary(metrics.latency_us.as_ref()),
                },
            );
        }
        totals.latency_us = latency_summary(total_hist.as_ref());

        MetricsSnapshot { totals, operations }
    }
}

fn latency_summary(hist: Option<&Histogram<u64>>) -> LatencySummary {
    match hist {
        Some(hist) if !hist.is_empty() => LatencySummary {
            p50_us: hist.value_at_quantile(0.50),
            p95_us: hist.value_at_quantile(0.95),
            max_us: hist.max(),
        },
        _ => LatencySummary::default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub totals: OperationSnapshot,
    pub operations: BTreeMap<String, OperationSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub rejection_count: u64,
    pub retry_count: u64,
    pub latency_us: LatencySummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub p50_us: u64,
    pub p95_us: u64,
    pub max_us: u64,
}
