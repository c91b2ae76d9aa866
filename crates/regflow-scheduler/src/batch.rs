use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use regflow_core::{ChunkRecord, Priority, SharedClock, SystemClock, MB};
use regflow_memory::MemoryMonitor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PermitError;
use crate::permits::PermitAllocator;

const ADAPTATION_HISTORY: usize = 100;
const SPEED_UP_RATIO: f64 = 1.2;
const SLOW_DOWN_RATIO: f64 = 0.8;
const MEMORY_HEADROOM: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub adjustment_step: usize,
    /// Chunk latency the adaptive mode aims for.
    pub target_latency: Duration,
    /// Items of one chunk in flight at once.
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            min_batch_size: 5,
            max_batch_size: 100,
            adjustment_step: 5,
            target_latency: Duration::from_secs(2),
            max_concurrency: 4,
        }
    }
}

/// Work item that can be scheduled under a permit.
pub trait BatchItem {
    fn estimated_memory_mb(&self) -> f64;

    fn priority(&self) -> Priority {
        Priority::Normal
    }
}

impl BatchItem for ChunkRecord {
    fn estimated_memory_mb(&self) -> f64 {
        ChunkRecord::estimated_memory_mb(self)
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationTrigger {
    PerformanceImprovement,
    PerformanceRegression,
    MemoryPressure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationRecord {
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
    pub trigger: AdaptationTrigger,
    pub old_batch_size: usize,
    pub new_batch_size: usize,
    /// `(new - old) / old`.
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ItemFailure<E> {
    #[error(transparent)]
    Permit(#[from] PermitError),
    #[error("{0}")]
    Process(E),
}

/// Per-item results of one batch run, in input order.
#[derive(Debug)]
pub struct BatchReport<R, E> {
    pub results: Vec<Result<R, ItemFailure<E>>>,
    /// Size of every chunk that was run, in order.
    pub chunk_sizes: Vec<usize>,
    pub elapsed: Duration,
}

impl<R, E> BatchReport<R, E> {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            chunk_sizes: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ItemFailure<E>> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }
}

struct BatchState {
    current_batch_size: usize,
    history: VecDeque<AdaptationRecord>,
    peak_memory_bytes: u64,
}

impl BatchState {
    fn record(&mut self, record: AdaptationRecord) {
        if self.history.len() == ADAPTATION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

/// Splits work into chunks and adapts the chunk size between runs.
///
/// Every item holds a permit from the shared [`PermitAllocator`] while it is processed, so
/// the memory limit applies across all concurrently running batches.
pub struct AdaptiveBatchScheduler {
    config: BatchConfig,
    permits: PermitAllocator,
    monitor: MemoryMonitor,
    clock: SharedClock,
    state: Mutex<BatchState>,
}

impl AdaptiveBatchScheduler {
    pub fn new(config: BatchConfig, permits: PermitAllocator, monitor: MemoryMonitor) -> Self {
        Self::with_clock(config, permits, monitor, SystemClock::shared())
    }

    pub fn with_clock(
        config: BatchConfig,
        permits: PermitAllocator,
        monitor: MemoryMonitor,
        clock: SharedClock,
    ) -> Self {
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size.max(1), config.max_batch_size.max(1));
        Self {
            config,
            permits,
            monitor,
            clock,
            state: Mutex::new(BatchState {
                current_batch_size: initial,
                history: VecDeque::new(),
                peak_memory_bytes: 0,
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn current_batch_size(&self) -> usize {
        self.state.lock().current_batch_size
    }

    pub fn adaptation_history(&self) -> Vec<AdaptationRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Highest memory usage observed while running memory-optimized batches.
    pub fn peak_memory_bytes(&self) -> u64 {
        self.state.lock().peak_memory_bytes
    }

    /// Run `items` in chunks of the current batch size without adapting it.
    pub async fn process_standard_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        process: F,
    ) -> BatchReport<R, E>
    where
        T: BatchItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let size = self.current_batch_size();
        let started = self.clock.now();
        let mut report = BatchReport::empty();
        let mut items = items.into_iter();
        loop {
            let chunk: Vec<T> = items.by_ref().take(size).collect();
            if chunk.is_empty() {
                break;
            }
            report.chunk_sizes.push(chunk.len());
            report.results.extend(self.run_chunk(chunk, &process).await);
        }
        report.elapsed = self.clock.now().saturating_duration_since(started);
        report
    }

    /// Run `items` in chunks, growing the batch size when chunks finish well under the target
    /// latency and shrinking it when they overrun.
    pub async fn process_adaptive_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        process: F,
    ) -> BatchReport<R, E>
    where
        T: BatchItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let started = self.clock.now();
        let mut report = BatchReport::empty();
        let mut items = items.into_iter();
        loop {
            let size = self.current_batch_size();
            let chunk: Vec<T> = items.by_ref().take(size).collect();
            if chunk.is_empty() {
                break;
            }
            report.chunk_sizes.push(chunk.len());

            let chunk_started = self.clock.now();
            report.results.extend(self.run_chunk(chunk, &process).await);
            let elapsed = self.clock.now().saturating_duration_since(chunk_started);
            self.adapt_to_latency(elapsed);
        }
        report.elapsed = self.clock.now().saturating_duration_since(started);
        report
    }

    /// Run `items` with a chunk size derived from the memory limit and the items' average
    /// estimate, halving it whenever usage after a chunk exceeds 80% of the limit.
    pub async fn process_memory_optimized_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        process: F,
    ) -> BatchReport<R, E>
    where
        T: BatchItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if items.is_empty() {
            return BatchReport::empty();
        }

        let limit_mb = self.permits.memory_limit_mb();
        let average_mb = items
            .iter()
            .map(BatchItem::estimated_memory_mb)
            .sum::<f64>()
            / items.len() as f64;
        let current = self.current_batch_size();
        let mut size = if average_mb > 0.0 {
            ((limit_mb * MEMORY_HEADROOM / average_mb).floor() as usize).clamp(1, current)
        } else {
            current
        };

        let started = self.clock.now();
        let mut report = BatchReport::empty();
        let mut items = items.into_iter();
        loop {
            let chunk: Vec<T> = items.by_ref().take(size).collect();
            if chunk.is_empty() {
                break;
            }
            report.chunk_sizes.push(chunk.len());
            report.results.extend(self.run_chunk(chunk, &process).await);

            let sample = self.monitor.sample();
            let mut state = self.state.lock();
            state.peak_memory_bytes = state.peak_memory_bytes.max(sample.used_bytes);
            let used_mb = sample.used_bytes as f64 / MB;
            if used_mb > limit_mb * MEMORY_HEADROOM && size > 1 {
                let new_size = (size / 2).max(1);
                state.record(AdaptationRecord {
                    timestamp: self.clock.now(),
                    trigger: AdaptationTrigger::MemoryPressure,
                    old_batch_size: size,
                    new_batch_size: new_size,
                    impact: impact(size, new_size),
                });
                tracing::debug!(
                    target = "regflow.batch",
                    used_mb,
                    limit_mb,
                    old_batch_size = size,
                    new_batch_size = new_size,
                    "halving batch size under memory pressure"
                );
                size = new_size;
            }
        }
        report.elapsed = self.clock.now().saturating_duration_since(started);
        report
    }

    async fn run_chunk<T, R, E, F, Fut>(
        &self,
        chunk: Vec<T>,
        process: &F,
    ) -> Vec<Result<R, ItemFailure<E>>>
    where
        T: BatchItem,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        stream::iter(chunk)
            .map(|item| async move {
                let _permit = self
                    .permits
                    .acquire_guard(item.estimated_memory_mb(), item.priority())
                    .await?;
                process(item).await.map_err(ItemFailure::Process)
            })
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }

    fn adapt_to_latency(&self, elapsed: Duration) {
        let performance = if elapsed.is_zero() {
            f64::INFINITY
        } else {
            self.config.target_latency.as_secs_f64() / elapsed.as_secs_f64()
        };

        let mut state = self.state.lock();
        let old = state.current_batch_size;
        let (new, trigger) = if performance > SPEED_UP_RATIO {
            (
                (old + self.config.adjustment_step).min(self.config.max_batch_size),
                AdaptationTrigger::PerformanceImprovement,
            )
        } else if performance < SLOW_DOWN_RATIO {
            (
                old.saturating_sub(self.config.adjustment_step)
                    .max(self.config.min_batch_size)
                    .max(1),
                AdaptationTrigger::PerformanceRegression,
            )
        } else {
            return;
        };
        if new == old {
            return;
        }

        state.current_batch_size = new;
        state.record(AdaptationRecord {
            timestamp: self.clock.now(),
            trigger,
            old_batch_size: old,
            new_batch_size: new,
            impact: impact(old, new),
        });
        tracing::debug!(
            target = "regflow.batch",
            ?trigger,
            performance,
            old_batch_size = old,
            new_batch_size = new,
            "adapted batch size"
        );
    }
}

impl std::fmt::Debug for AdaptiveBatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveBatchScheduler")
            .field("config", &self.config)
            .field("current_batch_size", &self.current_batch_size())
            .finish()
    }
}

fn impact(old: usize, new: usize) -> f64 {
    (new as f64 - old as f64) / old.max(1) as f64
}
