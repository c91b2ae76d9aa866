use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use regflow_config::PipelineConfig;
use regflow_core::{ChunkRecord, FailureInjector, NoFailures, SharedClock, SystemClock, MB};
use regflow_integrity::{DetectionReport, RecoveryReport, RecoveryStrategy, ScanScope};
use regflow_memory::{MemoryMonitor, MemoryPressure, MemorySampler, SystemMemorySampler};
use regflow_metrics::MetricsRegistry;
use regflow_scheduler::{
    AdaptiveBatchScheduler, BatchReport, CircuitBreaker, CircuitOpen, CircuitState, ItemFailure,
    PermitAllocator, PermitError, ProcessingError, Retried, RetryController,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::snapshot::PipelineSnapshot;
use crate::storage::ChunkStore;

const PIPELINE_BREAKER: &str = "pipeline";
const BATCH_OPERATION: &str = "batch";
const ITEM_OPERATION: &str = "item";
const SCAN_OPERATION: &str = "integrity.scan";

/// Per-item outcomes of [`PipelineCoordinator::process_batch`].
pub type PipelineBatchReport<R> = BatchReport<Retried<R>, PipelineError>;

pub struct CoordinatorBuilder {
    config: PipelineConfig,
    sampler: Option<Arc<dyn MemorySampler>>,
    clock: Option<SharedClock>,
    failures: Option<Arc<dyn FailureInjector>>,
}

impl CoordinatorBuilder {
    pub fn sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Consulted before every processing attempt.
    pub fn failures(mut self, failures: Arc<dyn FailureInjector>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn build(self) -> PipelineCoordinator {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let sampler: Arc<dyn MemorySampler> = match self.sampler {
            Some(sampler) => sampler,
            None => Arc::new(SystemMemorySampler::with_budget(
                (config.permits.memory_limit_mb * MB) as u64,
            )),
        };
        let failures: Arc<dyn FailureInjector> = match self.failures {
            Some(failures) => failures,
            None => Arc::new(NoFailures),
        };

        let monitor = MemoryMonitor::with_config(
            sampler,
            config.memory.monitor_config(),
            Arc::clone(&clock),
        );
        let permits =
            PermitAllocator::with_clock(config.permits.permit_config(), Arc::clone(&clock));
        let scheduler = AdaptiveBatchScheduler::with_clock(
            config.batching.batch_config(),
            permits.clone(),
            monitor.clone(),
            Arc::clone(&clock),
        );
        let breaker = CircuitBreaker::with_clock(
            PIPELINE_BREAKER,
            config.circuit.circuit_config(),
            Arc::clone(&clock),
        );
        let store = ChunkStore::with_clock(
            config.integrity.integrity_config(),
            config.cache.cache_config(),
            Arc::clone(&clock),
        );

        PipelineCoordinator {
            retry: RetryController::new(config.retry.retry_config()),
            stages: Mutex::new(BTreeMap::new()),
            metrics: MetricsRegistry::new(),
            config,
            clock,
            breaker,
            permits,
            scheduler,
            monitor,
            store,
            failures,
        }
    }
}

/// Runs batches of chunks through the permit pool, adaptive batching and retries, behind a
/// pipeline-wide circuit breaker.
///
/// A batch is refused outright while the breaker is open. Once admitted, every item outcome
/// is reported to the breaker; items that start after it has opened are short-circuited
/// with [`PipelineError::CircuitOpen`] instead of being attempted. While the breaker is
/// half-open, items run one at a time until a trial outcome closes or re-opens it.
///
/// Without an explicit sampler, memory pressure is measured against
/// `permits.memory_limit_mb` rather than the host's memory.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    clock: SharedClock,
    breaker: CircuitBreaker,
    stages: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
    permits: PermitAllocator,
    scheduler: AdaptiveBatchScheduler,
    retry: RetryController,
    monitor: MemoryMonitor,
    metrics: MetricsRegistry,
    store: ChunkStore,
    failures: Arc<dyn FailureInjector>,
}

impl PipelineCoordinator {
    pub fn builder(config: PipelineConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            sampler: None,
            clock: None,
            failures: None,
        }
    }

    pub fn new(config: PipelineConfig) -> Self {
        Self::builder(config).build()
    }

    /// Build a coordinator from a TOML config file.
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        Ok(Self::new(PipelineConfig::load_from_path(path)?))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn permits(&self) -> &PermitAllocator {
        &self.permits
    }

    pub fn scheduler(&self) -> &AdaptiveBatchScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Sample memory and resize the permit pool for the observed pressure. `High` and above
    /// also shrink the chunk cache.
    pub fn adapt_to_memory(&self) -> MemoryPressure {
        let pressure = self.monitor.sample().pressure;
        self.permits.adjust_for_pressure(pressure);
        if pressure >= MemoryPressure::High {
            self.store.shrink_for_pressure(pressure);
        }
        pressure
    }

    /// Process `items` with adaptive batching, retrying transient failures of `process`.
    ///
    /// Returns `Err` only when the batch is rejected up front; item failures are reported
    /// in the returned [`BatchReport`].
    pub async fn process_batch<R, F, Fut>(
        &self,
        items: Vec<ChunkRecord>,
        process: F,
    ) -> Result<PipelineBatchReport<R>, PipelineError>
    where
        F: Fn(ChunkRecord) -> Fut,
        Fut: Future<Output = Result<R, ProcessingError>>,
    {
        if let Err(open) = self.breaker.try_acquire() {
            self.metrics.record_rejection(BATCH_OPERATION);
            tracing::warn!(
                target = "regflow.pipeline",
                items = items.len(),
                "circuit open, rejecting batch"
            );
            return Err(open.into());
        }

        // Holds the half-open trial this batch was admitted with until an item uses it.
        let trial = AsyncMutex::new(self.breaker.state() == CircuitState::HalfOpen);

        self.adapt_to_memory();
        let process = &process;
        let trial_ref = &trial;
        let report = self
            .scheduler
            .process_adaptive_batch(items, move |item| self.process_item(item, process, trial_ref))
            .await;

        if trial.into_inner() {
            // A half-open trial that never reached the processor proves nothing either way.
            self.breaker.release_trial();
        }
        self.record_batch(&report);
        Ok(report)
    }

    async fn process_item<R, F, Fut>(
        &self,
        item: ChunkRecord,
        process: &F,
        trial: &AsyncMutex<bool>,
    ) -> Result<Retried<R>, PipelineError>
    where
        F: Fn(ChunkRecord) -> Fut,
        Fut: Future<Output = Result<R, ProcessingError>>,
    {
        if self.breaker.state() == CircuitState::Open {
            return Err(self.circuit_open());
        }
        self.check_hard_limit()?;

        // Half-open: one item at a time, each holding the breaker's single trial.
        let _trial_guard = match self.breaker.state() {
            CircuitState::Closed => None,
            CircuitState::Open => return Err(self.circuit_open()),
            CircuitState::HalfOpen => {
                let mut unused = trial.lock().await;
                match self.breaker.state() {
                    CircuitState::Closed => None,
                    CircuitState::Open => return Err(self.circuit_open()),
                    CircuitState::HalfOpen => {
                        if *unused {
                            *unused = false;
                        } else if self.breaker.try_acquire().is_err() {
                            return Err(self.circuit_open());
                        }
                        Some(unused)
                    }
                }
            }
        };

        let id = item.id;
        let outcome = self
            .retry
            .with_retry(|attempt| {
                let item = item.clone();
                async move {
                    if let Some(failure) = self.failures.inject(id, attempt) {
                        return Err(ProcessingError::from(failure));
                    }
                    process(item).await
                }
            })
            .await;

        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(err) => {
                self.breaker.record_failure();
                tracing::debug!(target = "regflow.pipeline", %id, error = %err, "item failed");
            }
        }
        outcome.map_err(PipelineError::from)
    }

    fn circuit_open(&self) -> PipelineError {
        CircuitOpen {
            name: self.breaker.name().to_owned(),
        }
        .into()
    }

    /// Fail fast when observed usage is over the emergency threshold, shrinking the permit
    /// pool if emergency cleanup is enabled.
    fn check_hard_limit(&self) -> Result<(), PermitError> {
        let threshold_mb = self.permits.emergency_threshold_mb();
        let sample = self.monitor.sample();
        let used_mb = sample.used_mb();
        if used_mb <= threshold_mb {
            return Ok(());
        }

        tracing::warn!(
            target = "regflow.pipeline",
            used_mb,
            threshold_mb,
            "memory over hard limit"
        );
        if self.config.permits.emergency_cleanup {
            self.permits.emergency_cleanup(sample.pressure);
        }
        Err(PermitError::HardLimitExceeded {
            used_mb,
            threshold_mb,
        })
    }

    fn record_batch<R>(&self, report: &PipelineBatchReport<R>) {
        self.metrics.record_request(BATCH_OPERATION, report.elapsed);
        self.metrics
            .record_errors(ITEM_OPERATION, report.failed() as u64);

        let mut retries = 0u64;
        for result in &report.results {
            match result {
                Ok(retried) => retries += u64::from(retried.retry_count),
                Err(ItemFailure::Process(PipelineError::Processing(
                    ProcessingError::Transient { retry_count, .. },
                ))) => retries += u64::from(*retry_count),
                Err(ItemFailure::Permit(PermitError::Timeout { .. })) => {
                    self.metrics.record_timeout(ITEM_OPERATION)
                }
                Err(ItemFailure::Process(PipelineError::CircuitOpen(_)))
                | Err(ItemFailure::Process(PipelineError::Permit(
                    PermitError::HardLimitExceeded { .. },
                ))) => self.metrics.record_rejection(ITEM_OPERATION),
                Err(_) => {}
            }
        }
        self.metrics.record_retries(ITEM_OPERATION, retries);

        tracing::info!(
            target = "regflow.pipeline",
            succeeded = report.succeeded(),
            failed = report.failed(),
            chunks = report.chunk_sizes.len(),
            batch_size = self.scheduler.current_batch_size(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
    }

    /// The breaker guarding `stage`, created closed on first use.
    pub fn stage_breaker(&self, stage: &str) -> Arc<CircuitBreaker> {
        let mut stages = self.stages.lock();
        let breaker = stages.entry(stage.to_owned()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_clock(
                stage,
                self.config.circuit.circuit_config(),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker)
    }

    /// Run one unit of work for `stage` behind that stage's breaker.
    pub async fn run_stage<T, Fut>(&self, stage: &str, op: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let breaker = self.stage_breaker(stage);
        if let Err(open) = breaker.try_acquire() {
            self.metrics.record_rejection(stage);
            return Err(open.into());
        }

        let started = self.clock.now();
        let outcome = op.await;
        self.metrics
            .record_request(stage, self.clock.now().saturating_duration_since(started));
        match &outcome {
            Ok(_) => breaker.record_success(),
            Err(_) => {
                breaker.record_failure();
                self.metrics.record_error(stage);
            }
        }
        outcome.map_err(PipelineError::from)
    }

    /// Names of the breakers that are currently open, the pipeline breaker included.
    pub fn activated_breakers(&self) -> Vec<String> {
        let mut open = Vec::new();
        if self.breaker.state() == CircuitState::Open {
            open.push(self.breaker.name().to_owned());
        }
        let stages = self.stages.lock();
        open.extend(
            stages
                .iter()
                .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
                .map(|(name, _)| name.clone()),
        );
        open
    }

    pub fn scan_integrity(&self, scope: ScanScope) -> DetectionReport {
        let started = self.clock.now();
        let report = self.store.scan(scope);
        self.metrics
            .record_request(SCAN_OPERATION, self.clock.now().saturating_duration_since(started));
        self.metrics
            .record_errors(SCAN_OPERATION, report.corrupted.len() as u64);
        report
    }

    pub fn recover_integrity(&self, scope: ScanScope, strategy: RecoveryStrategy) -> RecoveryReport {
        self.store.recover(scope, strategy)
    }

    /// Start periodic memory sampling and integrity scanning until `token` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.monitor.start(token.clone()),
            self.store.spawn_periodic_scan(ScanScope::All, token),
        ]
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let mut breakers = vec![self.breaker.snapshot()];
        breakers.extend(self.stages.lock().values().map(|breaker| breaker.snapshot()));

        PipelineSnapshot {
            memory: self.monitor.report(),
            permits: self.permits.stats(),
            permit_adjustments: self.permits.adjustments(),
            current_batch_size: self.scheduler.current_batch_size(),
            adaptation_history: self.scheduler.adaptation_history(),
            chunk_cache: self.store.cache_stats(),
            breakers,
            last_integrity_scan: self.store.integrity().last_detection(),
            quarantined_chunks: self.store.integrity().quarantined().len(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("breaker", &self.breaker)
            .field("permits", &self.permits)
            .field("scheduler", &self.scheduler)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
