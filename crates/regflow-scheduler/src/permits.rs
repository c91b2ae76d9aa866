use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regflow_core::{Priority, SharedClock, SystemClock};
use regflow_memory::MemoryPressure;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::PermitError;

const ADJUSTMENT_HISTORY: usize = 100;
const GROWTH_STEP: usize = 5;
const MIN_CAPACITY: usize = 5;
// Absorbs float drift in the committed-memory sum.
const MEMORY_EPSILON_MB: f64 = 1e-9;

/// Order in which queued requests are considered for admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Arrival order.
    #[default]
    Fairness,
    /// Highest priority first, then arrival order.
    Priority,
    /// Smallest memory estimate first, then arrival order.
    MemoryOptimized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermitConfig {
    pub total_permits: usize,
    pub memory_limit_mb: f64,
    pub strategy: AllocationStrategy,
    /// Default wait used by [`PermitAllocator::acquire`].
    pub acquire_timeout: Duration,
    /// Fraction of `memory_limit_mb` above which observed usage counts as a hard-limit
    /// breach.
    pub emergency_threshold: f64,
    /// Whether a hard-limit breach also triggers [`PermitAllocator::emergency_cleanup`].
    pub emergency_cleanup: bool,
}

impl Default for PermitConfig {
    fn default() -> Self {
        Self {
            total_permits: 10,
            memory_limit_mb: 1024.0,
            strategy: AllocationStrategy::Fairness,
            acquire_timeout: Duration::from_secs(30),
            emergency_threshold: 0.875,
            emergency_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermitId(pub u64);

impl fmt::Display for PermitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permit#{}", self.0)
    }
}

/// An admitted request. Its memory stays committed until [`PermitAllocator::release`].
#[derive(Debug, Clone, PartialEq)]
pub struct Permit {
    pub id: PermitId,
    pub estimated_memory_mb: f64,
    pub priority: Priority,
    pub acquired_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitAdjustment {
    pub old_capacity: usize,
    pub new_capacity: usize,
    pub pressure: MemoryPressure,
    pub reason: AdjustmentReason,
}

/// Why permit capacity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Pressure,
    EmergencyCleanup,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitUsage {
    pub granted: u64,
    pub released: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub emergency_cleanups: u64,
    pub mean_hold_ms: f64,
    pub mean_memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitStats {
    pub total: usize,
    pub capacity: usize,
    pub available: usize,
    pub active: usize,
    pub queued: usize,
    pub committed_mb: f64,
    pub memory_limit_mb: f64,
    pub utilization: f64,
    pub usage: PermitUsage,
}

struct Waiter {
    seq: u64,
    estimated_memory_mb: f64,
    priority: Priority,
    tx: oneshot::Sender<Permit>,
}

#[derive(Default)]
struct UsageTotals {
    granted: u64,
    released: u64,
    timeouts: u64,
    rejected: u64,
    emergency_cleanups: u64,
    hold_total: Duration,
    memory_total_mb: f64,
}

struct PoolState {
    capacity: usize,
    active: HashMap<PermitId, Permit>,
    committed_mb: f64,
    queue: Vec<Waiter>,
    next_id: u64,
    next_seq: u64,
    adjustments: VecDeque<PermitAdjustment>,
    usage: UsageTotals,
}

impl PoolState {
    fn record_adjustment(&mut self, adjustment: PermitAdjustment) {
        if self.adjustments.len() == ADJUSTMENT_HISTORY {
            self.adjustments.pop_front();
        }
        self.adjustments.push_back(adjustment);
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.active.len())
    }

    fn fits(&self, estimated_memory_mb: f64, limit_mb: f64) -> bool {
        self.available() > 0 && self.committed_mb + estimated_memory_mb <= limit_mb + MEMORY_EPSILON_MB
    }

    fn sort_queue(&mut self, strategy: AllocationStrategy) {
        match strategy {
            AllocationStrategy::Fairness => self.queue.sort_by_key(|w| w.seq),
            AllocationStrategy::Priority => self.queue.sort_by_key(|w| (Reverse(w.priority), w.seq)),
            AllocationStrategy::MemoryOptimized => self.queue.sort_by(|a, b| {
                a.estimated_memory_mb
                    .total_cmp(&b.estimated_memory_mb)
                    .then(a.seq.cmp(&b.seq))
            }),
        }
    }

    fn grant(&mut self, estimated_memory_mb: f64, priority: Priority, now: Instant) -> Permit {
        let id = PermitId(self.next_id);
        self.next_id += 1;
        let permit = Permit {
            id,
            estimated_memory_mb,
            priority,
            acquired_at: now,
        };
        self.active.insert(id, permit.clone());
        self.committed_mb += estimated_memory_mb;
        self.usage.granted += 1;
        self.usage.memory_total_mb += estimated_memory_mb;
        permit
    }

    fn revoke(&mut self, id: PermitId) -> Option<Permit> {
        let permit = self.active.remove(&id)?;
        self.committed_mb = if self.active.is_empty() {
            0.0
        } else {
            (self.committed_mb - permit.estimated_memory_mb).max(0.0)
        };
        Some(permit)
    }

    /// Hand out permits to queued waiters, head first, until the head no longer fits.
    fn drain(&mut self, limit_mb: f64, now: Instant) {
        while let Some(head) = self.queue.first() {
            if head.tx.is_closed() {
                self.queue.remove(0);
                continue;
            }
            if !self.fits(head.estimated_memory_mb, limit_mb) {
                break;
            }
            let waiter = self.queue.remove(0);
            let permit = self.grant(waiter.estimated_memory_mb, waiter.priority, now);
            if let Err(permit) = waiter.tx.send(permit) {
                // The caller went away between the closed check and the send.
                self.revoke(permit.id);
                self.usage.granted -= 1;
                self.usage.memory_total_mb -= permit.estimated_memory_mb;
            }
        }
    }
}

struct Inner {
    config: PermitConfig,
    clock: SharedClock,
    state: Mutex<PoolState>,
}

impl Inner {
    fn release(&self, id: PermitId) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(permit) = state.revoke(id) else {
            return false;
        };
        state.usage.released += 1;
        state.usage.hold_total += now.saturating_duration_since(permit.acquired_at);
        state.drain(self.config.memory_limit_mb, now);
        true
    }
}

/// Counted, memory-bounded permit pool.
///
/// A request is admitted when a permit slot is free and the sum of committed estimates stays
/// within `memory_limit_mb`. Requests that cannot be admitted wait in a queue ordered by the
/// configured [`AllocationStrategy`]; the queue is only ever drained from its head, so a large
/// request at the front is never starved by smaller ones behind it.
#[derive(Clone)]
pub struct PermitAllocator {
    inner: Arc<Inner>,
}

impl PermitAllocator {
    pub fn new(config: PermitConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: PermitConfig, clock: SharedClock) -> Self {
        let capacity = config.total_permits;
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: Mutex::new(PoolState {
                    capacity,
                    active: HashMap::new(),
                    committed_mb: 0.0,
                    queue: Vec::new(),
                    next_id: 0,
                    next_seq: 0,
                    adjustments: VecDeque::new(),
                    usage: UsageTotals::default(),
                }),
            }),
        }
    }

    pub fn config(&self) -> &PermitConfig {
        &self.inner.config
    }

    pub fn memory_limit_mb(&self) -> f64 {
        self.inner.config.memory_limit_mb
    }

    /// Admit immediately or return `None`. Never jumps ahead of queued waiters.
    pub fn try_acquire(&self, estimated_memory_mb: f64, priority: Priority) -> Option<Permit> {
        let limit = self.inner.config.memory_limit_mb;
        let mut state = self.inner.state.lock();
        if !state.queue.is_empty() || !state.fits(estimated_memory_mb.max(0.0), limit) {
            return None;
        }
        Some(state.grant(estimated_memory_mb.max(0.0), priority, self.inner.clock.now()))
    }

    /// Acquire using the configured `acquire_timeout`.
    pub async fn acquire(
        &self,
        estimated_memory_mb: f64,
        priority: Priority,
    ) -> Result<Permit, PermitError> {
        self.acquire_with_timeout(estimated_memory_mb, priority, self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a permit, waiting at most `timeout`.
    ///
    /// Dropping the returned future before it resolves withdraws the request; a permit that was
    /// granted in the meantime is returned to the pool.
    pub async fn acquire_with_timeout(
        &self,
        estimated_memory_mb: f64,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Permit, PermitError> {
        let limit = self.inner.config.memory_limit_mb;
        if estimated_memory_mb.is_nan() || estimated_memory_mb > limit {
            self.inner.state.lock().usage.rejected += 1;
            return Err(PermitError::MemoryLimitExceeded {
                requested_mb: estimated_memory_mb,
                limit_mb: limit,
            });
        }
        let estimated_memory_mb = estimated_memory_mb.max(0.0);

        let (seq, rx) = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push(Waiter {
                seq,
                estimated_memory_mb,
                priority,
                tx,
            });
            state.sort_queue(self.inner.config.strategy);
            state.drain(limit, self.inner.clock.now());
            (seq, rx)
        };

        let mut pending = PendingAcquire {
            inner: &self.inner,
            seq,
            rx: Some(rx),
        };
        let outcome = match pending.rx.as_mut() {
            Some(rx) => tokio::time::timeout(timeout, rx).await.ok(),
            None => None,
        };

        match outcome {
            Some(Ok(permit)) => {
                pending.rx = None;
                Ok(permit)
            }
            Some(Err(_)) | None => {
                // A grant that raced the timer still wins.
                if let Some(permit) = pending.withdraw() {
                    return Ok(permit);
                }
                let queued = {
                    let mut state = self.inner.state.lock();
                    state.usage.timeouts += 1;
                    state.queue.len()
                };
                tracing::warn!(
                    target = "regflow.permits",
                    estimated_memory_mb,
                    ?priority,
                    queued,
                    timeout_ms = timeout.as_millis() as u64,
                    "permit acquisition timed out"
                );
                Err(PermitError::Timeout {
                    waited: timeout,
                    estimated_memory_mb,
                })
            }
        }
    }

    /// Like [`Self::acquire`], but the permit is released when the guard is dropped.
    pub async fn acquire_guard(
        &self,
        estimated_memory_mb: f64,
        priority: Priority,
    ) -> Result<PermitGuard, PermitError> {
        let permit = self.acquire(estimated_memory_mb, priority).await?;
        Ok(PermitGuard {
            allocator: self.clone(),
            permit,
            released: false,
        })
    }

    /// Return a permit's budget and admit waiters. Unknown ids are ignored.
    pub fn release(&self, id: PermitId) -> bool {
        self.inner.release(id)
    }

    /// Resize the pool for the given pressure level and return the new capacity.
    ///
    /// Shrinking never revokes active permits; it only delays new admissions until enough of
    /// them have been released. `Normal` grows capacity back toward the configured total in
    /// steps.
    pub fn adjust_for_pressure(&self, pressure: MemoryPressure) -> usize {
        let total = self.inner.config.total_permits;
        let floor = MIN_CAPACITY.min(total);
        let scaled = |factor: f64| ((total as f64 * factor) as usize).max(floor);

        let mut state = self.inner.state.lock();
        let old_capacity = state.capacity;
        let new_capacity = match pressure {
            MemoryPressure::Normal => (old_capacity + GROWTH_STEP).min(total),
            MemoryPressure::Moderate => scaled(0.8),
            MemoryPressure::High => scaled(0.6),
            MemoryPressure::Critical => scaled(0.3),
        };
        if new_capacity == old_capacity {
            return new_capacity;
        }

        state.capacity = new_capacity;
        state.record_adjustment(PermitAdjustment {
            old_capacity,
            new_capacity,
            pressure,
            reason: AdjustmentReason::Pressure,
        });
        tracing::debug!(
            target = "regflow.permits",
            ?pressure,
            old_capacity,
            new_capacity,
            active = state.active.len(),
            "adjusted permit capacity"
        );
        if new_capacity > old_capacity {
            state.drain(self.inner.config.memory_limit_mb, self.inner.clock.now());
        }
        new_capacity
    }

    /// Observed usage above this many megabytes is a hard-limit breach.
    pub fn emergency_threshold_mb(&self) -> f64 {
        self.inner.config.memory_limit_mb * self.inner.config.emergency_threshold
    }

    /// Cut capacity by half the active count (never below one) after a hard-limit breach.
    ///
    /// Active permits are kept; capacity grows back through
    /// [`Self::adjust_for_pressure`] once pressure returns to normal.
    pub fn emergency_cleanup(&self, pressure: MemoryPressure) -> usize {
        let mut state = self.inner.state.lock();
        state.usage.emergency_cleanups += 1;
        let old_capacity = state.capacity;
        let new_capacity = old_capacity.saturating_sub(state.active.len() / 2).max(1);
        if new_capacity != old_capacity {
            state.capacity = new_capacity;
            state.record_adjustment(PermitAdjustment {
                old_capacity,
                new_capacity,
                pressure,
                reason: AdjustmentReason::EmergencyCleanup,
            });
        }
        tracing::warn!(
            target = "regflow.permits",
            ?pressure,
            old_capacity,
            new_capacity,
            active = state.active.len(),
            "emergency permit cleanup"
        );
        new_capacity
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn committed_mb(&self) -> f64 {
        self.inner.state.lock().committed_mb
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn adjustments(&self) -> Vec<PermitAdjustment> {
        self.inner.state.lock().adjustments.iter().cloned().collect()
    }

    pub fn stats(&self) -> PermitStats {
        let config = &self.inner.config;
        let state = self.inner.state.lock();
        let usage = &state.usage;
        PermitStats {
            total: config.total_permits,
            capacity: state.capacity,
            available: state.available(),
            active: state.active.len(),
            queued: state.queue.len(),
            committed_mb: state.committed_mb,
            memory_limit_mb: config.memory_limit_mb,
            utilization: state.active.len() as f64 / config.total_permits.max(1) as f64,
            usage: PermitUsage {
                granted: usage.granted,
                released: usage.released,
                timeouts: usage.timeouts,
                rejected: usage.rejected,
                emergency_cleanups: usage.emergency_cleanups,
                mean_hold_ms: match usage.released {
                    0 => 0.0,
                    n => usage.hold_total.as_secs_f64() * 1_000.0 / n as f64,
                },
                mean_memory_mb: match usage.granted {
                    0 => 0.0,
                    n => usage.memory_total_mb / n as f64,
                },
            },
        }
    }
}

impl fmt::Debug for PermitAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitAllocator")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A queued acquisition. Dropping it withdraws the request.
struct PendingAcquire<'a> {
    inner: &'a Inner,
    seq: u64,
    rx: Option<oneshot::Receiver<Permit>>,
}

impl PendingAcquire<'_> {
    /// Leave the queue. Returns the permit if one was granted before we got the lock.
    fn withdraw(&mut self) -> Option<Permit> {
        let mut rx = self.rx.take()?;
        {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.queue.iter().position(|w| w.seq == self.seq) {
                state.queue.remove(pos);
                // We may have been the head blocking smaller requests.
                state.drain(self.inner.config.memory_limit_mb, self.inner.clock.now());
                return None;
            }
        }
        rx.try_recv().ok()
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.withdraw() {
            self.inner.release(permit.id);
        }
    }
}

/// RAII handle for a permit; releases on drop.
pub struct PermitGuard {
    allocator: PermitAllocator,
    permit: Permit,
    released: bool,
}

impl PermitGuard {
    pub fn permit(&self) -> &Permit {
        &self.permit
    }

    pub fn id(&self) -> PermitId {
        self.permit.id
    }

    /// Release now instead of at drop.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.allocator.release(self.permit.id)
    }
}

impl fmt::Debug for PermitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitGuard")
            .field("permit", &self.permit)
            .finish()
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if !self.released {
            self.allocator.release(self.permit.id);
        }
    }
}
