//! Admission control and execution policy for regflow batch processing.
//!
//! - [`PermitAllocator`]: a counted, memory-bounded permit pool with ordered waiters.
//! - [`AdaptiveBatchScheduler`]: splits work into chunks, runs each chunk under permits and
//!   adapts the chunk size to observed latency or memory usage.
//! - [`RetryController`]: bounded exponential backoff for transient failures.
//! - [`CircuitBreaker`]: consecutive-failure breaker with a half-open trial.

mod batch;
mod circuit;
mod error;
mod permits;
mod retry;

pub use batch::{
    AdaptationRecord, AdaptationTrigger, AdaptiveBatchScheduler, BatchConfig, BatchItem,
    BatchReport, ItemFailure,
};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use error::{CircuitOpen, PermitError, ProcessingError};
pub use permits::{
    AdjustmentReason, AllocationStrategy, Permit, PermitAdjustment, PermitAllocator, PermitConfig,
    PermitGuard, PermitId, PermitStats, PermitUsage,
};
pub use retry::{Retried, RetryConfig, RetryController};
