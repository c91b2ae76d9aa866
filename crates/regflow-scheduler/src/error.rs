use std::time::Duration;

use regflow_core::{FailureClass, InjectedFailure};
use thiserror::Error;

/// The permit pool could not admit a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PermitError {
    #[error("timed out after {waited:?} waiting for a permit ({estimated_memory_mb:.1}mb requested)")]
    Timeout {
        waited: Duration,
        estimated_memory_mb: f64,
    },
    #[error("request for {requested_mb:.1}mb can never fit the {limit_mb:.1}mb memory limit")]
    MemoryLimitExceeded { requested_mb: f64, limit_mb: f64 },
    #[error("observed usage of {used_mb:.1}mb is over the {threshold_mb:.1}mb hard limit")]
    HardLimitExceeded { used_mb: f64, threshold_mb: f64 },
}

/// Failure reported by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("transient failure after {retry_count} retries: {message}")]
    Transient { retry_count: u32, message: String },
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProcessingError::Transient {
            retry_count: 0,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessingError::Permanent(message.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ProcessingError::Transient { .. } => FailureClass::Transient,
            ProcessingError::Permanent(_) | ProcessingError::Cancelled => FailureClass::Permanent,
        }
    }

    pub(crate) fn with_retry_count(self, retries: u32) -> Self {
        match self {
            ProcessingError::Transient { message, .. } => ProcessingError::Transient {
                retry_count: retries,
                message,
            },
            other => other,
        }
    }
}

impl From<InjectedFailure> for ProcessingError {
    fn from(failure: InjectedFailure) -> Self {
        match failure.class {
            FailureClass::Transient => ProcessingError::transient(failure.message),
            FailureClass::Permanent => ProcessingError::Permanent(failure.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit `{name}` is open")]
pub struct CircuitOpen {
    pub name: String,
}
