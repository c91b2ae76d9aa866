use std::future::Future;
use std::time::Duration;

use regflow_core::FailureClass;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// A successful result and how many failed attempts preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retry_count: u32,
}

/// Retries transient failures with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry that follows failed attempt `attempt_index` (0-based).
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_index.min(16));
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 0-based attempt index. On exhaustion the last error is returned with
    /// its retry count filled in.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<Retried<T>, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        self.run(op, None).await
    }

    /// Like [`Self::with_retry`], but cancelling `cancel` interrupts the backoff sleep and
    /// returns [`ProcessingError::Cancelled`].
    pub async fn with_retry_cancellable<T, F, Fut>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Result<Retried<T>, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        self.run(op, Some(cancel)).await
    }

    async fn run<T, F, Fut>(
        &self,
        mut op: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<Retried<T>, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(ProcessingError::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retry_count: attempt,
                    })
                }
                Err(err) => err,
            };

            if err.class() == FailureClass::Permanent {
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                tracing::warn!(
                    target = "regflow.retry",
                    attempts = attempt + 1,
                    error = %err,
                    "retries exhausted"
                );
                return Err(err.with_retry_count(attempt));
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                target = "regflow.retry",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}
