//! Bounded retry of atomic units with flat random backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use store::StoreError;

use crate::error::{Result, SagaError};

/// How often, and how patiently, a unit is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Shortest pause before a retry.
    pub min_backoff: Duration,
    /// Longest pause before a retry. At or below `min_backoff` the pause is
    /// always `min_backoff`.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts` times without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Draws one backoff uniformly from `[min_backoff, max_backoff]`.
    pub fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }
        let min = self.min_backoff.as_micros() as u64;
        let max = self.max_backoff.as_micros() as u64;
        Duration::from_micros(rand::rng().random_range(min..=max))
    }
}

/// Runs atomic units under a [`RetryPolicy`].
///
/// Every failure is retried: lock conflicts and zero-effect updates are the
/// expected ones, but a unit never half-commits, so retrying anything else
/// is harmless too.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds or the attempts run out.
    ///
    /// `op` must build a fresh unit on every call. There is no sleep after
    /// the final attempt.
    pub async fn run<T, F, Fut>(&self, unit: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(unit, attempt, "unit succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(source) if attempt >= attempts => {
                    let transient = source.is_transient();
                    metrics::counter!(
                        "retry_exhausted_total",
                        "unit" => unit,
                        "transient" => if transient { "true" } else { "false" }
                    )
                    .increment(1);
                    tracing::warn!(unit, attempts, transient, error = %source, "unit retries exhausted");
                    return Err(SagaError::RetryExhausted {
                        unit,
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    let backoff = self.policy.backoff();
                    tracing::debug!(
                        unit,
                        attempt,
                        transient = err.is_transient(),
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "unit failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
