//! Retry policy shared by every retrying call site
//!
//! A [`RetryPolicy`] fixes the attempt budget and the backoff curve; the
//! caller decides per attempt whether a failure is worth retrying by
//! returning an [`Attempt`]. Waits race the run's cancellation token so a
//! stopping run never sits out a backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Shape of the delay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base * 2^attempt`
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
}

/// Attempt budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay unit
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Delay curve
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff,
        }
    }

    /// Exponential policy
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(max_attempts, base_delay, max_delay, Backoff::Exponential)
    }

    /// Linear policy
    pub fn linear(max_attempts: u32, step: Duration, max_delay: Duration) -> Self {
        Self::new(max_attempts, step, max_delay, Backoff::Linear)
    }

    /// A single attempt, never waits
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Backoff::Linear)
    }

    /// Delay after the failed attempt `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.backoff {
            // 2^attempt saturates instead of overflowing for large attempts
            Backoff::Exponential => 1u32.checked_shl(attempt).unwrap_or(u32::MAX),
            Backoff::Linear => attempt.saturating_add(1),
        };
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of one attempt as judged by the caller
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Finished; stop retrying
    Done(T),
    /// Failed, another attempt may succeed
    Retry(E),
    /// Failed, further attempts are pointless
    Fail(E),
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable failure
    Rejected {
        /// The failure
        error: E,
        /// Attempts made
        attempts: u32,
    },
    /// Every attempt failed
    Exhausted {
        /// Last failure
        error: E,
        /// Attempts made
        attempts: u32,
    },
    /// The run stopped before the operation could finish
    Cancelled {
        /// Attempts made
        attempts: u32,
        /// Failure seen before the stop, if any
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Rejected { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` under `policy`
///
/// The closure receives the 0-indexed attempt number. No wait follows the
/// final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    stop: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if stop.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last_error,
            });
        }

        match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(error) => {
                return Err(RetryError::Rejected {
                    error,
                    attempts: attempt + 1,
                })
            }
            Attempt::Retry(error) => {
                if attempt + 1 >= max_attempts {
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: attempt + 1,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    label,
                    attempt = attempt + 1,
                    max = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient error"
                );
                last_error = Some(error);
                tokio::select! {
                    _ = stop.cancelled() => {
                        return Err(RetryError::Cancelled {
                            attempts: attempt + 1,
                            last_error,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // max_attempts >= 1, so the loop always returns
    Err(RetryError::Cancelled {
        attempts: max_attempts,
        last_error,
    })
}
