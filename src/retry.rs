//! Bounded retry for transient remote faults.
//!
//! A [`RetryPolicy`] is a plain value (attempt budget + linear backoff unit)
//! consumed by [`retry_transient`]. Only errors that report themselves as
//! transient are retried; any other error ends the loop on the spot. Backoff
//! sleeps on the Tokio clock, so tests can pause and advance time.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Errors that can tell whether a retry might succeed.
pub trait Transient {
    /// True when the failure carried no response and a retry is worthwhile.
    fn is_transient(&self) -> bool;
}

/// Attempt budget and backoff for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_unit: Duration,
}

impl RetryPolicy {
    /// Build a policy. `max_attempts` counts the first try; zero is treated
    /// as one.
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the attempt following `attempt` (1-based): `attempt` units.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// A non-transient error ended the loop.
    #[error("failed on attempt {attempt}: {error}")]
    Failed {
        /// Attempt that produced the error.
        attempt: u32,
        /// The error itself.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Failed { attempt, .. } => *attempt,
        }
    }

    /// The underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Failed { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the policy's
/// attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Between attempt `n` and `n + 1`
/// the helper sleeps for [`RetryPolicy::backoff`]`(n)`.
///
/// # Errors
///
/// Returns [`RetryError::Failed`] for the first non-transient error and
/// [`RetryError::Exhausted`] when every attempt failed transiently.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Transient + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => {
                return Err(RetryError::Failed { attempt, error });
            }
            Err(error) if attempt >= policy.max_attempts() => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Err(error) => {
                let wait = policy.backoff(attempt);
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
