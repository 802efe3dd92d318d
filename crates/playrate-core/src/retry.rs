//! Retry with bounded backoff.
//!
//! One [`RetryPolicy`] type covers every retry loop in the protocol: the page
//! agent's reconnect schedule, the coordinator's one-shot message retries and
//! the shortcut relay. The policy only computes delays; the agent's reconnect
//! state machine in [`crate::reconnect`] decides when a retry may start.
//!
//! # Usage
//!
//! ```rust,ignore
//! use playrate_core::retry::{RetryPolicy, with_retry};
//!
//! let reply = with_retry(&RetryPolicy::tab_message(), || async {
//!     host.send_to_tab(tab, &Command::Ping).await
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, HostError};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// `initial * factor^attempt`
    #[default]
    Exponential,
    /// `initial * (attempt + 1)`
    Linear,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt (exponential schedule only).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = retry forever.
    pub max_attempts: Option<u32>,
    pub schedule: Schedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
            schedule: Schedule::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create an exponential policy, clamping the factor to at least 1 and the
    /// jitter into `[0, 1]`.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
            schedule: Schedule::Exponential,
        }
    }

    /// Page agent reconnect schedule: 1s base, ×1.5, capped at 10s, 10 attempts.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
            jitter_percent: 0.0,
            max_attempts: Some(10),
            schedule: Schedule::Exponential,
        }
    }

    /// Coordinator one-shot messages: 3 attempts, 100ms ×2, capped at 2s.
    #[must_use]
    pub fn tab_message() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(3),
            schedule: Schedule::Exponential,
        }
    }

    /// Shortcut relay: first try plus 3 retries, 100ms linear steps.
    #[must_use]
    pub fn shortcut() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: Some(4),
            schedule: Schedule::Linear,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let base_ms = match self.schedule {
            Schedule::Exponential => {
                // Cap exponent to keep powi finite
                let exp = attempt.min(31) as i32;
                (initial_ms as f64) * self.backoff_factor.max(1.0).powi(exp)
            }
            Schedule::Linear => (initial_ms as f64) * f64::from(attempt.saturating_add(1)),
        };
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Whether `attempts` already used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent, delays included.
    pub elapsed: Duration,
}

/// Run `operation` until it succeeds or the policy runs out of attempts.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Like [`with_retry`], returning attempt count and elapsed time as well.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_when(policy, |_| true, operation).await
}

/// Retry only while `should_retry` accepts the error; anything else is
/// returned immediately.
pub async fn with_retry_when<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    mut should_retry: P,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    P: FnMut(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !should_retry(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if policy.is_exhausted(attempt) {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                crate::runtime::sleep(delay).await;
            }
        }
    }
}

/// Whether a host failure might clear up on its own.
#[must_use]
pub fn is_retryable_host(error: &HostError) -> bool {
    match error {
        HostError::ContextInvalidated => true, // agent may be re-injected
        HostError::NoReceiver(_) => true,      // agent still booting
        HostError::TimedOut(_) => true,
        HostError::Other(_) => true,
        HostError::CannotScript(_) => false, // protected page
        HostError::TabNotFound(_) => false,  // tab is gone
    }
}

/// Check if an error is retryable.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Host(e) => is_retryable_host(e),
        // A closed channel is replaced, not retried
        Error::Channel(_) => false,
        Error::Storage(e) => matches!(e, crate::error::StorageError::Unavailable(_)),
        Error::Io(_) => true,
        Error::Runtime(_) => true,
        Error::Speed(_) | Error::Pattern(_) | Error::Config(_) | Error::Json(_) => false,
    }
}
