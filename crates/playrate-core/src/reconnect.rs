//! Page agent reconnect bookkeeping.
//!
//! [`ReconnectState`] is a pure state machine driven with explicit `now_ms`
//! values: it rate-limits attempts, bounds them, and hands out the backoff
//! delay for the next one. [`RecoveryFlag`] is the "recovery in flight"
//! marker; the [`RecoveryGuard`] it hands out releases it on drop, so an
//! early return, an error or a cancelled task cannot leave it stuck.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::retry::RetryPolicy;

/// Default minimum spacing between two reconnect attempts.
pub const DEFAULT_MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// What the caller should do about a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Sleep `delay`, then reconnect. `attempt` is 1-based.
    Proceed { attempt: u32, delay: Duration },
    /// The previous attempt was too recent.
    RateLimited { retry_after_ms: u64 },
    /// `max_attempts` reached; wait for an external reset.
    Exhausted,
}

/// Attempt counters for one page context.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    attempts: u32,
    last_attempt_ms: Option<u64>,
    min_interval_ms: u64,
    policy: RetryPolicy,
}

impl ReconnectState {
    #[must_use]
    pub fn new(policy: RetryPolicy, min_interval: Duration) -> Self {
        Self {
            attempts: 0,
            last_attempt_ms: None,
            min_interval_ms: u64::try_from(min_interval.as_millis()).unwrap_or(u64::MAX),
            policy,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts.unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.policy.is_exhausted(self.attempts)
    }

    /// Claim the next attempt at `now_ms`.
    ///
    /// The delay for a granted attempt is computed from the number of
    /// attempts made before it, so the first retry waits the base delay.
    pub fn begin(&mut self, now_ms: u64) -> ReconnectDecision {
        if self.is_exhausted() {
            return ReconnectDecision::Exhausted;
        }

        if let Some(last) = self.last_attempt_ms {
            let since = now_ms.saturating_sub(last);
            if since < self.min_interval_ms {
                return ReconnectDecision::RateLimited {
                    retry_after_ms: self.min_interval_ms - since,
                };
            }
        }

        let delay = self.policy.delay_for_attempt(self.attempts);
        self.attempts += 1;
        self.last_attempt_ms = Some(now_ms);
        ReconnectDecision::Proceed {
            attempt: self.attempts,
            delay,
        }
    }

    /// A validation round trip succeeded.
    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    /// External trigger (navigation, cleanup): start over.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt_ms = None;
    }

    #[must_use]
    pub fn snapshot(&self) -> ReconnectSnapshot {
        ReconnectSnapshot {
            attempts: self.attempts,
            max_attempts: self.max_attempts(),
            last_attempt_ms: self.last_attempt_ms,
        }
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new(RetryPolicy::reconnect(), DEFAULT_MIN_RECONNECT_INTERVAL)
    }
}

/// Serializable view for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectSnapshot {
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_attempt_ms: Option<u64>,
}

/// Shared "recovery in flight" marker.
///
/// This is a count rather than a bool: a forced recovery may run alongside a
/// regular one, and the marker is clear only when both are done.
#[derive(Debug, Clone, Default)]
pub struct RecoveryFlag {
    in_flight: Arc<AtomicUsize>,
}

impl RecoveryFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Enter recovery. Without `force` this fails while another recovery is
    /// running.
    #[must_use]
    pub fn try_enter(&self, force: bool) -> Option<RecoveryGuard> {
        if force {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        } else {
            self.in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok()?;
        }
        Some(RecoveryGuard {
            in_flight: Arc::clone(&self.in_flight),
        })
    }
}

/// Releases its [`RecoveryFlag`] entry when dropped.
#[derive(Debug)]
#[must_use = "recovery ends as soon as the guard is dropped"]
pub struct RecoveryGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ReconnectState {
        ReconnectState::default()
    }

    #[test]
    fn first_attempt_uses_base_delay() {
        let mut s = state();
        assert_eq!(
            s.begin(0),
            ReconnectDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            s.begin(600),
            ReconnectDecision::Proceed {
                attempt: 2,
                delay: Duration::from_millis(1500)
            }
        );
    }

    #[test]
    fn attempts_inside_min_interval_are_rate_limited() {
        let mut s = state();
        let _ = s.begin(1_000);
        assert_eq!(
            s.begin(1_200),
            ReconnectDecision::RateLimited {
                retry_after_ms: 300
            }
        );
        // Rate-limited calls do not consume attempts
        assert_eq!(s.attempts(), 1);
        assert!(matches!(s.begin(1_500), ReconnectDecision::Proceed { .. }));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let mut s = state();
        for i in 0..10u64 {
            assert!(matches!(s.begin(i * 1_000), ReconnectDecision::Proceed { .. }));
        }
        assert_eq!(s.begin(100_000), ReconnectDecision::Exhausted);
        assert!(s.is_exhausted());

        s.reset();
        assert_eq!(s.attempts(), 0);
        assert!(matches!(s.begin(100_000), ReconnectDecision::Proceed { .. }));
    }

    #[test]
    fn success_resets_attempts_but_keeps_rate_limit() {
        let mut s = state();
        let _ = s.begin(0);
        let _ = s.begin(1_000);
        s.record_success();
        assert_eq!(s.attempts(), 0);
        assert_eq!(s.last_attempt_ms(), Some(1_000));
        assert!(matches!(
            s.begin(1_100),
            ReconnectDecision::RateLimited { .. }
        ));
    }

    #[test]
    fn flag_is_non_reentrant_without_force() {
        let flag = RecoveryFlag::new();
        let first = flag.try_enter(false);
        assert!(first.is_some());
        assert!(flag.try_enter(false).is_none());

        let forced = flag.try_enter(true);
        assert!(forced.is_some());

        drop(first);
        assert!(flag.is_set());
        drop(forced);
        assert!(!flag.is_set());
        assert!(flag.try_enter(false).is_some());
    }

    #[tokio::test]
    async fn guard_released_when_task_is_aborted() {
        let flag = RecoveryFlag::new();
        let task_flag = flag.clone();
        let handle = tokio::spawn(async move {
            let _guard = task_flag.try_enter(false);
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;
        assert!(!flag.is_set());
    }
}
