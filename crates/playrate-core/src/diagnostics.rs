//! Rate-limited diagnostics.
//!
//! The recovery loops can fail the same way dozens of times during a host
//! outage. [`ThrottledLog`] caps how many events per severity class reach
//! `tracing` inside a window and counts the rest.

use std::fmt::Display;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

// =============================================================================
// Configuration
// =============================================================================

/// Throttle window settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Events logged per class before suppression starts.
    pub max_events: u32,
    /// Debug events are dropped unless this is set.
    pub debug_enabled: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            max_events: 3,
            debug_enabled: false,
        }
    }
}

/// Severity classes, each with its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
}

impl Severity {
    fn index(self) -> usize {
        match self {
            Self::Error => 0,
            Self::Warn => 1,
            Self::Info => 2,
            Self::Debug => 3,
        }
    }
}

// =============================================================================
// ThrottledLog
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct ClassWindow {
    logged: u32,
    last_logged_ms: Option<u64>,
    suppressed: u64,
}

/// Per-class event throttle. Pure: callers pass `now_ms`.
#[derive(Debug, Clone)]
pub struct ThrottledLog {
    config: ThrottleConfig,
    classes: [ClassWindow; 4],
}

impl ThrottledLog {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            classes: [ClassWindow::default(); 4],
        }
    }

    #[must_use]
    pub fn config(&self) -> ThrottleConfig {
        self.config
    }

    /// Decide whether an event of `severity` at `now_ms` should be logged.
    ///
    /// The count resets once a full window has passed since the last event
    /// that was actually logged.
    pub fn record(&mut self, severity: Severity, now_ms: u64) -> bool {
        if severity == Severity::Debug && !self.config.debug_enabled {
            return false;
        }

        let window = &mut self.classes[severity.index()];
        if let Some(last) = window.last_logged_ms {
            if now_ms.saturating_sub(last) > self.config.window_ms {
                window.logged = 0;
            }
        }

        if window.logged < self.config.max_events {
            window.logged += 1;
            window.last_logged_ms = Some(now_ms);
            true
        } else {
            window.suppressed += 1;
            false
        }
    }

    /// Events of `severity` swallowed so far.
    #[must_use]
    pub fn suppressed(&self, severity: Severity) -> u64 {
        self.classes[severity.index()].suppressed
    }
}

impl Default for ThrottledLog {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

// =============================================================================
// Diagnostics handle
// =============================================================================

/// Shared throttle plus clock, used by the agent and the coordinator.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    component: &'static str,
    throttle: Arc<Mutex<ThrottledLog>>,
    clock: Arc<dyn Clock>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(component: &'static str, config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            component,
            throttle: Arc::new(Mutex::new(ThrottledLog::new(config))),
            clock,
        }
    }

    fn admit(&self, severity: Severity) -> bool {
        let now_ms = self.clock.now_ms();
        self.throttle
            .lock()
            .map(|mut log| log.record(severity, now_ms))
            .unwrap_or(false)
    }

    /// Log `message` at `severity` if the throttle allows it.
    pub fn emit(&self, severity: Severity, message: &str, detail: &dyn Display) -> bool {
        if !self.admit(severity) {
            return false;
        }
        let component = self.component;
        match severity {
            Severity::Error => error!(component, detail = %detail, "{message}"),
            Severity::Warn => warn!(component, detail = %detail, "{message}"),
            Severity::Info => info!(component, detail = %detail, "{message}"),
            Severity::Debug => debug!(component, detail = %detail, "{message}"),
        }
        true
    }

    pub fn error(&self, message: &str, detail: &dyn Display) -> bool {
        self.emit(Severity::Error, message, detail)
    }

    pub fn warn(&self, message: &str, detail: &dyn Display) -> bool {
        self.emit(Severity::Warn, message, detail)
    }

    pub fn debug(&self, message: &str, detail: &dyn Display) -> bool {
        self.emit(Severity::Debug, message, detail)
    }

    #[must_use]
    pub fn suppressed(&self, severity: Severity) -> u64 {
        self.throttle
            .lock()
            .map(|log| log.suppressed(severity))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn suppresses_after_max_events_in_window() {
        let mut log = ThrottledLog::default();
        assert!(log.record(Severity::Error, 0));
        assert!(log.record(Severity::Error, 100));
        assert!(log.record(Severity::Error, 200));
        assert!(!log.record(Severity::Error, 300));
        assert!(!log.record(Severity::Error, 4_000));
        assert_eq!(log.suppressed(Severity::Error), 2);
    }

    #[test]
    fn window_measured_from_last_logged_event() {
        let mut log = ThrottledLog::default();
        for t in [0, 100, 200] {
            assert!(log.record(Severity::Error, t));
        }
        // 5000ms after 200 is not yet "elapsed"
        assert!(!log.record(Severity::Error, 5_200));
        assert!(log.record(Severity::Error, 5_201));
    }

    #[test]
    fn classes_are_independent() {
        let mut log = ThrottledLog::default();
        for t in 0..3 {
            assert!(log.record(Severity::Error, t));
        }
        assert!(!log.record(Severity::Error, 10));
        assert!(log.record(Severity::Warn, 10));
        assert_eq!(log.suppressed(Severity::Warn), 0);
    }

    #[test]
    fn debug_dropped_unless_enabled() {
        let mut log = ThrottledLog::default();
        assert!(!log.record(Severity::Debug, 0));
        // Dropped debug events are not counted as suppressed
        assert_eq!(log.suppressed(Severity::Debug), 0);

        let mut log = ThrottledLog::new(ThrottleConfig {
            debug_enabled: true,
            ..ThrottleConfig::default()
        });
        assert!(log.record(Severity::Debug, 0));
    }

    #[test]
    fn handle_uses_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let diag = Diagnostics::new("test", ThrottleConfig::default(), clock.clone());
        for _ in 0..3 {
            assert!(diag.error("injection failed", &"boom"));
        }
        assert!(!diag.error("injection failed", &"boom"));
        assert_eq!(diag.suppressed(Severity::Error), 1);

        clock.advance(Duration::from_millis(5_001));
        assert!(diag.error("injection failed", &"boom"));
    }
}
