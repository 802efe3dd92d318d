//! Error types for playrate-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for playrate-core
#[derive(Error, Debug)]
pub enum Error {
    /// Host runtime failures (messaging, script execution)
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Long-lived channel failures
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Key-value store failures
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Speed validation failures
    #[error("Speed error: {0}")]
    Speed(#[from] SpeedError),

    /// URL pattern compilation failures
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, shutdown races)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Failures reported by the host runtime.
///
/// A timeout is deliberately just another variant: callers treat it the same
/// way as any other failed round trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The extension context backing this handle was invalidated
    /// (extension reload, service worker restart).
    #[error("extension context invalidated")]
    ContextInvalidated,

    /// No listener on the other side of a one-shot message.
    #[error("could not establish connection: receiving end does not exist ({0})")]
    NoReceiver(String),

    /// The host refused to run a script in the target page.
    #[error("cannot access contents of the page: {0}")]
    CannotScript(String),

    /// The tab disappeared while an operation was in flight.
    #[error("no tab with id {0}")]
    TabNotFound(u64),

    /// The round trip did not complete in time.
    #[error("operation timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// Any other host-reported failure.
    #[error("{0}")]
    Other(String),
}

/// Errors from [`crate::channel`] endpoints.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("attempting to use a disconnected port")]
    Disconnected,
}

/// Errors from the shared key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("malformed value for key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Rejected speed values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeedError {
    #[error("speed {0} outside [0.1, 16]")]
    OutOfRange(f64),

    #[error("speed is not a number")]
    NotANumber,
}

/// URL pattern compilation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    Invalid { pattern: String, reason: String },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl HostError {
    /// Whether the host refused the page outright (browser-internal pages,
    /// web store). These are expected and never retried.
    #[must_use]
    pub fn is_protected_page(&self, ignored_patterns: &[String]) -> bool {
        let message = self.to_string().to_lowercase();
        ignored_patterns
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_duration() {
        let err = HostError::TimedOut(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "operation timed out after 1500ms");
    }

    #[test]
    fn protected_page_matching_is_case_insensitive() {
        let patterns = vec!["Cannot be scripted".to_string(), "chrome://".to_string()];
        let err = HostError::CannotScript("The extensions gallery cannot be scripted.".into());
        assert!(err.is_protected_page(&patterns));

        let err = HostError::CannotScript("chrome://settings".into());
        assert!(err.is_protected_page(&patterns));

        let err = HostError::Other("frame was removed".into());
        assert!(!err.is_protected_page(&patterns));
    }

    #[test]
    fn errors_convert_into_crate_error() {
        let err: Error = HostError::ContextInvalidated.into();
        assert!(matches!(err, Error::Host(HostError::ContextInvalidated)));

        let err: Error = ChannelError::Disconnected.into();
        assert!(err.to_string().contains("disconnected port"));
    }
}
