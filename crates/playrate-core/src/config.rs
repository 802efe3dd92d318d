//! Configuration management for playrate
//!
//! Handles loading and validation of `playrate.toml`. Every field has a
//! default, so an empty file (or no file at all) yields the stock protocol
//! timings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::ThrottleConfig;
use crate::error::ConfigError;
use crate::logging::LogLevel;
use crate::retry::{RetryPolicy, Schedule};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Page agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Throttled diagnostics
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Storage cache settings
    #[serde(default)]
    pub storage: StorageConfig,
}

// =============================================================================
// General
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional append-only log file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Let throttled debug diagnostics through
    #[serde(default)]
    pub debug_diagnostics: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
            debug_diagnostics: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Backoff
// =============================================================================

/// Serializable retry schedule, converted into a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    #[serde(default)]
    pub schedule: Schedule,
}

impl BackoffConfig {
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter_percent: 0.0,
            max_attempts: Some(self.max_attempts),
            schedule: self.schedule,
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(field, "max_attempts must be >= 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid(field, "max_delay_ms must be >= base_delay_ms"));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(invalid(field, "backoff_factor must be a finite number >= 1"));
        }
        Ok(())
    }
}

fn default_reconnect_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 1_000,
        max_delay_ms: 10_000,
        backoff_factor: 1.5,
        max_attempts: 10,
        schedule: Schedule::Exponential,
    }
}

fn default_message_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 100,
        max_delay_ms: 2_000,
        backoff_factor: 2.0,
        max_attempts: 3,
        schedule: Schedule::Exponential,
    }
}

fn default_shortcut_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        backoff_factor: 1.0,
        max_attempts: 4,
        schedule: Schedule::Linear,
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Page agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the long-lived channel to the coordinator
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect: BackoffConfig,

    /// Minimum spacing between reconnect attempts
    #[serde(default = "default_min_reconnect_interval")]
    pub min_reconnect_interval_ms: u64,

    /// Timeout for the validation ping
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_status_check_interval")]
    pub status_check_interval_ms: u64,

    #[serde(default = "default_visibility_debounce")]
    pub visibility_debounce_ms: u64,

    /// Wait between asking for re-injection and the forced recovery
    #[serde(default = "default_reload_settle")]
    pub reload_settle_ms: u64,

    /// Wait before falling back to a reload after a failed start
    #[serde(default = "default_init_retry_delay")]
    pub init_retry_delay_ms: u64,

    /// Extra tries when a video does not accept a new rate
    #[serde(default = "default_rate_apply_retries")]
    pub rate_apply_retries: u32,

    #[serde(default = "default_rate_apply_retry_delay")]
    pub rate_apply_retry_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            reconnect: default_reconnect_backoff(),
            min_reconnect_interval_ms: default_min_reconnect_interval(),
            connection_timeout_ms: default_connection_timeout(),
            status_check_interval_ms: default_status_check_interval(),
            visibility_debounce_ms: default_visibility_debounce(),
            reload_settle_ms: default_reload_settle(),
            init_retry_delay_ms: default_init_retry_delay(),
            rate_apply_retries: default_rate_apply_retries(),
            rate_apply_retry_delay_ms: default_rate_apply_retry_delay(),
        }
    }
}

fn default_channel_name() -> String {
    "videoSpeedController".to_string()
}

fn default_min_reconnect_interval() -> u64 {
    500
}

fn default_connection_timeout() -> u64 {
    5_000
}

fn default_status_check_interval() -> u64 {
    5_000
}

fn default_visibility_debounce() -> u64 {
    500
}

fn default_reload_settle() -> u64 {
    500
}

fn default_init_retry_delay() -> u64 {
    1_000
}

fn default_rate_apply_retries() -> u32 {
    3
}

fn default_rate_apply_retry_delay() -> u64 {
    100
}

// =============================================================================
// Coordinator
// =============================================================================

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Navigation events this close to the last injection are ignored
    #[serde(default = "default_min_reinject_interval")]
    pub min_reinject_interval_ms: u64,

    /// Failed injections per tab before the tab is abandoned
    #[serde(default = "default_max_injection_attempts")]
    pub max_injection_attempts: u32,

    /// Wait after a committed navigation before injecting
    #[serde(default = "default_navigation_settle")]
    pub navigation_settle_ms: u64,

    /// Wait after a channel closes before checking the tab
    #[serde(default = "default_port_grace")]
    pub port_grace_ms: u64,

    /// Spacing between re-injections on install/update
    #[serde(default = "default_install_spacing")]
    pub install_spacing_ms: u64,

    /// Wait after an on-demand injection before messaging the tab
    #[serde(default = "default_inject_settle")]
    pub inject_settle_ms: u64,

    #[serde(default = "default_message_timeout")]
    pub message_timeout_ms: u64,

    #[serde(default = "default_message_backoff")]
    pub message_retry: BackoffConfig,

    #[serde(default = "default_shortcut_backoff")]
    pub shortcut_retry: BackoffConfig,

    /// Hosts whose in-page route changes warrant re-injection
    #[serde(default = "default_spa_patterns")]
    pub spa_patterns: Vec<String>,

    /// URL prefixes the shortcut never touches
    #[serde(default = "default_protected_schemes")]
    pub protected_schemes: Vec<String>,

    /// Injection errors that mean "this page cannot be scripted"
    #[serde(default = "default_ignored_injection_errors")]
    pub ignored_injection_errors: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_reinject_interval_ms: default_min_reinject_interval(),
            max_injection_attempts: default_max_injection_attempts(),
            navigation_settle_ms: default_navigation_settle(),
            port_grace_ms: default_port_grace(),
            install_spacing_ms: default_install_spacing(),
            inject_settle_ms: default_inject_settle(),
            message_timeout_ms: default_message_timeout(),
            message_retry: default_message_backoff(),
            shortcut_retry: default_shortcut_backoff(),
            spa_patterns: default_spa_patterns(),
            protected_schemes: default_protected_schemes(),
            ignored_injection_errors: default_ignored_injection_errors(),
        }
    }
}

fn default_min_reinject_interval() -> u64 {
    1_000
}

fn default_max_injection_attempts() -> u32 {
    3
}

fn default_navigation_settle() -> u64 {
    500
}

fn default_port_grace() -> u64 {
    1_000
}

fn default_install_spacing() -> u64 {
    100
}

fn default_inject_settle() -> u64 {
    100
}

fn default_message_timeout() -> u64 {
    5_000
}

fn default_spa_patterns() -> Vec<String> {
    vec!["*://www.youtube.com/*".to_string(), "*://youtube.com/*".to_string()]
}

fn default_protected_schemes() -> Vec<String> {
    ["chrome://", "edge://", "about:", "chrome-extension://"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_ignored_injection_errors() -> Vec<String> {
    ["cannot be scripted", "extensions gallery", "chrome://", "edge://", "about:"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

// =============================================================================
// Diagnostics / storage
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_window")]
    pub window_ms: u64,

    #[serde(default = "default_max_events")]
    pub max_events: u32,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window(),
            max_events: default_max_events(),
        }
    }
}

fn default_window() -> u64 {
    5_000
}

fn default_max_events() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    crate::storage::DEFAULT_CACHE_TTL_MS
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

// =============================================================================
// Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/playrate/playrate.toml` (or the platform equivalent).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("playrate").join("playrate.toml"))
}

impl Config {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would stall or spin the protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general
            .log_level
            .parse::<LogLevel>()
            .map_err(|reason| ConfigError::Invalid {
                field: "general.log_level",
                reason,
            })?;

        if self.agent.channel_name.trim().is_empty() {
            return Err(invalid("agent.channel_name", "must not be empty"));
        }
        self.agent.reconnect.validate("agent.reconnect")?;
        if self.agent.connection_timeout_ms == 0 {
            return Err(invalid("agent.connection_timeout_ms", "must be > 0"));
        }
        if self.agent.status_check_interval_ms == 0 {
            return Err(invalid("agent.status_check_interval_ms", "must be > 0"));
        }

        self.coordinator
            .message_retry
            .validate("coordinator.message_retry")?;
        self.coordinator
            .shortcut_retry
            .validate("coordinator.shortcut_retry")?;
        if self.coordinator.max_injection_attempts == 0 {
            return Err(invalid("coordinator.max_injection_attempts", "must be >= 1"));
        }
        if self.coordinator.message_timeout_ms == 0 {
            return Err(invalid("coordinator.message_timeout_ms", "must be > 0"));
        }

        if self.diagnostics.max_events == 0 {
            return Err(invalid("diagnostics.max_events", "must be >= 1"));
        }
        if self.diagnostics.window_ms == 0 {
            return Err(invalid("diagnostics.window_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Throttle settings shared by the agent and the coordinator.
    #[must_use]
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            window_ms: self.diagnostics.window_ms,
            max_events: self.diagnostics.max_events,
            debug_enabled: self.general.debug_diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.agent.channel_name, "videoSpeedController");
        assert_eq!(config.agent.reconnect.max_attempts, 10);
        assert_eq!(config.coordinator.min_reinject_interval_ms, 1_000);
        assert_eq!(config.storage.cache_ttl_ms, 5_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [general]
            log_format = "json"

            [agent.reconnect]
            base_delay_ms = 200
            max_delay_ms = 800
            backoff_factor = 2.0
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.agent.reconnect.max_attempts, 4);
        assert_eq!(config.agent.min_reconnect_interval_ms, 500);
    }

    #[test]
    fn reconnect_policy_matches_preset() {
        let policy = AgentConfig::default().reconnect.to_policy();
        assert_eq!(policy, RetryPolicy::reconnect());
        let policy = CoordinatorConfig::default().message_retry.to_policy();
        assert_eq!(policy, RetryPolicy::tab_message());
        let policy = CoordinatorConfig::default().shortcut_retry.to_policy();
        assert_eq!(policy, RetryPolicy::shortcut());
    }

    #[test]
    fn validation_rejects_inconsistent_backoff() {
        let mut config = Config::default();
        config.agent.reconnect.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "agent.reconnect", .. })
        ));

        let mut config = Config::default();
        config.coordinator.message_retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent.reconnect.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.general.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "general.log_level", .. })
        ));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[agent.reconnect]"));
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn load_from_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playrate.toml");
        std::fs::write(&path, "[storage]\ncache_ttl_ms = 250\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.cache_ttl_ms, 250);
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn throttle_takes_debug_flag_from_general() {
        let mut config = Config::default();
        config.general.debug_diagnostics = true;
        let throttle = config.throttle();
        assert!(throttle.debug_enabled);
        assert_eq!(throttle.max_events, 3);
    }
}
