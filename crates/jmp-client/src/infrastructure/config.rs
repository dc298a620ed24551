//! TOML-based client configuration.
//!
//! Reads and writes [`ClientConfig`] at a path chosen by the caller.
//!
//! ```toml
//! [client]
//! namespace = "lab"
//! name = "alice"
//! endpoint = "grpc.jumpstarter.example.com:443"
//!
//! [lease]
//! selector = "board=rpi4"
//! duration_secs = 1800
//!
//! [status]
//! timeout_streak_threshold = 20
//! ```
//!
//! Every field has a serde default, so a missing file or an older file with
//! fewer fields still produces a working configuration.  Values that would
//! stall or spin the background loops (zero intervals, a retry multiplier
//! below 1) are rejected when the file is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::lease::LeaseConfig;
use crate::application::status_monitor::StatusMonitorConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds a value the client cannot run with.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub status: StatusSection,
}

/// Identity of this client and where the controller lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// Controller endpoint, `host:port`.
    #[serde(default)]
    pub endpoint: String,
    /// `tracing` filter directive: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Lease request and monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseSection {
    /// Default selector used when the caller does not pass one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default = "default_lease_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_acquire_poll_ms")]
    pub acquire_poll_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Holders are warned once less than this much time remains.
    #[serde(default = "default_ending_threshold_secs")]
    pub ending_threshold_secs: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Delete the lease on release.
    #[serde(default = "default_true")]
    pub release: bool,
}

/// Exporter status polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSection {
    /// Poll interval while at least one caller is waiting for a status.
    #[serde(default = "default_critical_poll_ms")]
    pub critical_poll_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub default_poll_ms: u64,
    /// Poll interval while idle in `LEASE_READY`.
    #[serde(default = "default_slow_poll_ms")]
    pub slow_poll_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Consecutive timeouts after which the connection is presumed lost.
    #[serde(default = "default_timeout_streak_threshold")]
    pub timeout_streak_threshold: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_namespace() -> String {
    "default".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_lease_duration_secs() -> u64 {
    30 * 60
}
fn default_acquire_timeout_secs() -> u64 {
    300
}
fn default_acquire_poll_ms() -> u64 {
    1000
}
fn default_refresh_interval_secs() -> u64 {
    5
}
fn default_ending_threshold_secs() -> u64 {
    5 * 60
}
fn default_retry_initial_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_critical_poll_ms() -> u64 {
    100
}
fn default_poll_ms() -> u64 {
    300
}
fn default_slow_poll_ms() -> u64 {
    5000
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_timeout_streak_threshold() -> u32 {
    20
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            name: String::new(),
            endpoint: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            selector: None,
            duration_secs: default_lease_duration_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            acquire_poll_ms: default_acquire_poll_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            ending_threshold_secs: default_ending_threshold_secs(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_retry_multiplier(),
            release: default_true(),
        }
    }
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            critical_poll_ms: default_critical_poll_ms(),
            default_poll_ms: default_poll_ms(),
            slow_poll_ms: default_slow_poll_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            timeout_streak_threshold: default_timeout_streak_threshold(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl ClientConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed and
    /// [`ConfigError::Invalid`] if a value fails [`ClientConfig::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values the lease and status loops depend on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lease = &self.lease;
        let status = &self.status;
        let positive = [
            ("lease.duration_secs", lease.duration_secs),
            ("lease.acquire_poll_ms", lease.acquire_poll_ms),
            ("lease.refresh_interval_secs", lease.refresh_interval_secs),
            ("lease.retry_initial_ms", lease.retry_initial_ms),
            ("lease.retry_max_ms", lease.retry_max_ms),
            ("status.critical_poll_ms", status.critical_poll_ms),
            ("status.default_poll_ms", status.default_poll_ms),
            ("status.slow_poll_ms", status.slow_poll_ms),
            ("status.rpc_timeout_ms", status.rpc_timeout_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(*field, "must be greater than zero"));
        }
        if lease.retry_initial_ms > lease.retry_max_ms {
            return Err(invalid(
                "lease.retry_initial_ms",
                "must not exceed lease.retry_max_ms",
            ));
        }
        if !lease.retry_multiplier.is_finite() || lease.retry_multiplier < 1.0 {
            return Err(invalid(
                "lease.retry_multiplier",
                format!("must be a finite number >= 1, got {}", lease.retry_multiplier),
            ));
        }
        if status.timeout_streak_threshold == 0 {
            return Err(invalid("status.timeout_streak_threshold", "must be at least 1"));
        }
        Ok(())
    }

    /// Runtime settings for a [`crate::application::lease::LeaseManager`].
    pub fn lease_config(&self) -> LeaseConfig {
        let lease = &self.lease;
        LeaseConfig {
            namespace: self.client.namespace.clone(),
            acquire_timeout: Some(Duration::from_secs(lease.acquire_timeout_secs)),
            acquire_poll_interval: Duration::from_millis(lease.acquire_poll_ms),
            refresh_interval: Duration::from_secs(lease.refresh_interval_secs),
            ending_threshold: Duration::from_secs(lease.ending_threshold_secs),
            retry_initial: Duration::from_millis(lease.retry_initial_ms),
            retry_max: Duration::from_millis(lease.retry_max_ms),
            retry_multiplier: lease.retry_multiplier,
            release: lease.release,
        }
    }

    /// Runtime settings for a [`crate::application::status_monitor::StatusMonitor`].
    pub fn status_monitor_config(&self) -> StatusMonitorConfig {
        let status = &self.status;
        StatusMonitorConfig {
            critical_interval: Duration::from_millis(status.critical_poll_ms),
            default_interval: Duration::from_millis(status.default_poll_ms),
            slow_interval: Duration::from_millis(status.slow_poll_ms),
            rpc_timeout: Duration::from_millis(status.rpc_timeout_ms),
            timeout_streak_threshold: status.timeout_streak_threshold,
        }
    }

    /// Default lease duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease.duration_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads a [`ClientConfig`] from `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] for values the client cannot run with.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => ClientConfig::from_toml_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ClientConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
