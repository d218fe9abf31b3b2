//! Configuration module for treesync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Marker prepended to a file name while the remote writer owns it.
pub const DEFAULT_QUARANTINE_PREFIX: &str = "__treesync__";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for treesync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub probe: ProbeConfig,
    pub writer: WriterConfig,
    pub logging: LoggingConfig,
}

/// Watcher, scanner and coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory tree to observe.
    pub root: PathBuf,
    /// Substrings that exclude a path from every producer.
    pub ignore_patterns: Vec<String>,
    /// Milliseconds between checks that the root still exists.
    pub liveness_interval_ms: u64,
    /// Milliseconds the coordinator waits for the transport to accept a record.
    pub send_timeout_ms: u64,
    /// Capacity of each producer channel.
    pub channel_capacity: usize,
}

/// Retry policy for metadata probes and directory listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

/// Remote file writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Prefix that marks a file as being written.
    pub quarantine_prefix: String,
    /// Byte used to pad a file when it grows.
    pub fill_byte: u8,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/treesync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("treesync")
            .join("config.yaml")
    }
}

impl SyncConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Treesync"),
            ignore_patterns: vec![
                "~".to_string(),
                DEFAULT_QUARANTINE_PREFIX.to_string(),
                ".tmp".to_string(),
                ".temp".to_string(),
                ".swp".to_string(),
                ".part".to_string(),
            ],
            liveness_interval_ms: 2_000,
            send_timeout_ms: 5_000,
            channel_capacity: 1024,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            quarantine_prefix: DEFAULT_QUARANTINE_PREFIX.to_string(),
            fill_byte: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.send_timeout_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if !self.sync.root.is_absolute() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("must be an absolute path: {}", self.sync.root.display()),
            });
        }
        if self.sync.ignore_patterns.iter().any(|p| p.is_empty()) {
            errors.push(ValidationError {
                field: "sync.ignore_patterns".into(),
                message: "patterns must not be empty (an empty pattern ignores everything)".into(),
            });
        }
        if self.sync.liveness_interval_ms == 0 {
            errors.push(ValidationError {
                field: "sync.liveness_interval_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.send_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "sync.send_timeout_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.channel_capacity == 0 {
            errors.push(ValidationError {
                field: "sync.channel_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- probe ---
        if self.probe.max_attempts == 0 {
            errors.push(ValidationError {
                field: "probe.max_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- writer ---
        let prefix = &self.writer.quarantine_prefix;
        if prefix.is_empty() {
            errors.push(ValidationError {
                field: "writer.quarantine_prefix".into(),
                message: "must not be empty".into(),
            });
        } else {
            if prefix.contains(std::path::MAIN_SEPARATOR) {
                errors.push(ValidationError {
                    field: "writer.quarantine_prefix".into(),
                    message: "must not contain a path separator".into(),
                });
            }
            if !self.sync.ignore_patterns.iter().any(|p| prefix.contains(p.as_str())) {
                errors.push(ValidationError {
                    field: "sync.ignore_patterns".into(),
                    message: format!("must cover the quarantine prefix '{prefix}'"),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use treesync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/Treesync"))
///     .sync_send_timeout_ms(2_000)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_ignore_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sync.ignore_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sync_liveness_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync.liveness_interval_ms = ms;
        self
    }

    pub fn sync_send_timeout_ms(mut self, ms: u64) -> Self {
        self.config.sync.send_timeout_ms = ms;
        self
    }

    pub fn sync_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.sync.channel_capacity = capacity;
        self
    }

    // --- probe ---

    pub fn probe_max_attempts(mut self, attempts: u32) -> Self {
        self.config.probe.max_attempts = attempts;
        self
    }

    pub fn probe_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.probe.retry_delay_ms = ms;
        self
    }

    // --- writer ---

    pub fn writer_quarantine_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.writer.quarantine_prefix = prefix.into();
        self
    }

    pub fn writer_fill_byte(mut self, byte: u8) -> Self {
        self.config.writer.fill_byte = byte;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
