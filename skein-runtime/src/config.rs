//! Runtime Configuration
//!
//! Configuration for a [`Runtime`](crate::Runtime), set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SKEIN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SKEIN_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SKEIN_OPS_BEFORE_YIELD` | Evaluation steps before a fiber yields | 2048 |
//! | `SKEIN_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `SKEIN_IDLE_PARK_MS` | Longest an idle worker parks before re-polling | 10 |
//! | `SKEIN_SHUTDOWN_TIMEOUT_MS` | Graceful shutdown timeout in milliseconds | 5000 |
//! | `SKEIN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use skein_runtime::config::{LogLevel, RuntimeConfig};
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//! assert!(config.scheduler.num_workers >= 1);
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .log_level(LogLevel::Debug)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scheduler.num_workers, 4);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation, usable as an `EnvFilter`
    /// directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Evaluation steps a fiber may take before it yields to the global
    /// queue, when cooperative yielding is enabled.
    /// Default: 2048.
    pub ops_before_yield: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,

    /// Longest an idle worker parks before polling the queues again.
    /// Default: 10ms.
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            ops_before_yield: 2048,
            work_stealing: true,
            idle_park: Duration::from_millis(10),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// How long `shutdown` waits for workers to drain.
    /// Default: 5 seconds.
    pub shutdown_timeout: Duration,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            log: LogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set use default values, and so
    /// do invalid ones. Use [`RuntimeConfig::try_from_env`] to have them
    /// reported instead.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("SKEIN_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("SKEIN_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.scheduler.ops_before_yield = val;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("SKEIN_IDLE_PARK_MS") {
            if val > 0 {
                config.scheduler.idle_park = Duration::from_millis(val as u64);
            }
        }

        if let Some(val) = parse_env_usize("SKEIN_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = Duration::from_millis(val as u64);
        }

        if let Ok(val) = env::var("SKEIN_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Load configuration from environment variables, failing on the first
    /// variable that is set but cannot be parsed, then validate it.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = require_env("SKEIN_NUM_WORKERS", |s| s.parse().ok())? {
            config.scheduler.num_workers = val;
        }
        if let Some(val) = require_env("SKEIN_OPS_BEFORE_YIELD", |s| s.parse().ok())? {
            config.scheduler.ops_before_yield = val;
        }
        if let Some(val) = require_env("SKEIN_WORK_STEALING", parse_bool)? {
            config.scheduler.work_stealing = val;
        }
        if let Some(val) = require_env("SKEIN_IDLE_PARK_MS", |s| s.parse().ok())? {
            config.scheduler.idle_park = Duration::from_millis(val);
        }
        if let Some(val) = require_env("SKEIN_SHUTDOWN_TIMEOUT_MS", |s| s.parse().ok())? {
            config.shutdown_timeout = Duration::from_millis(val);
        }
        if let Some(val) = require_env("SKEIN_LOG_LEVEL", LogLevel::from_str)? {
            config.log.level = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.idle_park.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.idle_park".into(),
                message: "must be non-zero".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the evaluation budget per scheduling slice.
    pub fn ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.ops_before_yield = ops;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set how long an idle worker parks between polls.
    pub fn idle_park(mut self, park: Duration) -> Self {
        self.config.scheduler.idle_park = park;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read `name` if set, reporting a value `parse` rejects.
fn require_env<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(raw.trim()).map(Some).ok_or_else(|| ConfigError::EnvParse {
            var: name.into(),
            message: format!("unrecognized value {:?}", raw),
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::EnvParse {
            var: name.into(),
            message: "not valid unicode".into(),
        }),
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
