//! Logging Infrastructure
//!
//! The runtime emits `tracing` events with structured fields (`fiber`,
//! `scope`, `worker`) and never installs a subscriber on its own. Hosts
//! that have no subscriber of their own can call [`init`].
//!
//! # Example
//!
//! ```rust
//! use skein_runtime::config::LogConfig;
//!
//! // Honors RUST_LOG when set, otherwise the configured level.
//! skein_runtime::log::init(&LogConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a `tracing-subscriber` fmt subscriber filtered by `RUST_LOG`,
/// falling back to `config.level`. Returns `false` when a global
/// subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

/// Like [`init`], writing through the test harness's captured output.
pub fn init_for_tests(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_test_writer()
        .try_init()
        .is_ok()
}

fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig { level: LogLevel::Warn };
        let first = init_for_tests(&config);
        // Whoever installed first, a second install is always refused.
        assert!(!init_for_tests(&config));
        let _ = first;
    }
}
