//! Logging support built on `tracing`.
//!
//! The crate itself only emits `tracing` events:
//!
//! - `trace!` for composed-operation phase transitions and reactor turns
//! - `debug!` for connection and echo-server events
//! - `warn!` for handler protocol violations
//!
//! [`init`] installs a `tracing-subscriber` formatter for binaries and
//! benchmarks; tests call [`init_test_logging`].

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Log level for safer-compose output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,
    /// Debug-level logging
    Debug = 1,
    /// Info-level logging
    Info = 2,
    /// Warning-level logging
    Warn = 3,
    /// Error-level logging
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        LevelFilter::from_level(level.into())
    }
}

/// Build the filter for `config`, falling back to the configured level when
/// the explicit directives do not parse. The parse error is returned so that
/// it can be reported once a subscriber is listening.
fn build_filter(config: &LoggingConfig) -> (EnvFilter, Option<ParseError>) {
    let fallback = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from(config.level).into())
            .parse_lossy("")
    };

    match config.env_filter.as_deref() {
        Some(directives) => match EnvFilter::try_new(directives) {
            Ok(filter) => (filter, None),
            Err(err) => (fallback(), Some(err)),
        },
        None => (fallback(), None),
    }
}

/// Install a global formatter according to `config`.
///
/// Does nothing when logging is disabled or when another subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }

    let (filter, rejected) = build_filter(config);
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .try_init();

    if result.is_err() {
        tracing::debug!("global subscriber already installed; keeping it");
    }
    if let Some(err) = rejected {
        tracing::warn!(
            directives = config.env_filter.as_deref().unwrap_or_default(),
            %err,
            level = %config.level,
            "invalid log filter ignored; using the configured level"
        );
    }
}

/// Install a subscriber that writes through the test harness's capture.
///
/// Safe to call from every test; only the first call has an effect. The
/// filter is taken from `RUST_LOG`, defaulting to `warn`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Trace.to_string(), "TRACE");
    }

    #[test]
    fn test_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
    }

    #[test]
    fn test_filter_prefers_explicit_directives() {
        let config = LoggingConfig {
            enabled: true,
            level: LogLevel::Error,
            env_filter: Some("safer_compose=trace".into()),
            ..Default::default()
        };
        let (filter, rejected) = build_filter(&config);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
        assert!(rejected.is_none());
    }

    #[test]
    fn test_invalid_directives_fall_back_to_level() {
        let config = LoggingConfig {
            enabled: true,
            level: LogLevel::Warn,
            env_filter: Some("safer_compose=loud".into()),
            ..Default::default()
        };
        let (filter, rejected) = build_filter(&config);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
        assert!(rejected.is_some());
    }

    #[test]
    fn test_init_with_invalid_directives_does_not_panic() {
        let config = LoggingConfig {
            enabled: true,
            env_filter: Some("safer_compose=loud".into()),
            ..Default::default()
        };
        init(&config);
    }

    #[test]
    fn test_disabled_init_is_noop() {
        init(&LoggingConfig::default());
        init_test_logging();
        init_test_logging();
    }
}
