//! Configuration for the reactor, the fiber driver and logging.
//!
//! Every section has a `Default` suitable for tests against a loopback peer.
//! [`Config::development`] turns on verbose logging, [`Config::testing`] adds
//! a driver deadline so that a lost completion fails a test instead of
//! hanging it.

use crate::error::{ComposeError, Result};
use crate::logging::LogLevel;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Reactor configuration
    pub reactor: ReactorConfig,
    /// Fiber driver configuration
    pub driver: DriverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Reactor configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Maximum readiness events collected per backend wait
    pub max_events: usize,
    /// Bytes requested from the socket per `recv` call
    pub read_chunk_size: usize,
    /// Default upper bound for a read-until buffer
    pub max_read_size: usize,
}

/// Fiber driver configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// How long one reactor turn may block while no fiber is runnable
    pub poll_interval: Duration,
    /// Give up once the fibers have run this long (None = no limit)
    pub deadline: Option<Duration>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Install a subscriber at all
    pub enabled: bool,
    /// Minimum log level
    pub level: LogLevel,
    /// Explicit filter directives; overrides `level` when set
    pub env_filter: Option<String>,
    /// Emit ANSI colours
    pub ansi: bool,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            read_chunk_size: 4096,
            max_read_size: 64 * 1024,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            deadline: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            env_filter: None,
            ansi: true,
            with_target: true,
        }
    }
}

impl Config {
    /// Create a configuration for development and debugging.
    ///
    /// Logs every state transition and reactor turn.
    pub fn development() -> Self {
        Self {
            reactor: ReactorConfig::default(),
            driver: DriverConfig {
                poll_interval: Duration::from_millis(5),
                deadline: None,
            },
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Trace,
                env_filter: None,
                ansi: true,
                with_target: true,
            },
        }
    }

    /// Create a configuration for tests.
    pub fn testing() -> Self {
        Self {
            reactor: ReactorConfig {
                max_events: 16,
                read_chunk_size: 512,
                max_read_size: 16 * 1024,
            },
            driver: DriverConfig {
                poll_interval: Duration::from_millis(5),
                deadline: Some(Duration::from_secs(10)),
            },
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                env_filter: None,
                ansi: false,
                with_target: false,
            },
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        self.reactor.validate()?;
        self.driver.validate()?;
        Ok(())
    }
}

impl ReactorConfig {
    /// Validate the reactor section.
    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(ComposeError::InvalidConfig(
                "max_events must be greater than 0".into(),
            ));
        }

        if self.read_chunk_size == 0 {
            return Err(ComposeError::InvalidConfig(
                "read_chunk_size must be greater than 0".into(),
            ));
        }

        if self.max_read_size == 0 {
            return Err(ComposeError::InvalidConfig(
                "max_read_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl DriverConfig {
    /// Validate the driver section.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ComposeError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }

        if let Some(deadline) = self.deadline {
            if deadline < self.poll_interval {
                return Err(ComposeError::InvalidConfig(format!(
                    "deadline {deadline:?} is shorter than poll_interval {:?}",
                    self.poll_interval
                )));
            }
        }

        Ok(())
    }
}

/// Configuration builder for fluent configuration creation.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reactor configuration.
    pub fn reactor(mut self, reactor: ReactorConfig) -> Self {
        self.config.reactor = reactor;
        self
    }

    /// Set driver configuration.
    pub fn driver(mut self, driver: DriverConfig) -> Self {
        self.config.driver = driver;
        self
    }

    /// Set logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Set the driver deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.driver.deadline = Some(deadline);
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
