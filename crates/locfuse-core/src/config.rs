//! Configuration management for the locfuse location broker.
//!
//! This module provides the configuration system, which supports:
//! - Loading from YAML files
//! - Environment variable overrides (`LOCFUSE__SECTION__FIELD`)
//! - Validation of all settings
//! - Service timing, plugin call bounds, preferences, logging and metrics

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use locfuse_core::config::AppConfig;
///
/// let config = AppConfig::from_config_builder("config/locfuse.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fusion and scheduling settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Plugin bridge bounds
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Enabled-backend store
    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Loads configuration using the `config` crate, layering `LOCFUSE__*`
    /// environment variables over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("LOCFUSE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.bridge.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// Fusion, scheduling and caller-facing timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Floor applied to every periodic request interval
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Bound on synchronous wrapper calls
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Below this delta two fixes are compared by accuracy
    #[serde(default = "default_freshness_window")]
    pub freshness_window_ms: i64,

    /// A cached fix younger than this satisfies a single-shot request
    #[serde(default = "default_max_location_age")]
    pub max_location_age_ms: i64,

    /// Capacity of the fused location channel
    #[serde(default = "default_output_capacity")]
    pub output_channel_capacity: usize,
}

fn default_min_interval() -> u64 {
    2_500
}

fn default_sync_timeout() -> u64 {
    10_000
}

fn default_freshness_window() -> i64 {
    30_000
}

fn default_max_location_age() -> i64 {
    3_600_000
}

fn default_output_capacity() -> usize {
    64
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            sync_timeout_ms: default_sync_timeout(),
            freshness_window_ms: default_freshness_window(),
            max_location_age_ms: default_max_location_age(),
            output_channel_capacity: default_output_capacity(),
        }
    }
}

impl ServiceConfig {
    /// Validates the service configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "service.min_interval_ms",
                "must be greater than 0",
            )
            .into());
        }
        if self.sync_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "service.sync_timeout_ms",
                "must be greater than 0",
            )
            .into());
        }
        if self.freshness_window_ms < 0 {
            return Err(ConfigError::invalid_value(
                "service.freshness_window_ms",
                "cannot be negative",
            )
            .into());
        }
        if self.output_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "service.output_channel_capacity",
                "must be greater than 0",
            )
            .into());
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Bounds on plugin interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bound on every call into a bound plugin
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Bound on establishing a plugin connection
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_ms: u64,
}

fn default_call_timeout() -> u64 {
    5_000
}

fn default_bind_timeout() -> u64 {
    10_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            bind_timeout_ms: default_bind_timeout(),
        }
    }
}

impl BridgeConfig {
    /// Validates the bridge configuration.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout_ms == 0 || self.bind_timeout_ms == 0 {
            return Err(ConfigError::validation_failed(
                "bridge timeouts must be greater than 0",
            )
            .into());
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

/// Where the enabled-backend lists are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// YAML file holding the lists; kept in memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Whether to include file/line info
    #[serde(default)]
    pub file_line: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file_line: false,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default)]
    pub enabled: bool,

    /// Scrape endpoint address
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: SocketAddr,
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9464))
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}
