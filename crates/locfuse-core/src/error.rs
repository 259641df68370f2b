//! Error types for the locfuse location broker.
//!
//! Failures local to one plugin or one request are contained by the engines
//! and never surface here. What remains are configuration and preference
//! store failures, which callers see through the service's own error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using LocfuseError as the error type.
pub type Result<T> = std::result::Result<T, LocfuseError>;

/// Top-level error type for all locfuse operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum LocfuseError {
    /// Configuration and preference store errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl LocfuseError {
    /// Returns true if the error was caused by a bad value rather than by
    /// the file system.
    pub fn is_invalid_input(&self) -> bool {
        match self {
            LocfuseError::Config(e) => matches!(
                e,
                ConfigError::InvalidFormat { .. }
                    | ConfigError::InvalidValue { .. }
                    | ConfigError::ValidationFailed { .. }
            ),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Failed to write configuration
    #[error("Failed to save configuration to {path}: {reason}")]
    SaveFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a validation failed error.
    pub fn validation_failed(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}
