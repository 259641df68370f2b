//! Errors seen by callers of the location service.

use crate::auth::Permission;
use locfuse_core::error::LocfuseError;
use locfuse_core::types::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Result type for caller-facing operations
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Caller-facing error.
///
/// Permission and argument problems map onto status codes. Timeouts and an
/// unavailable service have no status code; they surface as errors of the
/// caller's own wait.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum ApiError {
    #[error("Permission denied: {permission} required")]
    PermissionDenied { permission: Permission },

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn invalid_args(reason: impl Into<String>) -> Self {
        ApiError::InvalidArgs(reason.into())
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ApiError::PermissionDenied { .. } => Some(StatusCode::PermissionError),
            ApiError::InvalidArgs(_) => Some(StatusCode::InvalidArgs),
            ApiError::Timeout { .. } | ApiError::Unavailable(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout { .. })
    }
}

impl From<LocfuseError> for ApiError {
    fn from(err: LocfuseError) -> Self {
        if err.is_invalid_input() {
            ApiError::InvalidArgs(err.to_string())
        } else {
            ApiError::Unavailable(err.to_string())
        }
    }
}

/// Raised by a listener that can no longer take deliveries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
