use thiserror::Error;

/// Plugin system error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin {0} is not installed")]
    Unavailable(String),

    #[error("Signature digest mismatch for {address}: expected {expected}, found {found}")]
    SignatureMismatch {
        address: String,
        expected: String,
        found: String,
    },

    #[error("Binding {address} failed: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("Plugin {0} disconnected")]
    Disconnected(String),

    #[error("Plugin call {operation} on {plugin} timed out after {timeout_ms}ms")]
    Timeout {
        plugin: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Plugin {0} is closed")]
    Closed(String),

    #[error("Plugin error: {0}")]
    Remote(String),

    #[error("Failed to spawn plugin worker: {0}")]
    ThreadSpawn(String),
}

impl PluginError {
    /// Creates an error raised by the plugin itself.
    pub fn remote(reason: impl Into<String>) -> Self {
        Self::Remote(reason.into())
    }

    /// Creates a bind failure.
    pub fn bind_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the plugin can no longer be talked to, so a graceful
    /// close would only wait for another failure.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            PluginError::Disconnected(_) | PluginError::Closed(_) | PluginError::Timeout { .. }
        )
    }

    /// Returns true if the plugin was refused before any connection attempt.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            PluginError::Unavailable(_) | PluginError::SignatureMismatch { .. }
        )
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
