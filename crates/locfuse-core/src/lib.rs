//! # locfuse Core
//!
//! Core types, error handling, and configuration for the locfuse location broker.
//!
//! This crate provides the foundational building blocks shared by every other crate:
//!
//! - **Types**: `PluginAddress`, `Position`, geocoding requests and results,
//!   `ConnectionState`, `StatusCode` and caller identity.
//! - **Errors**: error types using `thiserror` for configuration and the
//!   preference store.
//! - **Configuration**: YAML configuration with environment variable overrides
//!   and validation.
//! - **Preferences**: the store that remembers which plugins are enabled.
//!
//! ## Example
//!
//! ```
//! use locfuse_core::types::{PluginAddress, Position};
//!
//! let address: PluginAddress = "org.example.wifi/WifiBackend".parse().unwrap();
//! assert_eq!(address.package(), "org.example.wifi");
//!
//! let fix = Position::new(52.52, 13.40, 1_700_000_000_000).with_accuracy(25.0);
//! assert!(fix.is_valid());
//! ```

pub mod config;
pub mod error;
pub mod preferences;
pub mod types;

// Re-export commonly used types for convenience
pub use config::AppConfig;
pub use error::{LocfuseError, Result};
pub use preferences::{BackendStore, FileBackendStore, MemoryBackendStore};
pub use types::{
    Address, BackendKind, CallerIdentity, ConnectionState, GeocodeRequest, LatLon,
    LatLonBounds, PluginAddress, Position, ReverseGeocodeRequest, StatusCode,
};
