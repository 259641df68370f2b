// locfuse Plugin API
// Plugin contracts, address resolution, transports and the async bridge

pub mod bridge;
pub mod error;
pub mod plugin;
pub mod resolver;
pub mod transport;

pub use bridge::{GeocoderBridge, LocationBridge, PluginBridge};
pub use error::{PluginError, PluginResult};
pub use plugin::{GeocoderPlugin, LocationPlugin, Plugin, PluginDescriptor, PositionReporter};
pub use resolver::{DigestAlgorithm, PluginResolver, RegistryResolver, ResolvedComponent};
pub use transport::{LocalTransport, PluginTransport};

/// Plugin API version
pub const PLUGIN_API_VERSION: &str = "0.2.0";
