//! Contracts implemented by location and geocoder plugins.
//!
//! Plugins are plain synchronous objects. The bridge runs each one on its own
//! worker thread, so a plugin method may block without affecting other plugins.

use crate::error::PluginResult;
use locfuse_core::types::{Address, GeocodeRequest, Position, ReverseGeocodeRequest};
use serde::{Deserialize, Serialize};

/// Human-readable metadata and activity handles published by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: Option<String>,
    pub description: Option<String>,
    pub settings_activity: Option<String>,
    pub about_activity: Option<String>,
    pub init_activity: Option<String>,
}

impl PluginDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Operations shared by every plugin kind.
pub trait Plugin: Send {
    /// Releases the plugin's resources. Only called after a successful open.
    fn close(&mut self) -> PluginResult<()>;

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::default()
    }
}

/// A plugin producing position fixes.
pub trait LocationPlugin: Plugin {
    /// Starts the plugin. The reporter may be kept to push fixes at any time.
    fn open(&mut self, reporter: PositionReporter) -> PluginResult<()>;

    /// Returns the plugin's current fix, if it has one.
    fn update(&mut self) -> PluginResult<Option<Position>>;
}

/// A plugin performing forward and reverse geocoding.
pub trait GeocoderPlugin: Plugin {
    fn open(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn forward(&mut self, request: &GeocodeRequest) -> PluginResult<Vec<Address>>;

    fn reverse(&mut self, request: &ReverseGeocodeRequest) -> PluginResult<Vec<Address>>;
}

/// Handle given to a location plugin for pushing fixes asynchronously.
#[derive(Debug, Clone)]
pub struct PositionReporter {
    sender: flume::Sender<Position>,
}

impl PositionReporter {
    /// Creates a reporter and the receiving end of its channel.
    pub fn channel() -> (Self, flume::Receiver<Position>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }

    /// Pushes a fix. Returns false once the connection that issued this
    /// reporter has gone away.
    pub fn report(&self, position: Position) -> bool {
        self.sender.send(position).is_ok()
    }
}
