//! Transport used to establish plugin connections.
//!
//! The transport turns a resolved component into a live plugin object. A
//! remote transport would marshal calls across process boundaries; the
//! [`LocalTransport`] constructs plugins in-process from registered factories.

use crate::error::{PluginError, PluginResult};
use crate::plugin::{GeocoderPlugin, LocationPlugin};
use crate::resolver::ResolvedComponent;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Establishes and releases plugin connections.
///
/// A successful bind corresponds to the connected notification; refusals,
/// null bindings and dead bindings are reported as errors. Disconnects after
/// binding surface as [`PluginError::Disconnected`] from the bridge.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    async fn bind_location(
        &self,
        component: &ResolvedComponent,
    ) -> PluginResult<Box<dyn LocationPlugin>>;

    async fn bind_geocoder(
        &self,
        component: &ResolvedComponent,
    ) -> PluginResult<Box<dyn GeocoderPlugin>>;

    /// Releases whatever the transport holds for the component.
    async fn unbind(&self, component: &ResolvedComponent);
}

/// Constructs a location plugin instance.
pub type LocationFactory = Arc<dyn Fn() -> PluginResult<Box<dyn LocationPlugin>> + Send + Sync>;

/// Constructs a geocoder plugin instance.
pub type GeocoderFactory = Arc<dyn Fn() -> PluginResult<Box<dyn GeocoderPlugin>> + Send + Sync>;

/// In-process transport backed by plugin factories.
#[derive(Default)]
pub struct LocalTransport {
    location: DashMap<String, LocationFactory>,
    geocoder: DashMap<String, GeocoderFactory>,
    binds: DashMap<String, u64>,
    unbinds: DashMap<String, u64>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a location plugin under `package/class`.
    pub fn register_location<F>(&self, component: impl Into<String>, factory: F)
    where
        F: Fn() -> PluginResult<Box<dyn LocationPlugin>> + Send + Sync + 'static,
    {
        self.location.insert(component.into(), Arc::new(factory));
    }

    /// Registers a geocoder plugin under `package/class`.
    pub fn register_geocoder<F>(&self, component: impl Into<String>, factory: F)
    where
        F: Fn() -> PluginResult<Box<dyn GeocoderPlugin>> + Send + Sync + 'static,
    {
        self.geocoder.insert(component.into(), Arc::new(factory));
    }

    /// Number of bind requests that reached the transport for a component.
    pub fn bind_count(&self, component: &str) -> u64 {
        self.binds.get(component).map(|c| *c).unwrap_or(0)
    }

    /// Number of unbind requests for a component.
    pub fn unbind_count(&self, component: &str) -> u64 {
        self.unbinds.get(component).map(|c| *c).unwrap_or(0)
    }

    fn record_bind(&self, name: &str) {
        *self.binds.entry(name.to_string()).or_insert(0) += 1;
    }
}

#[async_trait]
impl PluginTransport for LocalTransport {
    async fn bind_location(
        &self,
        component: &ResolvedComponent,
    ) -> PluginResult<Box<dyn LocationPlugin>> {
        let name = component.name();
        self.record_bind(&name);
        let factory = self
            .location
            .get(&name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| PluginError::bind_failed(&name, "null binding"))?;
        let plugin = factory()?;
        info!(component = %name, "Location plugin connected");
        Ok(plugin)
    }

    async fn bind_geocoder(
        &self,
        component: &ResolvedComponent,
    ) -> PluginResult<Box<dyn GeocoderPlugin>> {
        let name = component.name();
        self.record_bind(&name);
        let factory = self
            .geocoder
            .get(&name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| PluginError::bind_failed(&name, "null binding"))?;
        let plugin = factory()?;
        info!(component = %name, "Geocoder plugin connected");
        Ok(plugin)
    }

    async fn unbind(&self, component: &ResolvedComponent) {
        let name = component.name();
        debug!(component = %name, "Plugin unbound");
        *self.unbinds.entry(name).or_insert(0) += 1;
    }
}
