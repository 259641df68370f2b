//! Geocode Fusion Engine
//!
//! Fans forward and reverse lookups out to every configured geocoder and
//! concatenates the answers in configuration order. There is no ranking.

use crate::connection::{parse_backends, BackendStatus, ConnectionContext, GeocoderConnection};
use crate::location::EngineState;
use futures::future::join_all;
use locfuse_core::preferences::BackendStore;
use locfuse_core::types::{Address, BackendKind, GeocodeRequest, PluginAddress, ReverseGeocodeRequest};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub struct GeocodeFuser {
    context: ConnectionContext,
    connections: RwLock<Vec<Arc<GeocoderConnection>>>,
    state: RwLock<EngineState>,
}

impl GeocodeFuser {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            connections: RwLock::new(Vec::new()),
            state: RwLock::new(EngineState::Unconfigured),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn snapshot(&self) -> Vec<Arc<GeocoderConnection>> {
        self.connections.read().clone()
    }

    pub fn backends(&self) -> Vec<PluginAddress> {
        self.connections
            .read()
            .iter()
            .map(|c| c.address().clone())
            .collect()
    }

    pub async fn reset(&self, store: &dyn BackendStore) {
        if self.state() == EngineState::Destroyed {
            return;
        }
        let previous = std::mem::take(&mut *self.connections.write());
        join_all(previous.iter().map(|c| c.unbind())).await;

        let entries = store.enabled_backends(BackendKind::Geocoder);
        let connections: Vec<Arc<GeocoderConnection>> =
            parse_backends(&entries, BackendKind::Geocoder)
                .into_iter()
                .map(|address| Arc::new(GeocoderConnection::new(address, self.context.clone())))
                .collect();
        info!(backends = connections.len(), "Geocoder backends configured");
        *self.connections.write() = connections;
    }

    pub async fn bind(&self) {
        if self.state() == EngineState::Destroyed {
            return;
        }
        let connections = self.snapshot();
        join_all(connections.iter().map(|c| c.bind())).await;

        let mut state = self.state.write();
        if *state == EngineState::Unconfigured {
            *state = EngineState::Bound;
        }
    }

    /// Gracefully unbinds every geocoder, keeping the configuration.
    pub async fn unbind(&self) {
        let connections = self.snapshot();
        join_all(connections.iter().map(|c| c.unbind())).await;
    }

    /// Forward geocode across every configured backend. Backends unbound
    /// after an earlier failure get a bind attempt first.
    pub async fn forward(&self, request: GeocodeRequest) -> Vec<Address> {
        let connections = self.ready().await;
        let answers = join_all(connections.iter().map(|c| c.forward(request.clone()))).await;
        let addresses: Vec<Address> = answers.into_iter().flatten().collect();
        debug!(query = %request.location_name, results = addresses.len(), "Forward geocode finished");
        addresses
    }

    /// Reverse geocode across every configured backend.
    pub async fn reverse(&self, request: ReverseGeocodeRequest) -> Vec<Address> {
        let connections = self.ready().await;
        let answers = join_all(connections.iter().map(|c| c.reverse(request.clone()))).await;
        let addresses: Vec<Address> = answers.into_iter().flatten().collect();
        debug!(
            latitude = request.location.latitude,
            longitude = request.location.longitude,
            results = addresses.len(),
            "Reverse geocode finished"
        );
        addresses
    }

    async fn ready(&self) -> Vec<Arc<GeocoderConnection>> {
        if self.state() == EngineState::Destroyed {
            return Vec::new();
        }
        let connections = self.snapshot();
        join_all(connections.iter().map(|c| c.bind())).await;
        connections
    }

    pub async fn destroy(&self) {
        {
            let mut state = self.state.write();
            if *state == EngineState::Destroyed {
                return;
            }
            *state = EngineState::Destroyed;
        }
        let connections = std::mem::take(&mut *self.connections.write());
        join_all(connections.iter().map(|c| c.unbind_now())).await;
        info!("Geocode engine destroyed");
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.connections.read().iter().map(|c| c.status()).collect()
    }
}
