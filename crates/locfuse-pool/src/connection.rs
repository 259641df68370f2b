//! Plugin Connection Manager
//!
//! Owns the bind/unbind lifecycle of one configured plugin address. Binding
//! resolves the address, checks the pinned signature digest, asks the
//! transport for a connection and moves the plugin onto its own bridge.
//!
//! ```text
//!   Unbound ──bind()──► Binding ──connected──► Bound ──unbind()──► Closing ──► Unbound
//!                          │
//!                          └── refused / failed ──► Unbound
//! ```
//!
//! A failing plugin call unbinds only that plugin; the next `bind()` retries.
//! Every bind bumps a generation counter and every unbind bumps it again, so
//! results from an instance that has since been unbound are discarded.

use crate::metrics::FusionMetrics;
use locfuse_core::types::{
    now_millis, Address, BackendKind, ConnectionState, GeocodeRequest, PluginAddress, Position,
    ReverseGeocodeRequest, NETWORK_PROVIDER,
};
use locfuse_plugin_api::{
    DigestAlgorithm, GeocoderPlugin, LocationBridge, LocationPlugin, Plugin,
    PluginBridge, PluginDescriptor, PluginError, PluginResolver, PluginResult, PluginTransport,
    PositionReporter, ResolvedComponent,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Collaborators and bounds shared by every connection of an engine.
#[derive(Clone)]
pub struct ConnectionContext {
    pub resolver: Arc<dyn PluginResolver>,
    pub transport: Arc<dyn PluginTransport>,
    pub call_timeout: Duration,
    pub bind_timeout: Duration,
    pub metrics: Arc<FusionMetrics>,
}

/// Serializable view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub kind: BackendKind,
    pub state: ConnectionState,
    pub bind_attempts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Position>,
}

/// Resolves `address` and checks its pinned signature digest, if any.
pub fn verify_binding(
    resolver: &dyn PluginResolver,
    address: &PluginAddress,
    kind: BackendKind,
) -> PluginResult<ResolvedComponent> {
    let component = resolver
        .resolve(address, kind)
        .ok_or_else(|| PluginError::Unavailable(address.component_name()))?;

    if let Some(expected) = address.signature_digest() {
        match resolver.signature_digest(address.package(), DigestAlgorithm::Sha256) {
            Some(found) if found.eq_ignore_ascii_case(expected) => {}
            found => {
                return Err(PluginError::SignatureMismatch {
                    address: address.component_name(),
                    expected: expected.to_string(),
                    found: found.unwrap_or_else(|| "<unsigned>".to_string()),
                })
            }
        }
    }

    Ok(component)
}

/// Parses configured backend entries, skipping malformed and duplicate ones.
pub fn parse_backends(entries: &[String], kind: BackendKind) -> Vec<PluginAddress> {
    let mut addresses: Vec<PluginAddress> = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.parse::<PluginAddress>() {
            Ok(address) if addresses.contains(&address) => {
                warn!(kind = %kind, entry = %entry, "Ignoring duplicate backend entry");
            }
            Ok(address) => addresses.push(address),
            Err(e) => {
                warn!(kind = %kind, entry = %entry, error = %e, "Ignoring malformed backend entry");
            }
        }
    }
    addresses
}

struct Slot<P: ?Sized + Plugin + 'static> {
    bridge: Option<Arc<PluginBridge<P>>>,
    component: Option<ResolvedComponent>,
    listener: Option<JoinHandle<()>>,
}

impl<P: ?Sized + Plugin + 'static> Slot<P> {
    fn empty() -> Self {
        Self {
            bridge: None,
            component: None,
            listener: None,
        }
    }
}

/// Bind/unbind state machine shared by both connection kinds.
struct Lifecycle<P: ?Sized + Plugin + 'static> {
    address: PluginAddress,
    kind: BackendKind,
    context: ConnectionContext,
    guard: tokio::sync::Mutex<()>,
    slot: Mutex<Slot<P>>,
    state: RwLock<ConnectionState>,
    generation: Arc<AtomicU64>,
    bind_attempts: AtomicU64,
}

impl<P: ?Sized + Plugin + 'static> Lifecycle<P> {
    fn new(address: PluginAddress, kind: BackendKind, context: ConnectionContext) -> Self {
        Self {
            address,
            kind,
            context,
            guard: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::empty()),
            state: RwLock::new(ConnectionState::Unbound),
            generation: Arc::new(AtomicU64::new(0)),
            bind_attempts: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the live bridge and the generation it belongs to.
    fn current(&self) -> Option<(Arc<PluginBridge<P>>, u64)> {
        let slot = self.slot.lock();
        slot.bridge
            .as_ref()
            .map(|bridge| (Arc::clone(bridge), self.generation()))
    }

    /// First bind step. `Ok(None)` means there is nothing to do because a
    /// connection exists or is being made. Caller holds `guard`.
    fn prepare(&self) -> PluginResult<Option<ResolvedComponent>> {
        if self.state() != ConnectionState::Unbound {
            return Ok(None);
        }
        self.set_state(ConnectionState::Binding);

        match verify_binding(self.context.resolver.as_ref(), &self.address, self.kind) {
            Ok(component) => Ok(Some(component)),
            Err(e) => {
                self.set_state(ConnectionState::Unbound);
                self.context.metrics.record_bind_refused();
                warn!(address = %self.address, kind = %self.kind, error = %e, "Refusing to bind plugin");
                Err(e)
            }
        }
    }

    /// Waits for the transport, bounded by the bind timeout.
    async fn connect<Fut>(&self, component: &ResolvedComponent, connecting: Fut) -> PluginResult<Box<P>>
    where
        Fut: Future<Output = PluginResult<Box<P>>>,
    {
        self.bind_attempts.fetch_add(1, Ordering::SeqCst);
        self.context.metrics.record_bind();

        let outcome = match tokio::time::timeout(self.context.bind_timeout, connecting).await {
            Ok(result) => result,
            Err(_) => {
                self.context.transport.unbind(component).await;
                Err(PluginError::bind_failed(
                    self.address.component_name(),
                    format!("timed out after {}ms", self.context.bind_timeout.as_millis()),
                ))
            }
        };

        if let Err(e) = &outcome {
            self.set_state(ConnectionState::Unbound);
            warn!(address = %self.address, error = %e, "Failed to bind plugin");
        }
        outcome
    }

    /// Moves the plugin onto a bridge and marks the connection bound.
    async fn install(
        &self,
        plugin: Box<P>,
        component: ResolvedComponent,
        role: &str,
    ) -> PluginResult<(Arc<PluginBridge<P>>, u64)> {
        let bridge = match PluginBridge::spawn(
            self.address.component_name(),
            role,
            plugin,
            self.context.call_timeout,
        ) {
            Ok(bridge) => Arc::new(bridge),
            Err(e) => {
                self.context.transport.unbind(&component).await;
                self.set_state(ConnectionState::Unbound);
                return Err(e);
            }
        };

        let generation = {
            let mut slot = self.slot.lock();
            slot.bridge = Some(Arc::clone(&bridge));
            slot.component = Some(component);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.set_state(ConnectionState::Bound);
        Ok((bridge, generation))
    }

    fn set_listener(&self, listener: JoinHandle<()>) {
        if let Some(previous) = self.slot.lock().listener.replace(listener) {
            previous.abort();
        }
    }

    /// Tears the connection down. Caller holds `guard`.
    async fn teardown(&self, graceful: bool) {
        let (bridge, component, listener) = {
            let mut slot = self.slot.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            (
                slot.bridge.take(),
                slot.component.take(),
                slot.listener.take(),
            )
        };
        if let Some(listener) = listener {
            listener.abort();
        }

        let Some(bridge) = bridge else {
            self.set_state(ConnectionState::Unbound);
            return;
        };

        self.set_state(ConnectionState::Closing);
        if graceful {
            if let Err(e) = bridge.close().await {
                debug!(address = %self.address, error = %e, "Plugin close failed");
            }
        } else {
            bridge.shutdown();
        }
        if let Some(component) = component {
            self.context.transport.unbind(&component).await;
        }
        self.set_state(ConnectionState::Unbound);
        info!(address = %self.address, kind = %self.kind, graceful, "Plugin unbound");
    }

    async fn unbind(&self, graceful: bool) {
        let _guard = self.guard.lock().await;
        self.teardown(graceful).await;
    }

    /// Unbinds after a failed call, unless the failing instance is already gone.
    async fn unbind_after_failure(&self, generation: u64, error: &PluginError) {
        self.context.metrics.record_plugin_failure();
        let _guard = self.guard.lock().await;
        if self.generation() != generation {
            return;
        }
        self.teardown(!error.is_connection_lost()).await;
    }

    async fn descriptor(&self) -> Option<PluginDescriptor> {
        let (bridge, _) = self.current()?;
        bridge.descriptor().await.ok()
    }
}

/// Result of polling one location plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A fix strictly newer than the previous one.
    Fresh(Position),
    /// Nothing newer, or the plugin is not bound yet.
    Unchanged,
    /// The call failed and the plugin was unbound.
    Failed,
}

impl PollOutcome {
    pub fn fresh(self) -> Option<Position> {
        match self {
            PollOutcome::Fresh(position) => Some(position),
            _ => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, PollOutcome::Fresh(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PollOutcome::Failed)
    }
}

/// Last accepted fix of one location backend.
struct LastLocation {
    component: String,
    position: RwLock<Option<Position>>,
    generation: Arc<AtomicU64>,
}

impl LastLocation {
    /// Stores `position` if it comes from the live instance and is strictly
    /// newer than the stored one. Returns the stored copy.
    fn accept(&self, mut position: Position, generation: u64) -> Option<Position> {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(component = %self.component, "Discarding fix from unbound plugin instance");
            return None;
        }

        if position.timestamp <= 0 {
            position.timestamp = now_millis();
        }
        let backend_provider = std::mem::replace(&mut position.provider, NETWORK_PROVIDER.to_string());
        position.backend_provider = Some(backend_provider);
        position.backend_component = Some(self.component.clone());
        position.alternates.clear();

        let mut last = self.position.write();
        if !position.is_newer_than(last.as_ref()) {
            return None;
        }
        *last = Some(position.clone());
        Some(position)
    }

    fn get(&self) -> Option<Position> {
        self.position.read().clone()
    }
}

fn spawn_report_listener(
    last: Arc<LastLocation>,
    reports: flume::Receiver<Position>,
    generation: u64,
    notify: Option<flume::Sender<()>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(position) = reports.recv_async().await {
            if last.accept(position, generation).is_some() {
                if let Some(notify) = &notify {
                    let _ = notify.try_send(());
                }
            }
        }
    })
}

/// Connection manager for one location plugin.
pub struct LocationConnection {
    lifecycle: Lifecycle<dyn LocationPlugin>,
    last: Arc<LastLocation>,
    update_waiting: AtomicBool,
    notify: Option<flume::Sender<()>>,
}

impl LocationConnection {
    /// Creates an unbound connection. Accepted pushed fixes signal `notify`.
    pub fn new(
        address: PluginAddress,
        context: ConnectionContext,
        notify: Option<flume::Sender<()>>,
    ) -> Self {
        let lifecycle = Lifecycle::new(address, BackendKind::Location, context);
        let last = Arc::new(LastLocation {
            component: lifecycle.address.component_name(),
            position: RwLock::new(None),
            generation: Arc::clone(&lifecycle.generation),
        });
        Self {
            lifecycle,
            last,
            update_waiting: AtomicBool::new(false),
            notify,
        }
    }

    pub fn address(&self) -> &PluginAddress {
        &self.lifecycle.address
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Number of times the transport was asked to bind.
    pub fn bind_attempts(&self) -> u64 {
        self.lifecycle.bind_attempts.load(Ordering::SeqCst)
    }

    pub fn last_location(&self) -> Option<Position> {
        self.last.get()
    }

    /// Binds and opens the plugin. A no-op unless currently unbound.
    pub async fn bind(&self) -> PluginResult<()> {
        let lifecycle = &self.lifecycle;
        let _guard = lifecycle.guard.lock().await;

        let Some(component) = lifecycle.prepare()? else {
            return Ok(());
        };
        let plugin = lifecycle
            .connect(&component, lifecycle.context.transport.bind_location(&component))
            .await?;
        let (bridge, generation) = lifecycle
            .install(plugin, component, "location-backend")
            .await?;

        let (reporter, reports) = PositionReporter::channel();
        lifecycle.set_listener(spawn_report_listener(
            Arc::clone(&self.last),
            reports,
            generation,
            self.notify.clone(),
        ));

        if let Err(e) = bridge.open(reporter).await {
            warn!(address = %lifecycle.address, error = %e, "Failed to open location plugin");
            lifecycle.context.metrics.record_plugin_failure();
            lifecycle.teardown(!e.is_connection_lost()).await;
            return Err(e);
        }
        info!(address = %lifecycle.address, "Location plugin bound");

        if self.update_waiting.swap(false, Ordering::SeqCst) {
            match self.poll(&bridge, generation).await {
                Ok(Some(_)) => {
                    if let Some(notify) = &self.notify {
                        let _ = notify.try_send(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(address = %lifecycle.address, error = %e, "Deferred update failed, unbinding");
                    lifecycle.context.metrics.record_plugin_failure();
                    lifecycle.teardown(!e.is_connection_lost()).await;
                }
            }
        }
        Ok(())
    }

    /// Polls the plugin. A fix is fresh only if it is strictly newer than
    /// the previous one. While unbound, remembers that an update is wanted.
    pub async fn update(&self) -> PollOutcome {
        let Some((bridge, generation)) = self.lifecycle.current() else {
            self.update_waiting.store(true, Ordering::SeqCst);
            return PollOutcome::Unchanged;
        };

        match self.poll(&bridge, generation).await {
            Ok(Some(position)) => PollOutcome::Fresh(position),
            Ok(None) => PollOutcome::Unchanged,
            Err(e) => {
                warn!(address = %self.lifecycle.address, error = %e, "Location plugin update failed, unbinding");
                self.lifecycle.unbind_after_failure(generation, &e).await;
                PollOutcome::Failed
            }
        }
    }

    async fn poll(&self, bridge: &LocationBridge, generation: u64) -> PluginResult<Option<Position>> {
        let position = bridge.update().await?;
        Ok(position.and_then(|p| self.last.accept(p, generation)))
    }

    /// Closes the plugin (if opened) and disconnects.
    pub async fn unbind(&self) {
        self.lifecycle.unbind(true).await;
    }

    /// Disconnects without closing the plugin.
    pub async fn unbind_now(&self) {
        self.lifecycle.unbind(false).await;
    }

    pub async fn descriptor(&self) -> Option<PluginDescriptor> {
        self.lifecycle.descriptor().await
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            address: self.lifecycle.address.to_string(),
            kind: BackendKind::Location,
            state: self.state(),
            bind_attempts: self.bind_attempts(),
            last_location: self.last_location(),
        }
    }
}

/// Connection manager for one geocoder plugin.
pub struct GeocoderConnection {
    lifecycle: Lifecycle<dyn GeocoderPlugin>,
}

impl GeocoderConnection {
    pub fn new(address: PluginAddress, context: ConnectionContext) -> Self {
        Self {
            lifecycle: Lifecycle::new(address, BackendKind::Geocoder, context),
        }
    }

    pub fn address(&self) -> &PluginAddress {
        &self.lifecycle.address
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn bind_attempts(&self) -> u64 {
        self.lifecycle.bind_attempts.load(Ordering::SeqCst)
    }

    /// Binds and opens the plugin. A no-op unless currently unbound.
    pub async fn bind(&self) -> PluginResult<()> {
        let lifecycle = &self.lifecycle;
        let _guard = lifecycle.guard.lock().await;

        let Some(component) = lifecycle.prepare()? else {
            return Ok(());
        };
        let plugin = lifecycle
            .connect(&component, lifecycle.context.transport.bind_geocoder(&component))
            .await?;
        let (bridge, _) = lifecycle
            .install(plugin, component, "geocoder-backend")
            .await?;

        if let Err(e) = bridge.open().await {
            warn!(address = %lifecycle.address, error = %e, "Failed to open geocoder plugin");
            lifecycle.context.metrics.record_plugin_failure();
            lifecycle.teardown(!e.is_connection_lost()).await;
            return Err(e);
        }
        info!(address = %lifecycle.address, "Geocoder plugin bound");
        Ok(())
    }

    /// Forward geocode. Unbound or failing plugins contribute nothing.
    pub async fn forward(&self, request: GeocodeRequest) -> Vec<Address> {
        let Some((bridge, generation)) = self.lifecycle.current() else {
            return Vec::new();
        };
        let result = bridge.forward(request).await;
        self.settle(result, generation, "forward").await
    }

    /// Reverse geocode. Unbound or failing plugins contribute nothing.
    pub async fn reverse(&self, request: ReverseGeocodeRequest) -> Vec<Address> {
        let Some((bridge, generation)) = self.lifecycle.current() else {
            return Vec::new();
        };
        let result = bridge.reverse(request).await;
        self.settle(result, generation, "reverse").await
    }

    async fn settle(
        &self,
        result: PluginResult<Vec<Address>>,
        generation: u64,
        operation: &'static str,
    ) -> Vec<Address> {
        match result {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(address = %self.lifecycle.address, operation, error = %e, "Geocoder call failed, unbinding");
                self.lifecycle.unbind_after_failure(generation, &e).await;
                Vec::new()
            }
        }
    }

    pub async fn unbind(&self) {
        self.lifecycle.unbind(true).await;
    }

    pub async fn unbind_now(&self) {
        self.lifecycle.unbind(false).await;
    }

    pub async fn descriptor(&self) -> Option<PluginDescriptor> {
        self.lifecycle.descriptor().await
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            address: self.lifecycle.address.to_string(),
            kind: BackendKind::Geocoder,
            state: self.state(),
            bind_attempts: self.bind_attempts(),
            last_location: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, FakeLocation};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_is_idempotent() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");

        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();
        connection.bind().await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Bound);
        assert_eq!(connection.bind_attempts(), 1);
        assert_eq!(transport.bind_count("pkg.a/Wifi"), 1);
        assert_eq!(fake.opens(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_signature_mismatch_refuses_bind() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.b", "Class", b"real-cert");

        let connection =
            LocationConnection::new("pkg.b/Class/deadbeef".parse().unwrap(), context.clone(), None);
        let result = connection.bind().await;

        assert!(matches!(result, Err(PluginError::SignatureMismatch { .. })));
        assert_eq!(connection.bind_attempts(), 0);
        assert_eq!(transport.bind_count("pkg.b/Class"), 0);
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert_eq!(context.metrics.snapshot().binds_refused, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_matching_signature_binds() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.b", "Class", b"real-cert");

        let digest = DigestAlgorithm::Sha256.digest(b"real-cert");
        let address: PluginAddress = format!("pkg.b/Class/{}", digest).parse().unwrap();
        let connection = LocationConnection::new(address, context, None);
        connection.bind().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Bound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unresolved_address_stays_unbound() {
        let (context, _resolver, _transport) = fixture();
        let connection = LocationConnection::new("pkg.none/Class".parse().unwrap(), context, None);

        let result = connection.bind().await;
        assert!(matches!(result, Err(PluginError::Unavailable(_))));
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert_eq!(connection.bind_attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_accepts_only_newer_fixes() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();

        fake.push_fix(Position::new(1.0, 2.0, 5000).with_accuracy(20.0).with_provider("wifi"));
        let accepted = connection.update().await.fresh().unwrap();
        assert_eq!(accepted.provider, NETWORK_PROVIDER);
        assert_eq!(accepted.backend_provider.as_deref(), Some("wifi"));
        assert_eq!(accepted.backend_component.as_deref(), Some("pkg.a/Wifi"));

        fake.push_fix(Position::new(3.0, 4.0, 5000));
        assert_eq!(connection.update().await, PollOutcome::Unchanged);
        assert_eq!(connection.last_location().unwrap().latitude, 1.0);

        fake.push_fix(Position::new(3.0, 4.0, 6000));
        assert!(connection.update().await.is_fresh());
        assert_eq!(connection.last_location().unwrap().latitude, 3.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_positive_timestamp_replaced() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();

        let before = now_millis();
        fake.push_fix(Position::new(1.0, 2.0, 0));
        let accepted = connection.update().await.fresh().unwrap();
        assert!(accepted.timestamp >= before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_failure_unbinds_and_rebinds() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();

        fake.push_failure("radio off");
        assert!(connection.update().await.is_failed());
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert_eq!(fake.closes(), 1);

        connection.bind().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Bound);
        assert_eq!(connection.bind_attempts(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_while_unbound_is_deferred() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let (notify_tx, notify_rx) = flume::bounded(1);
        let connection =
            LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, Some(notify_tx));

        fake.push_fix(Position::new(1.0, 2.0, 1000));
        assert_eq!(connection.update().await, PollOutcome::Unchanged);

        connection.bind().await.unwrap();
        assert_eq!(connection.last_location().unwrap().timestamp, 1000);
        assert!(notify_rx.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_reports_update_last_location() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let (notify_tx, notify_rx) = flume::bounded(1);
        let connection =
            LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, Some(notify_tx));
        connection.bind().await.unwrap();

        assert!(fake.report(Position::new(7.0, 8.0, 2000)));
        tokio::time::timeout(Duration::from_secs(2), notify_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.last_location().unwrap().latitude, 7.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reports_after_unbind_are_discarded() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();
        connection.unbind().await;

        fake.report(Position::new(7.0, 8.0, 2000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.last_location().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_in_flight_during_unbind_is_discarded() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection =
            Arc::new(LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None));
        connection.bind().await.unwrap();

        fake.set_delay(Duration::from_millis(300));
        fake.push_fix(Position::new(1.0, 2.0, 5000));
        let polling = Arc::clone(&connection);
        let in_flight = tokio::spawn(async move { polling.update().await });
        while fake.updates_served() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        connection.unbind().await;
        assert_eq!(in_flight.await.unwrap(), PollOutcome::Unchanged);
        assert!(connection.last_location().is_none());
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert_eq!(fake.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graceful_unbind_closes_opened_plugin() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();

        connection.unbind().await;
        assert_eq!(fake.closes(), 1);
        assert_eq!(transport.unbind_count("pkg.a/Wifi"), 1);
        assert_eq!(connection.state(), ConnectionState::Unbound);

        connection.unbind().await;
        assert_eq!(fake.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unbind_now_skips_close() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);
        connection.bind().await.unwrap();

        connection.unbind_now().await;
        assert_eq!(fake.closes(), 0);
        assert_eq!(connection.state(), ConnectionState::Unbound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failure_does_not_close() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.fail_open();
        fake.install(&resolver, &transport, "pkg.a", "Wifi", b"cert-a");
        let connection = LocationConnection::new("pkg.a/Wifi".parse().unwrap(), context, None);

        assert!(connection.bind().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert_eq!(fake.closes(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_null_binding_leaves_unbound() {
        let (context, resolver, _transport) = fixture();
        resolver.register_component("pkg.c", "Ghost", BackendKind::Location);
        let connection = LocationConnection::new("pkg.c/Ghost".parse().unwrap(), context, None);

        assert!(matches!(
            connection.bind().await,
            Err(PluginError::BindFailed { .. })
        ));
        assert_eq!(connection.bind_attempts(), 1);
        assert_eq!(connection.state(), ConnectionState::Unbound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_snapshot() {
        let (context, _resolver, _transport) = fixture();
        let connection = LocationConnection::new("pkg.a/Wifi/abc".parse().unwrap(), context, None);
        let status = connection.status();
        assert_eq!(status.address, "pkg.a/Wifi/abc");
        assert_eq!(status.state, ConnectionState::Unbound);
        assert!(status.last_location.is_none());
    }

    #[test]
    fn test_parse_backends_skips_bad_entries() {
        let entries = vec![
            "pkg.a/Wifi".to_string(),
            "not-an-address".to_string(),
            "pkg.a/Wifi/abcd".to_string(),
            "pkg.b/Cell".to_string(),
        ];
        let addresses = parse_backends(&entries, BackendKind::Location);
        let names: Vec<String> = addresses.iter().map(|a| a.component_name()).collect();
        assert_eq!(names, vec!["pkg.a/Wifi", "pkg.b/Cell"]);
    }

    #[test]
    fn test_verify_binding_unsigned_package() {
        let resolver = locfuse_plugin_api::RegistryResolver::new();
        resolver.register_component("pkg.u", "Class", BackendKind::Location);
        let address: PluginAddress = "pkg.u/Class/abc".parse().unwrap();
        let result = verify_binding(&resolver, &address, BackendKind::Location);
        assert!(matches!(result, Err(PluginError::SignatureMismatch { .. })));
    }
}
