//! Service Root
//!
//! [`LocationService`] is the caller-facing entry point. It wires the two
//! fusion engines, the interval scheduler and the session registry together
//! and checks every caller against the [`Authorizer`].
//!
//! ```text
//!   callers ──► LocationService ──► SessionRegistry ──► plan_interval ──► IntervalScheduler
//!                    │                    ▲                                      │ poll()
//!                    │                    │ deliver                              ▼
//!                    │              delivery task ◄──── output channel ◄── LocationFuser
//!                    └──► GeocodeFuser
//! ```

use crate::auth::{Authorizer, Permission};
use crate::client::SyncClient;
use crate::error::{ApiError, ApiResult};
use crate::listener::LocationListener;
use crate::request::{LocationRequest, RequestStatus};
use crate::session::{Registration, SessionRegistry};
use locfuse_core::config::{AppConfig, ServiceConfig};
use locfuse_core::preferences::BackendStore;
use locfuse_core::types::{
    now_millis, Address, BackendKind, CallerIdentity, GeocodeRequest, PluginAddress, Position,
    ReverseGeocodeRequest,
};
use locfuse_plugin_api::{PluginResolver, PluginTransport};
use locfuse_pool::{
    plan_interval, BackendStatus, ConnectionContext, DeliveryMetrics, EngineStatus,
    FusionMetrics, FusionSnapshot, GeocodeFuser, IntervalScheduler, LocationFuser, PollTarget,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators the service is built from.
#[derive(Clone)]
pub struct ServiceDeps {
    pub store: Arc<dyn BackendStore>,
    pub resolver: Arc<dyn PluginResolver>,
    pub transport: Arc<dyn PluginTransport>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Serializable snapshot of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub interval_ms: Option<u64>,
    pub sessions: usize,
    pub requests: Vec<RequestStatus>,
    pub location: EngineStatus,
    pub geocoders: Vec<BackendStatus>,
    pub fusion: FusionSnapshot,
    pub deliveries: u64,
    pub last_location: Option<Position>,
}

struct Inner {
    deps: ServiceDeps,
    config: ServiceConfig,
    location: Arc<LocationFuser>,
    geocode: GeocodeFuser,
    scheduler: IntervalScheduler,
    registry: SessionRegistry,
    fusion_metrics: Arc<FusionMetrics>,
    delivery_metrics: DeliveryMetrics,
    shutdown: CancellationToken,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn require(&self, caller: &CallerIdentity, permission: Permission) -> ApiResult<()> {
        if self.deps.authorizer.check(caller, permission) {
            Ok(())
        } else {
            warn!(caller = %caller, permission = %permission, "Permission denied");
            Err(ApiError::PermissionDenied { permission })
        }
    }

    fn ensure_running(&self) -> ApiResult<()> {
        if self.shutdown.is_cancelled() {
            Err(ApiError::Unavailable("service is shut down".to_string()))
        } else {
            Ok(())
        }
    }

    /// Recomputes the coalesced interval from the live requests.
    fn reschedule(&self) {
        let plan = plan_interval(self.registry.demands(), self.config.min_interval());
        if self.scheduler.apply(plan) {
            debug!(interval = ?plan.interval, "Schedule updated");
        }
    }

    fn deliver(&self, position: &Position) {
        let report = self.registry.deliver(
            position,
            self.deps.authorizer.as_ref(),
            &self.delivery_metrics,
        );
        debug!(
            delivered = report.delivered,
            removed = report.removed(),
            "Fused location delivered"
        );
        if report.removed() > 0 {
            self.reschedule();
        }
    }

    async fn reload_location(&self) {
        self.location.reset(self.deps.store.as_ref()).await;
        self.location.bind().await;
    }

    async fn reload_geocode(&self) {
        self.geocode.reset(self.deps.store.as_ref()).await;
        self.geocode.bind().await;
    }
}

/// Handle to a running location service. Cheap to clone.
#[derive(Clone)]
pub struct LocationService {
    inner: Arc<Inner>,
}

impl LocationService {
    /// Builds the engines from the store, binds every backend, starts
    /// delivery and runs a first fusion cycle.
    pub async fn start(deps: ServiceDeps, config: &AppConfig) -> locfuse_core::Result<Self> {
        config.validate()?;

        let fusion_metrics = Arc::new(FusionMetrics::new());
        let context = ConnectionContext {
            resolver: Arc::clone(&deps.resolver),
            transport: Arc::clone(&deps.transport),
            call_timeout: config.bridge.call_timeout(),
            bind_timeout: config.bridge.bind_timeout(),
            metrics: Arc::clone(&fusion_metrics),
        };

        let (output, fused) = flume::bounded(config.service.output_channel_capacity);
        let location = LocationFuser::new(
            context.clone(),
            config.service.freshness_window_ms,
            output,
        );
        let poll_target: Arc<dyn PollTarget> = location.clone();

        let inner = Arc::new(Inner {
            deps,
            config: config.service.clone(),
            location: Arc::clone(&location),
            geocode: GeocodeFuser::new(context),
            scheduler: IntervalScheduler::new(poll_target),
            registry: SessionRegistry::new(),
            fusion_metrics,
            delivery_metrics: DeliveryMetrics::new(),
            shutdown: CancellationToken::new(),
            delivery_task: Mutex::new(None),
        });

        inner.reload_location().await;
        inner.reload_geocode().await;

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let shutdown = inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = fused.recv_async() => {
                        let Ok(position) = received else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.deliver(&position);
                    }
                }
            }
            debug!("Delivery task stopped");
        });
        *inner.delivery_task.lock() = Some(task);

        inner.location.update().await;

        info!(
            location_backends = inner.location.backends().len(),
            geocoder_backends = inner.geocode.backends().len(),
            "Location service started"
        );
        Ok(Self { inner })
    }

    /// Last fused location delivered by the service.
    pub async fn get_last_location(&self, caller: &CallerIdentity) -> ApiResult<Option<Position>> {
        self.inner.require(caller, Permission::CoarseLocation)?;
        Ok(self.inner.registry.last_location())
    }

    /// Last fix of one backend, matched by address.
    pub async fn get_last_location_for_backend(
        &self,
        caller: &CallerIdentity,
        package: &str,
        class: &str,
        signature_digest: Option<&str>,
    ) -> ApiResult<Option<Position>> {
        self.inner.require(caller, Permission::CoarseLocation)?;
        self.inner.require(caller, Permission::ServiceAdmin)?;
        Ok(self
            .inner
            .location
            .last_location_for_backend(package, class, signature_digest))
    }

    /// Adds a request, or replaces the caller's request with the same id.
    pub async fn update_location_request(
        &self,
        caller: &CallerIdentity,
        request: LocationRequest,
    ) -> ApiResult<Registration> {
        self.inner.require(caller, Permission::CoarseLocation)?;
        self.inner.ensure_running()?;
        if request.id.trim().is_empty() {
            return Err(ApiError::invalid_args("request id must not be empty"));
        }
        if request.num_updates == 0 {
            return Err(ApiError::invalid_args("num_updates must be greater than 0"));
        }

        let id = request.id.clone();
        let registration = self.inner.registry.register(
            caller,
            request,
            Some(self.inner.config.max_location_age_ms),
            now_millis(),
        );
        info!(caller = %caller, id = %id, registration = ?registration, "Location request registered");
        self.inner.reschedule();
        Ok(registration)
    }

    /// Removes every request delivering to `listener`.
    pub async fn cancel_location_request_by_listener(
        &self,
        listener: &Arc<dyn LocationListener>,
    ) -> ApiResult<usize> {
        let removed = self.inner.registry.cancel_by_listener(listener);
        if removed > 0 {
            self.inner.reschedule();
        }
        Ok(removed)
    }

    /// Removes the caller's request with `id`.
    pub async fn cancel_location_request_by_id(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> ApiResult<bool> {
        if id.trim().is_empty() {
            return Err(ApiError::invalid_args("request id must not be empty"));
        }
        let removed = self.inner.registry.cancel_by_id(caller, id);
        if removed {
            self.inner.reschedule();
        }
        Ok(removed)
    }

    /// Runs one fusion cycle now. Returns the position it published, if any.
    pub async fn force_location_update(
        &self,
        caller: &CallerIdentity,
    ) -> ApiResult<Option<Position>> {
        self.inner.require(caller, Permission::ServiceAdmin)?;
        self.inner.ensure_running()?;
        self.inner.location.bind().await;
        Ok(self.inner.location.update().await)
    }

    pub async fn get_location_backends(&self, caller: &CallerIdentity) -> ApiResult<Vec<String>> {
        self.get_backends(caller, BackendKind::Location)
    }

    pub async fn set_location_backends(
        &self,
        caller: &CallerIdentity,
        backends: Vec<String>,
    ) -> ApiResult<()> {
        self.set_backends(caller, BackendKind::Location, backends)?;
        self.inner.reload_location().await;
        Ok(())
    }

    pub async fn get_geocoder_backends(&self, caller: &CallerIdentity) -> ApiResult<Vec<String>> {
        self.get_backends(caller, BackendKind::Geocoder)
    }

    pub async fn set_geocoder_backends(
        &self,
        caller: &CallerIdentity,
        backends: Vec<String>,
    ) -> ApiResult<()> {
        self.set_backends(caller, BackendKind::Geocoder, backends)?;
        self.inner.reload_geocode().await;
        Ok(())
    }

    fn get_backends(&self, caller: &CallerIdentity, kind: BackendKind) -> ApiResult<Vec<String>> {
        self.inner.require(caller, Permission::ServiceAdmin)?;
        Ok(self.inner.deps.store.enabled_backends(kind))
    }

    fn set_backends(
        &self,
        caller: &CallerIdentity,
        kind: BackendKind,
        backends: Vec<String>,
    ) -> ApiResult<()> {
        self.inner.require(caller, Permission::ServiceAdmin)?;
        self.inner.ensure_running()?;
        for entry in &backends {
            entry
                .parse::<PluginAddress>()
                .map_err(|e| ApiError::invalid_args(e.to_string()))?;
        }
        self.inner
            .deps
            .store
            .set_enabled_backends(kind, &backends)?;
        info!(kind = %kind, backends = backends.len(), "Backends updated");
        Ok(())
    }

    /// Rebuilds both engines from the store.
    pub async fn reload_preferences(&self, caller: &CallerIdentity) -> ApiResult<()> {
        self.inner.require(caller, Permission::ServiceAdmin)?;
        self.inner.ensure_running()?;
        self.inner.reload_location().await;
        self.inner.reload_geocode().await;
        Ok(())
    }

    pub async fn request_geocode(
        &self,
        caller: &CallerIdentity,
        request: GeocodeRequest,
    ) -> ApiResult<Vec<Address>> {
        self.inner.require(caller, Permission::Geocode)?;
        self.inner.ensure_running()?;
        if request.location_name.trim().is_empty() {
            return Err(ApiError::invalid_args("location name must not be empty"));
        }
        Ok(self.inner.geocode.forward(request).await)
    }

    pub async fn request_reverse_geocode(
        &self,
        caller: &CallerIdentity,
        request: ReverseGeocodeRequest,
    ) -> ApiResult<Vec<Address>> {
        self.inner.require(caller, Permission::Geocode)?;
        self.inner.ensure_running()?;
        let at = Position::new(request.location.latitude, request.location.longitude, 0);
        if !at.is_valid() {
            return Err(ApiError::invalid_args("coordinates out of range"));
        }
        Ok(self.inner.geocode.reverse(request).await)
    }

    /// Drops the caller's session and all of its requests.
    pub async fn disconnect(&self, caller: &CallerIdentity) -> usize {
        let removed = self.inner.registry.disconnect(caller);
        self.inner.reschedule();
        removed
    }

    /// Rebinds both engines if `package` provides a configured backend.
    /// Returns true if it did.
    pub async fn notify_package_changed(&self, package: &str) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let affected = self
            .inner
            .location
            .backends()
            .iter()
            .chain(self.inner.geocode.backends().iter())
            .any(|address| address.package() == package);
        if !affected {
            return false;
        }
        info!(package = %package, "Backend package changed, rebinding");
        self.inner.reload_location().await;
        self.inner.reload_geocode().await;
        true
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            interval_ms: self
                .inner
                .scheduler
                .current_interval()
                .map(|i| i.as_millis() as u64),
            sessions: self.inner.registry.session_count(),
            requests: self.inner.registry.requests(),
            location: self.inner.location.status(),
            geocoders: self.inner.geocode.status(),
            fusion: self.inner.fusion_metrics.snapshot(),
            deliveries: self.inner.delivery_metrics.deliveries(),
            last_location: self.inner.registry.last_location(),
        }
    }

    /// Bound applied by blocking clients of this service.
    pub fn sync_timeout(&self) -> Duration {
        self.inner.config.sync_timeout()
    }

    /// Blocking client for `caller`, running its calls on `handle`.
    pub fn sync_client(&self, caller: CallerIdentity, handle: Handle) -> SyncClient {
        SyncClient::new(self.clone(), caller, handle)
    }

    pub fn delivery_metrics(&self) -> &DeliveryMetrics {
        &self.inner.delivery_metrics
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stops scheduling and delivery and destroys both engines.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.scheduler.stop();
        if let Some(task) = self.inner.delivery_task.lock().take() {
            task.abort();
        }
        self.inner.location.destroy().await;
        self.inner.geocode.destroy().await;
        info!("Location service stopped");
    }
}
