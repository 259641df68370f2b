//! Blocking front-end for callers outside the runtime.
//!
//! Each call runs the async operation on the runtime and waits for its
//! result on a channel, bounded by `service.sync_timeout_ms`. A call that does not
//! finish in time returns [`ApiError::Timeout`]; the operation itself keeps
//! running to completion on the runtime.
//!
//! Must not be used from a runtime worker thread.

use crate::error::{ApiError, ApiResult};
use crate::listener::LocationListener;
use crate::request::LocationRequest;
use crate::service::LocationService;
use crate::session::Registration;
use locfuse_core::types::{
    Address, CallerIdentity, GeocodeRequest, Position, ReverseGeocodeRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::warn;

pub struct SyncClient {
    service: LocationService,
    caller: CallerIdentity,
    handle: Handle,
    timeout: Duration,
}

impl SyncClient {
    /// Creates a client bounded by the service's configured sync timeout.
    pub fn new(service: LocationService, caller: CallerIdentity, handle: Handle) -> Self {
        let timeout = service.sync_timeout();
        Self {
            service,
            caller,
            handle,
            timeout,
        }
    }

    /// Overrides the configured bound for this client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    fn run<T, F, Fut>(&self, operation: &'static str, call: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(LocationService, CallerIdentity) -> Fut,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let pending = call(self.service.clone(), self.caller.clone());
        self.handle.spawn(async move {
            let _ = tx.send(pending.await);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Blocking call timed out");
                Err(ApiError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(ApiError::Unavailable(format!(
                "{} was aborted",
                operation
            ))),
        }
    }

    pub fn get_last_location(&self) -> ApiResult<Option<Position>> {
        self.run("get_last_location", |service, caller| async move {
            service.get_last_location(&caller).await
        })
    }

    pub fn get_last_location_for_backend(
        &self,
        package: &str,
        class: &str,
        signature_digest: Option<&str>,
    ) -> ApiResult<Option<Position>> {
        let package = package.to_string();
        let class = class.to_string();
        let digest = signature_digest.map(str::to_string);
        self.run("get_last_location_for_backend", |service, caller| async move {
            service
                .get_last_location_for_backend(&caller, &package, &class, digest.as_deref())
                .await
        })
    }

    pub fn update_location_request(&self, request: LocationRequest) -> ApiResult<Registration> {
        self.run("update_location_request", |service, caller| async move {
            service.update_location_request(&caller, request).await
        })
    }

    pub fn cancel_location_request_by_listener(
        &self,
        listener: Arc<dyn LocationListener>,
    ) -> ApiResult<usize> {
        self.run("cancel_location_request_by_listener", |service, _caller| async move {
            service.cancel_location_request_by_listener(&listener).await
        })
    }

    pub fn cancel_location_request_by_id(&self, id: &str) -> ApiResult<bool> {
        let id = id.to_string();
        self.run("cancel_location_request_by_id", |service, caller| async move {
            service.cancel_location_request_by_id(&caller, &id).await
        })
    }

    pub fn force_location_update(&self) -> ApiResult<Option<Position>> {
        self.run("force_location_update", |service, caller| async move {
            service.force_location_update(&caller).await
        })
    }

    pub fn get_location_backends(&self) -> ApiResult<Vec<String>> {
        self.run("get_location_backends", |service, caller| async move {
            service.get_location_backends(&caller).await
        })
    }

    pub fn set_location_backends(&self, backends: Vec<String>) -> ApiResult<()> {
        self.run("set_location_backends", |service, caller| async move {
            service.set_location_backends(&caller, backends).await
        })
    }

    pub fn get_geocoder_backends(&self) -> ApiResult<Vec<String>> {
        self.run("get_geocoder_backends", |service, caller| async move {
            service.get_geocoder_backends(&caller).await
        })
    }

    pub fn set_geocoder_backends(&self, backends: Vec<String>) -> ApiResult<()> {
        self.run("set_geocoder_backends", |service, caller| async move {
            service.set_geocoder_backends(&caller, backends).await
        })
    }

    pub fn reload_preferences(&self) -> ApiResult<()> {
        self.run("reload_preferences", |service, caller| async move {
            service.reload_preferences(&caller).await
        })
    }

    pub fn request_geocode(&self, request: GeocodeRequest) -> ApiResult<Vec<Address>> {
        self.run("request_geocode", |service, caller| async move {
            service.request_geocode(&caller, request).await
        })
    }

    pub fn request_reverse_geocode(
        &self,
        request: ReverseGeocodeRequest,
    ) -> ApiResult<Vec<Address>> {
        self.run("request_reverse_geocode", |service, caller| async move {
            service.request_reverse_geocode(&caller, request).await
        })
    }
}
