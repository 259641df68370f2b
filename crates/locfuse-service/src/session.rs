//! Session Registry
//!
//! One session per caller pid, each owning that caller's update requests.
//! Sessions, requests and the last fused location live behind a single lock;
//! every add, remove and delivery pass happens under it.

use crate::auth::{Authorizer, Permission};
use crate::listener::{same_listener, LocationListener};
use crate::request::{LocationRequest, RequestStatus, UpdateRequest};
use locfuse_core::types::{CallerIdentity, Position};
use locfuse_pool::{DeliveryMetrics, IntervalDemand};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Session {
    caller: CallerIdentity,
    requests: Vec<UpdateRequest>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<u32, Session>,
    last_location: Option<Position>,
}

/// How a registration was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New request added
    Added,
    /// An existing request with the same id and caller was replaced
    Adopted,
    /// Single-shot request answered from the cached fix
    ServedFromCache,
    /// The listener failed while being served from the cache
    BrokenListener,
}

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub exhausted: usize,
    pub broken: usize,
    pub unauthorized: usize,
}

impl DeliveryReport {
    pub fn removed(&self) -> usize {
        self.exhausted + self.broken + self.unauthorized
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Registry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `request` for `caller`.
    ///
    /// With `cache_max_age_ms` set, a single-shot request that does not force
    /// a fresh fix is answered right away from a cached fix younger than that.
    pub fn register(
        &self,
        caller: &CallerIdentity,
        request: LocationRequest,
        cache_max_age_ms: Option<i64>,
        now: i64,
    ) -> Registration {
        let mut guard = self.inner.lock();
        let registry = &mut *guard;

        if let (Some(max_age), Some(cached)) = (cache_max_age_ms, registry.last_location.as_ref()) {
            if request.is_single_shot() && !request.force_fresh && cached.age_millis(now) < max_age {
                let served = request.listener.on_location(cached);
                if let Some(session) = registry.sessions.get_mut(&caller.pid) {
                    session.requests.retain(|r| !r.matches(&request.id, caller.pid));
                }
                return match served {
                    Ok(()) => {
                        debug!(caller = %caller, id = %request.id, "Single-shot request served from cache");
                        Registration::ServedFromCache
                    }
                    Err(e) => {
                        warn!(caller = %caller, id = %request.id, error = %e, "Listener failed on cached fix");
                        Registration::BrokenListener
                    }
                };
            }
        }

        let session = registry
            .sessions
            .entry(caller.pid)
            .or_insert_with(|| Session {
                caller: caller.clone(),
                requests: Vec::new(),
            });
        session.caller = caller.clone();

        if let Some(existing) = session
            .requests
            .iter_mut()
            .find(|r| r.matches(&request.id, caller.pid))
        {
            existing.adopt(request);
            return Registration::Adopted;
        }
        session
            .requests
            .push(UpdateRequest::new(request, caller.clone()));
        Registration::Added
    }

    /// Removes every request delivering to `listener`.
    pub fn cancel_by_listener(&self, listener: &Arc<dyn LocationListener>) -> usize {
        let mut registry = self.inner.lock();
        let mut removed = 0;
        for session in registry.sessions.values_mut() {
            let before = session.requests.len();
            session
                .requests
                .retain(|r| !same_listener(&r.request.listener, listener));
            removed += before - session.requests.len();
        }
        removed
    }

    /// Removes the caller's request with `id`.
    pub fn cancel_by_id(&self, caller: &CallerIdentity, id: &str) -> bool {
        let mut registry = self.inner.lock();
        let Some(session) = registry.sessions.get_mut(&caller.pid) else {
            return false;
        };
        let before = session.requests.len();
        session.requests.retain(|r| !r.matches(id, caller.pid));
        session.requests.len() != before
    }

    /// Drops the caller's session. Returns the number of requests dropped.
    pub fn disconnect(&self, caller: &CallerIdentity) -> usize {
        let removed = self.inner.lock().sessions.remove(&caller.pid);
        match removed {
            Some(session) => {
                info!(caller = %session.caller, requests = session.requests.len(), "Session closed");
                session.requests.len()
            }
            None => 0,
        }
    }

    pub fn demands(&self) -> Vec<IntervalDemand> {
        self.inner
            .lock()
            .sessions
            .values()
            .flat_map(|s| s.requests.iter().map(UpdateRequest::demand))
            .collect()
    }

    /// Fans `position` out to every live request.
    ///
    /// Requests are dropped once exhausted, when their listener fails, or
    /// when their caller no longer holds the location permission.
    pub fn deliver(
        &self,
        position: &Position,
        authorizer: &dyn Authorizer,
        metrics: &DeliveryMetrics,
    ) -> DeliveryReport {
        let mut registry = self.inner.lock();
        registry.last_location = Some(position.clone());

        let mut report = DeliveryReport::default();
        for session in registry.sessions.values_mut() {
            let allowed = authorizer.check(&session.caller, Permission::CoarseLocation);
            let caller = &session.caller;
            session.requests.retain_mut(|request| {
                if request.pending() == 0 {
                    report.exhausted += 1;
                    return false;
                }
                if !allowed {
                    warn!(caller = %caller, id = %request.request.id, "Caller lost location permission, dropping request");
                    report.unauthorized += 1;
                    return false;
                }
                match request.deliver(position) {
                    Ok(()) => {
                        report.delivered += 1;
                        metrics.record_delivery();
                        if request.pending() == 0 {
                            report.exhausted += 1;
                            return false;
                        }
                        true
                    }
                    Err(e) => {
                        warn!(caller = %caller, id = %request.request.id, error = %e, "Listener broken, dropping request");
                        metrics.record_listener_failure();
                        report.broken += 1;
                        false
                    }
                }
            });
        }

        metrics.record_requests_removed(report.removed() as u64);
        report
    }

    pub fn last_location(&self) -> Option<Position> {
        self.inner.lock().last_location.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn request_count(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|s| s.requests.len())
            .sum()
    }

    pub fn requests(&self) -> Vec<RequestStatus> {
        let registry = self.inner.lock();
        let mut requests: Vec<RequestStatus> = registry
            .sessions
            .values()
            .flat_map(|s| s.requests.iter().map(UpdateRequest::status))
            .collect();
        requests.sort_by(|a, b| (a.pid, &a.id).cmp(&(b.pid, &b.id)));
        requests
    }
}
