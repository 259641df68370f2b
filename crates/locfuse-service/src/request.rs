//! Location update requests.

use crate::error::ListenerError;
use crate::listener::LocationListener;
use locfuse_core::types::{CallerIdentity, Position};
use locfuse_pool::IntervalDemand;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// What a caller asks for when subscribing to locations.
#[derive(Clone)]
pub struct LocationRequest {
    /// Caller-chosen identifier, unique per caller
    pub id: String,
    /// Desired interval in milliseconds; zero or less means single shot
    pub interval_ms: i64,
    /// Number of updates wanted
    pub num_updates: u32,
    /// Skip the cached fix for single-shot requests
    pub force_fresh: bool,
    pub listener: Arc<dyn LocationListener>,
}

impl LocationRequest {
    /// Periodic request without an update limit.
    pub fn periodic(
        id: impl Into<String>,
        interval_ms: i64,
        listener: Arc<dyn LocationListener>,
    ) -> Self {
        Self {
            id: id.into(),
            interval_ms,
            num_updates: u32::MAX,
            force_fresh: false,
            listener,
        }
    }

    /// Request for exactly one update, as soon as possible.
    pub fn single(id: impl Into<String>, listener: Arc<dyn LocationListener>) -> Self {
        Self {
            id: id.into(),
            interval_ms: 0,
            num_updates: 1,
            force_fresh: false,
            listener,
        }
    }

    pub fn with_num_updates(mut self, num_updates: u32) -> Self {
        self.num_updates = num_updates;
        self
    }

    pub fn with_force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }

    pub fn is_single_shot(&self) -> bool {
        self.interval_ms <= 0 && self.num_updates == 1
    }
}

impl fmt::Debug for LocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationRequest")
            .field("id", &self.id)
            .field("interval_ms", &self.interval_ms)
            .field("num_updates", &self.num_updates)
            .field("force_fresh", &self.force_fresh)
            .finish_non_exhaustive()
    }
}

/// A registered request and its delivery progress.
#[derive(Debug)]
pub(crate) struct UpdateRequest {
    pub(crate) request: LocationRequest,
    pub(crate) caller: CallerIdentity,
    delivered: u32,
}

impl UpdateRequest {
    pub(crate) fn new(request: LocationRequest, caller: CallerIdentity) -> Self {
        Self {
            request,
            caller,
            delivered: 0,
        }
    }

    pub(crate) fn pending(&self) -> u32 {
        self.request.num_updates.saturating_sub(self.delivered)
    }

    pub(crate) fn matches(&self, id: &str, pid: u32) -> bool {
        self.request.id == id && self.caller.pid == pid
    }

    /// Replaces the request and restarts its update count.
    pub(crate) fn adopt(&mut self, request: LocationRequest) {
        self.request = request;
        self.delivered = 0;
    }

    pub(crate) fn demand(&self) -> IntervalDemand {
        IntervalDemand {
            interval_ms: self.request.interval_ms,
            pending: self.pending(),
        }
    }

    pub(crate) fn deliver(&mut self, position: &Position) -> Result<(), ListenerError> {
        self.request.listener.on_location(position)?;
        self.delivered = self.delivered.saturating_add(1);
        Ok(())
    }

    pub(crate) fn status(&self) -> RequestStatus {
        RequestStatus {
            id: self.request.id.clone(),
            pid: self.caller.pid,
            package: self.caller.package.clone(),
            interval_ms: self.request.interval_ms,
            pending: self.pending(),
        }
    }
}

/// Serializable view of one live request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub id: String,
    pub pid: u32,
    pub package: String,
    pub interval_ms: i64,
    pub pending: u32,
}
