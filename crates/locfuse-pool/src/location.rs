//! Location Fusion Engine
//!
//! Owns one [`LocationConnection`] per enabled location backend, polls them
//! as one cycle and merges their last fixes into a single fused position.
//! Published positions go out on a bounded channel, strictly increasing in
//! timestamp.

use crate::connection::{
    parse_backends, BackendStatus, ConnectionContext, LocationConnection, PollOutcome,
};
use crate::merge::merge_positions;
use crate::scheduler::PollTarget;
use async_trait::async_trait;
use futures::future::join_all;
use locfuse_core::preferences::BackendStore;
use locfuse_core::types::{BackendKind, PluginAddress, Position};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a fusion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Unconfigured,
    Bound,
    Destroyed,
}

/// Serializable view of the location engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub last_report_time: Option<i64>,
    pub backends: Vec<BackendStatus>,
}

/// Clears the fusing flag however the cycle ends.
struct FusingGuard<'a>(&'a AtomicBool);

impl<'a> FusingGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FusingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct LocationFuser {
    context: ConnectionContext,
    freshness_window_ms: i64,
    connections: RwLock<Vec<Arc<LocationConnection>>>,
    cycle: tokio::sync::Mutex<()>,
    fusing: AtomicBool,
    last_report_time: Mutex<Option<i64>>,
    state: RwLock<EngineState>,
    output: flume::Sender<Position>,
    notify: flume::Sender<()>,
    reports: Mutex<Option<JoinHandle<()>>>,
}

impl LocationFuser {
    /// Creates an unconfigured engine publishing on `output`.
    ///
    /// Must be called from within a tokio runtime: pushed reports are handled
    /// by a task that lives as long as the engine.
    pub fn new(
        context: ConnectionContext,
        freshness_window_ms: i64,
        output: flume::Sender<Position>,
    ) -> Arc<Self> {
        let (notify, notifications) = flume::bounded(1);
        let fuser = Arc::new(Self {
            context,
            freshness_window_ms,
            connections: RwLock::new(Vec::new()),
            cycle: tokio::sync::Mutex::new(()),
            fusing: AtomicBool::new(false),
            last_report_time: Mutex::new(None),
            state: RwLock::new(EngineState::Unconfigured),
            output,
            notify,
            reports: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&fuser);
        let task = tokio::spawn(async move {
            while notifications.recv_async().await.is_ok() {
                let Some(fuser) = weak.upgrade() else {
                    break;
                };
                fuser.report_location();
            }
        });
        *fuser.reports.lock() = Some(task);
        fuser
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn is_destroyed(&self) -> bool {
        self.state() == EngineState::Destroyed
    }

    fn snapshot(&self) -> Vec<Arc<LocationConnection>> {
        self.connections.read().clone()
    }

    /// Configured backend addresses, in configuration order.
    pub fn backends(&self) -> Vec<PluginAddress> {
        self.connections
            .read()
            .iter()
            .map(|c| c.address().clone())
            .collect()
    }

    /// Replaces every connection with a fresh set built from `store`.
    pub async fn reset(&self, store: &dyn BackendStore) {
        if self.is_destroyed() {
            return;
        }
        let _cycle = self.cycle.lock().await;

        let previous = std::mem::take(&mut *self.connections.write());
        join_all(previous.iter().map(|c| c.unbind())).await;

        let entries = store.enabled_backends(BackendKind::Location);
        let connections: Vec<Arc<LocationConnection>> =
            parse_backends(&entries, BackendKind::Location)
                .into_iter()
                .map(|address| {
                    Arc::new(LocationConnection::new(
                        address,
                        self.context.clone(),
                        Some(self.notify.clone()),
                    ))
                })
                .collect();

        info!(backends = connections.len(), "Location backends configured");
        *self.connections.write() = connections;
        *self.last_report_time.lock() = None;
    }

    /// Binds every unbound connection. Bound ones are left alone.
    pub async fn bind(&self) {
        if self.is_destroyed() {
            return;
        }
        if self.cycle.try_lock().is_ok() {
            self.fusing.store(false, Ordering::SeqCst);
        }

        let connections = self.snapshot();
        let results = join_all(connections.iter().map(|c| c.bind())).await;
        let bound = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_refusal()))
            .count();
        trace!(bound, refused, total = connections.len(), "Location bind pass finished");

        let mut state = self.state.write();
        if *state == EngineState::Unconfigured {
            *state = EngineState::Bound;
        }
    }

    /// Runs one fusion cycle. Returns the position published by it, if any.
    pub async fn update(&self) -> Option<Position> {
        let _cycle = self.cycle.lock().await;
        if self.is_destroyed() {
            return None;
        }
        self.context.metrics.record_cycle();

        let connections = self.snapshot();
        let outcomes = {
            let _fusing = FusingGuard::raise(&self.fusing);
            join_all(connections.iter().map(|c| c.update())).await
        };

        if !outcomes.iter().any(PollOutcome::is_fresh) {
            trace!("No backend produced a newer fix");
            return None;
        }

        // Backends that failed this cycle keep their old fix but sit it out.
        let contributing: Vec<Arc<LocationConnection>> = connections
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| !outcome.is_failed())
            .map(|(connection, _)| Arc::clone(connection))
            .collect();
        self.fuse(&contributing)
    }

    /// Handles a pushed report. Ignored while a cycle is in flight; the fix
    /// stays with its connection and is merged by the next cycle.
    pub fn report_location(&self) -> Option<Position> {
        if self.fusing.load(Ordering::SeqCst) {
            trace!("Fusion cycle in flight, deferring pushed report");
            return None;
        }
        self.update_location()
    }

    /// Merges the connections' last fixes and publishes the result if it is
    /// newer than the last published one.
    pub fn update_location(&self) -> Option<Position> {
        if self.is_destroyed() {
            return None;
        }
        let connections = self.snapshot();
        self.fuse(&connections)
    }

    fn fuse(&self, connections: &[Arc<LocationConnection>]) -> Option<Position> {
        let positions: Vec<Position> = connections
            .iter()
            .filter_map(|c| c.last_location())
            .collect();
        let merged = merge_positions(positions, self.freshness_window_ms)?;

        {
            let mut last = self.last_report_time.lock();
            if matches!(*last, Some(reported) if merged.timestamp <= reported) {
                trace!(timestamp = merged.timestamp, "Fused fix not newer than last report");
                return None;
            }
            *last = Some(merged.timestamp);
        }

        self.context.metrics.record_published();
        debug!(
            latitude = merged.latitude,
            longitude = merged.longitude,
            accuracy = ?merged.accuracy,
            alternates = merged.alternates.len(),
            "Publishing fused location"
        );
        if let Err(e) = self.output.try_send(merged.clone()) {
            warn!(error = %e, "Fused location dropped, output channel unavailable");
        }
        Some(merged)
    }

    /// Last fix of the backend matching the given address parts.
    pub fn last_location_for_backend(
        &self,
        package: &str,
        class: &str,
        signature_digest: Option<&str>,
    ) -> Option<Position> {
        self.connections
            .read()
            .iter()
            .find(|c| c.address().matches(package, class, signature_digest))
            .and_then(|c| c.last_location())
    }

    /// Tears every connection down without closing the plugins.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.write();
            if *state == EngineState::Destroyed {
                return;
            }
            *state = EngineState::Destroyed;
        }

        if let Some(task) = self.reports.lock().take() {
            task.abort();
        }
        let connections = std::mem::take(&mut *self.connections.write());
        join_all(connections.iter().map(|c| c.unbind_now())).await;
        info!("Location engine destroyed");
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            last_report_time: *self.last_report_time.lock(),
            backends: self.connections.read().iter().map(|c| c.status()).collect(),
        }
    }
}

#[async_trait]
impl PollTarget for LocationFuser {
    async fn poll(&self) {
        self.bind().await;
        self.update().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::FUSED_PROVIDER;
    use crate::testing::{fixture, FakeLocation};
    use locfuse_core::preferences::MemoryBackendStore;
    use locfuse_core::types::ConnectionState;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_accuracy_wins_at_same_timestamp() {
        let (context, resolver, transport) = fixture();
        let coarse = FakeLocation::new();
        let fine = FakeLocation::new();
        coarse.install(&resolver, &transport, "pkg.a", "Cell", b"a");
        fine.install(&resolver, &transport, "pkg.b", "Wifi", b"b");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell", "pkg.b/Wifi"], &[]))
            .await;
        fuser.bind().await;

        coarse.push_fix(Position::new(1.0, 1.0, 5_000).with_accuracy(50.0));
        fine.push_fix(Position::new(2.0, 2.0, 5_000).with_accuracy(10.0));
        let fused = fuser.update().await.unwrap();

        assert_eq!(fused.accuracy, Some(10.0));
        assert_eq!(fused.provider, FUSED_PROVIDER);
        assert_eq!(fused.alternates.len(), 1);
        assert_eq!(fused.alternates[0].accuracy, Some(50.0));
        assert_eq!(rx.try_recv().unwrap().timestamp, 5_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_backend_is_unbound_and_rebound() {
        let (context, resolver, transport) = fixture();
        let healthy = FakeLocation::new();
        let flaky = FakeLocation::new();
        healthy.install(&resolver, &transport, "pkg.a", "Cell", b"a");
        flaky.install(&resolver, &transport, "pkg.b", "Wifi", b"b");

        let (tx, _rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell", "pkg.b/Wifi"], &[]))
            .await;
        fuser.bind().await;

        healthy.push_fix(Position::new(1.0, 1.0, 1_000).with_accuracy(30.0));
        flaky.push_failure("crashed");
        let fused = fuser.update().await.unwrap();
        assert_eq!(fused.timestamp, 1_000);

        let status = fuser.status();
        assert_eq!(status.backends[0].state, ConnectionState::Bound);
        assert_eq!(status.backends[1].state, ConnectionState::Unbound);

        healthy.push_fix(Position::new(1.0, 1.0, 2_000).with_accuracy(30.0));
        assert!(fuser.update().await.is_some());

        fuser.bind().await;
        let status = fuser.status();
        assert_eq!(status.backends[1].state, ConnectionState::Bound);
        assert_eq!(status.backends[1].bind_attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backend_failing_mid_cycle_sits_out_the_merge() {
        let (context, resolver, transport) = fixture();
        let healthy = FakeLocation::new();
        let flaky = FakeLocation::new();
        healthy.install(&resolver, &transport, "pkg.a", "Cell", b"a");
        flaky.install(&resolver, &transport, "pkg.b", "Wifi", b"b");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell", "pkg.b/Wifi"], &[]))
            .await;
        fuser.bind().await;

        healthy.push_fix(Position::new(1.0, 1.0, 1_000).with_accuracy(30.0));
        flaky.push_fix(Position::new(2.0, 2.0, 1_000).with_accuracy(5.0));
        let first = fuser.update().await.unwrap();
        assert_eq!(first.latitude, 2.0);

        healthy.push_fix(Position::new(1.5, 1.5, 2_000).with_accuracy(30.0));
        flaky.push_failure("crashed");
        let second = fuser.update().await.expect("healthy backend's newer fix is published");
        assert_eq!(second.latitude, 1.5);
        assert_eq!(second.timestamp, 2_000);
        assert!(second.alternates.is_empty());
        assert_eq!(fuser.status().backends[1].state, ConnectionState::Unbound);
        assert_eq!(rx.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publishes_only_strictly_newer() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell"], &[]))
            .await;
        fuser.bind().await;

        fake.push_fix(Position::new(1.0, 1.0, 1_000));
        assert!(fuser.update().await.is_some());
        assert!(fuser.update_location().is_none());
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_new_fix_skips_merge() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context.clone(), 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell"], &[]))
            .await;
        fuser.bind().await;

        assert!(fuser.update().await.is_none());
        assert!(rx.is_empty());
        assert_eq!(context.metrics.snapshot().cycles, 1);
        assert_eq!(fake.updates_served(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_report_is_published() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell"], &[]))
            .await;
        fuser.bind().await;

        assert!(fake.report(Position::new(3.0, 4.0, 7_000).with_accuracy(12.0)));
        let fused = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fused.timestamp, 7_000);
        assert_eq!(fused.provider, FUSED_PROVIDER);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_report_deferred_while_fusing() {
        let (context, _resolver, _transport) = fixture();
        let (tx, _rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);

        fuser.fusing.store(true, Ordering::SeqCst);
        assert!(fuser.report_location().is_none());

        fuser.bind().await;
        assert!(!fuser.fusing.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_last_location_for_backend_matches_address() {
        let (context, resolver, transport) = fixture();
        let first = FakeLocation::new();
        let second = FakeLocation::new();
        first.install(&resolver, &transport, "pkg.a", "Cell", b"a");
        second.install(&resolver, &transport, "pkg.b", "Wifi", b"b");

        let (tx, _rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell", "pkg.b/Wifi"], &[]))
            .await;
        fuser.bind().await;

        first.push_fix(Position::new(1.0, 1.0, 1_000));
        second.push_fix(Position::new(2.0, 2.0, 1_000));
        fuser.update().await;

        let found = fuser.last_location_for_backend("pkg.b", "Wifi", None).unwrap();
        assert_eq!(found.latitude, 2.0);
        let found = fuser
            .last_location_for_backend("pkg.b", "Wifi", Some("feed"))
            .unwrap();
        assert_eq!(found.latitude, 2.0);
        assert!(fuser.last_location_for_backend("pkg.c", "Gps", None).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_rebuilds_connections() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, _rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        let store = MemoryBackendStore::with_backends(&["pkg.a/Cell", "bogus"], &[]);
        fuser.reset(&store).await;
        fuser.bind().await;
        assert_eq!(fuser.backends().len(), 1);
        assert_eq!(fuser.state(), EngineState::Bound);

        fuser.reset(&MemoryBackendStore::new()).await;
        assert!(fuser.backends().is_empty());
        assert_eq!(fake.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_destroy_force_unbinds() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, _rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell"], &[]))
            .await;
        fuser.bind().await;

        fuser.destroy().await;
        assert_eq!(fuser.state(), EngineState::Destroyed);
        assert_eq!(fake.closes(), 0);
        assert_eq!(transport.unbind_count("pkg.a/Cell"), 1);
        assert!(fuser.update().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_binds_then_updates() {
        let (context, resolver, transport) = fixture();
        let fake = FakeLocation::new();
        fake.install(&resolver, &transport, "pkg.a", "Cell", b"a");

        let (tx, rx) = flume::bounded(8);
        let fuser = LocationFuser::new(context, 30_000, tx);
        fuser
            .reset(&MemoryBackendStore::with_backends(&["pkg.a/Cell"], &[]))
            .await;

        fake.push_fix(Position::new(5.0, 6.0, 3_000));
        fuser.poll().await;
        assert_eq!(rx.try_recv().unwrap().latitude, 5.0);
    }
}
