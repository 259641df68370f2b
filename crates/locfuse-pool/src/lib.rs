//! locfuse Fusion Pool
//!
//! Connection management for location and geocoder plugins, the fusion
//! engines built on top of it and the coalesced polling scheduler.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │   Interval Scheduler         │
//!                 │  (scheduler.rs)              │
//!                 │  - Coalesced interval        │
//!                 │  - Phase-kept timer          │
//!                 └──────────────┬───────────────┘
//!                                │ poll()
//!                 ┌──────────────▼───────────────┐     ┌────────────────┐
//!                 │   Location Fusion Engine     │────►│  merge.rs      │
//!                 │  (location.rs)               │     │  - Comparator  │
//!                 │  - Serialized cycles         │     │  - Alternates  │
//!                 │  - Pushed reports            │     └────────────────┘
//!                 └──────────────┬───────────────┘
//!                                │ one per backend
//!      ┌─────────────────────────┼─────────────────────────┐
//!      │                         │                         │
//!  ┌───▼──────────────┐  ┌───────▼──────────┐  ┌───────────▼──────┐
//!  │ LocationConnection│  │ LocationConnection│  │ GeocoderConnection│
//!  │ (connection.rs)  │  │                  │  │  (geocode.rs fans │
//!  │ - Signature pin  │  │                  │  │   out to these)   │
//!  │ - Generation     │  │                  │  │                   │
//!  └───┬──────────────┘  └───────┬──────────┘  └───────────┬──────┘
//!      │                         │                         │
//!      └──────────── PluginBridge worker threads ──────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use locfuse_core::preferences::MemoryBackendStore;
//! use locfuse_plugin_api::{LocalTransport, RegistryResolver};
//! use locfuse_pool::{ConnectionContext, FusionMetrics, LocationFuser};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let context = ConnectionContext {
//!         resolver: Arc::new(RegistryResolver::new()),
//!         transport: Arc::new(LocalTransport::new()),
//!         call_timeout: Duration::from_secs(5),
//!         bind_timeout: Duration::from_secs(10),
//!         metrics: Arc::new(FusionMetrics::new()),
//!     };
//!     let (tx, rx) = flume::bounded(64);
//!     let fuser = LocationFuser::new(context, 30_000, tx);
//!
//!     let store = MemoryBackendStore::with_backends(&["org.example.wifi/WifiBackend"], &[]);
//!     fuser.reset(&store).await;
//!     fuser.bind().await;
//!     fuser.update().await;
//!
//!     while let Ok(position) = rx.try_recv() {
//!         println!("{:.5}, {:.5}", position.latitude, position.longitude);
//!     }
//! }
//! ```

pub mod connection;
pub mod geocode;
pub mod location;
pub mod merge;
pub mod metrics;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use connection::{
    parse_backends, verify_binding, BackendStatus, ConnectionContext, GeocoderConnection,
    LocationConnection, PollOutcome,
};
pub use geocode::GeocodeFuser;
pub use location::{EngineState, EngineStatus, LocationFuser};
pub use merge::{compare_positions, merge_positions, FRESHNESS_WINDOW_MS, FUSED_PROVIDER};
pub use metrics::{DeliveryMetrics, FusionMetrics, FusionSnapshot, MetricsExporter};
pub use scheduler::{
    phase_delay, plan_interval, IntervalDemand, IntervalPlan, IntervalScheduler, PollTarget,
    MIN_INTERVAL,
};
