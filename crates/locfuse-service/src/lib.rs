//! locfuse Service
//!
//! Caller-facing location service: sessions and update requests, permission
//! checks, delivery of fused locations and geocoding, on top of the fusion
//! engines in `locfuse-pool`.
//!
//! # Example
//!
//! ```no_run
//! use locfuse_core::{AppConfig, CallerIdentity, MemoryBackendStore};
//! use locfuse_plugin_api::{LocalTransport, RegistryResolver};
//! use locfuse_service::{AllowAll, ChannelListener, LocationRequest, LocationService, ServiceDeps};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let deps = ServiceDeps {
//!         store: Arc::new(MemoryBackendStore::with_backends(&["org.example.wifi/WifiBackend"], &[])),
//!         resolver: Arc::new(RegistryResolver::new()),
//!         transport: Arc::new(LocalTransport::new()),
//!         authorizer: Arc::new(AllowAll),
//!     };
//!     let service = LocationService::start(deps, &AppConfig::default()).await?;
//!
//!     let caller = CallerIdentity::new(4242, 10_001, "com.example.maps");
//!     let (listener, positions) = ChannelListener::channel(16);
//!     service
//!         .update_location_request(&caller, LocationRequest::periodic("maps", 5_000, listener))
//!         .await?;
//!
//!     if let Ok(position) = positions.recv_async().await {
//!         println!("{:.5}, {:.5}", position.latitude, position.longitude);
//!     }
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod listener;
pub mod request;
pub mod service;
pub mod session;

pub use auth::{AllowAll, Authorizer, Permission, StaticAuthorizer};
pub use client::SyncClient;
pub use error::{ApiError, ApiResult, ListenerError};
pub use listener::{same_listener, ChannelListener, LocationListener};
pub use request::{LocationRequest, RequestStatus};
pub use service::{LocationService, ServiceDeps, ServiceStatus};
pub use session::{DeliveryReport, Registration, SessionRegistry};
