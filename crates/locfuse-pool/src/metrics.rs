//! Metrics Collection
//!
//! Counters for the fusion engines and location delivery, mirrored in atomics
//! so they can be read back without a recorder installed:
//! - Fusion cycles and published fixes
//! - Plugin binds, refusals and failures
//! - Deliveries and broken listeners
//! - Prometheus export

use locfuse_core::config::MetricsConfig;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Fusion engine metrics collector
#[derive(Debug)]
pub struct FusionMetrics {
    cycles: AtomicU64,
    published: AtomicU64,
    binds: AtomicU64,
    binds_refused: AtomicU64,
    plugin_failures: AtomicU64,
}

impl FusionMetrics {
    pub fn new() -> Self {
        describe_counter!("fusion_cycles_total", "Total fusion cycles run");
        describe_counter!("fusion_published_total", "Total fused positions published");
        describe_counter!("plugin_binds_total", "Total plugin bind attempts");
        describe_counter!(
            "plugin_bind_refused_total",
            "Total binds refused by resolution or signature checks"
        );
        describe_counter!(
            "plugin_failures_total",
            "Total plugin calls that failed and caused an unbind"
        );

        Self {
            cycles: AtomicU64::new(0),
            published: AtomicU64::new(0),
            binds: AtomicU64::new(0),
            binds_refused: AtomicU64::new(0),
            plugin_failures: AtomicU64::new(0),
        }
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        counter!("fusion_cycles_total").increment(1);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        counter!("fusion_published_total").increment(1);
    }

    pub fn record_bind(&self) {
        self.binds.fetch_add(1, Ordering::Relaxed);
        counter!("plugin_binds_total").increment(1);
    }

    pub fn record_bind_refused(&self) {
        self.binds_refused.fetch_add(1, Ordering::Relaxed);
        counter!("plugin_bind_refused_total").increment(1);
    }

    pub fn record_plugin_failure(&self) {
        self.plugin_failures.fetch_add(1, Ordering::Relaxed);
        counter!("plugin_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            binds_refused: self.binds_refused.load(Ordering::Relaxed),
            plugin_failures: self.plugin_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for FusionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`FusionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionSnapshot {
    pub cycles: u64,
    pub published: u64,
    pub binds: u64,
    pub binds_refused: u64,
    pub plugin_failures: u64,
}

/// Delivery metrics collector
#[derive(Debug)]
pub struct DeliveryMetrics {
    deliveries: AtomicU64,
    listener_failures: AtomicU64,
    requests_removed: AtomicU64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "location_deliveries_total",
            "Total positions delivered to client listeners"
        );
        describe_counter!(
            "listener_failures_total",
            "Total listener invocations that failed"
        );
        describe_counter!(
            "location_requests_removed_total",
            "Total update requests removed after delivery"
        );

        Self {
            deliveries: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            requests_removed: AtomicU64::new(0),
        }
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        counter!("location_deliveries_total").increment(1);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
        counter!("listener_failures_total").increment(1);
    }

    pub fn record_requests_removed(&self, count: u64) {
        self.requests_removed.fetch_add(count, Ordering::Relaxed);
        counter!("location_requests_removed_total").increment(count);
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    pub fn requests_removed(&self) -> u64 {
        self.requests_removed.load(Ordering::Relaxed)
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder and its scrape listener.
pub struct MetricsExporter {
    config: MetricsConfig,
    installed: bool,
}

impl MetricsExporter {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            installed: false,
        }
    }

    /// Installs the exporter. Must be called from within a tokio runtime.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Metrics export disabled");
            return Ok(());
        }

        PrometheusBuilder::new()
            .with_http_listener(self.config.listen_addr)
            .install()?;
        self.installed = true;

        info!(
            listen_addr = %self.config.listen_addr,
            "Prometheus metrics exporter initialized"
        );
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}
