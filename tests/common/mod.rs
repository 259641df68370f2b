//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use locfuse_core::types::{
    now_millis, Address, BackendKind, CallerIdentity, GeocodeRequest, Position,
    ReverseGeocodeRequest,
};
use locfuse_core::{AppConfig, BackendStore, MemoryBackendStore};
use locfuse_plugin_api::{
    GeocoderPlugin, LocalTransport, LocationPlugin, Plugin, PluginError, PluginResult,
    PositionReporter, RegistryResolver,
};
use locfuse_service::{AllowAll, Authorizer, LocationService, ServiceDeps};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Everything a test needs to drive a running service.
pub struct TestService {
    pub service: LocationService,
    pub resolver: Arc<RegistryResolver>,
    pub transport: Arc<LocalTransport>,
    pub store: Arc<MemoryBackendStore>,
}

/// Wiring assembled before the service starts.
pub struct TestSetup {
    pub resolver: Arc<RegistryResolver>,
    pub transport: Arc<LocalTransport>,
    pub store: Arc<MemoryBackendStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub config: AppConfig,
}

impl TestSetup {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.bridge.call_timeout_ms = 3_000;
        config.bridge.bind_timeout_ms = 3_000;
        Self {
            resolver: Arc::new(RegistryResolver::new()),
            transport: Arc::new(LocalTransport::new()),
            store: Arc::new(MemoryBackendStore::new()),
            authorizer: Arc::new(AllowAll),
            config,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn enable_location(&self, entries: &[&str]) {
        let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        self.store
            .set_enabled_backends(BackendKind::Location, &entries)
            .unwrap();
    }

    pub fn enable_geocoders(&self, entries: &[&str]) {
        let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        self.store
            .set_enabled_backends(BackendKind::Geocoder, &entries)
            .unwrap();
    }

    pub async fn start(self) -> TestService {
        let deps = ServiceDeps {
            store: self.store.clone(),
            resolver: self.resolver.clone(),
            transport: self.transport.clone(),
            authorizer: self.authorizer,
        };
        let service = LocationService::start(deps, &self.config)
            .await
            .expect("service should start");
        TestService {
            service,
            resolver: self.resolver,
            transport: self.transport,
            store: self.store,
        }
    }
}

pub fn caller(pid: u32) -> CallerIdentity {
    CallerIdentity::new(pid, 10_000 + pid, format!("com.example.client{}", pid))
}

pub fn fix(latitude: f64, longitude: f64, timestamp: i64, accuracy: Option<f64>) -> Position {
    let position = Position::new(latitude, longitude, timestamp);
    match accuracy {
        Some(a) => position.with_accuracy(a),
        None => position,
    }
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

enum Step {
    Fix(Position),
    Fail(String),
}

#[derive(Default)]
struct BackendScript {
    steps: Mutex<VecDeque<Step>>,
    live: AtomicU64,
    live_accuracy: Mutex<Option<f64>>,
    delay_ms: AtomicU64,
    reporter: Mutex<Option<PositionReporter>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    updates: AtomicUsize,
}

/// Scripted location backend. Queued steps are served first; once the queue
/// is empty a live backend answers with a fresh fix on every update.
#[derive(Clone, Default)]
pub struct MockBackend {
    script: Arc<BackendScript>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that always has a fresh fix with the given accuracy.
    pub fn live(accuracy: f64) -> Self {
        let backend = Self::default();
        backend.script.live.store(1, Ordering::SeqCst);
        *backend.script.live_accuracy.lock() = Some(accuracy);
        backend
    }

    /// Installs the backend's package, signed with `certificate`.
    pub fn install(&self, setup: &TestSetup, package: &str, class: &str, certificate: &[u8]) {
        setup
            .resolver
            .install_package(package, vec![certificate.to_vec()]);
        setup
            .resolver
            .register_component(package, class, BackendKind::Location);
        let script = Arc::clone(&self.script);
        setup
            .transport
            .register_location(format!("{}/{}", package, class), move || {
                Ok(Box::new(MockLocationPlugin {
                    script: Arc::clone(&script),
                }) as Box<dyn LocationPlugin>)
            });
    }

    pub fn queue_fix(&self, position: Position) {
        self.script.steps.lock().push_back(Step::Fix(position));
    }

    pub fn queue_failure(&self, reason: &str) {
        self.script
            .steps
            .lock()
            .push_back(Step::Fail(reason.to_string()));
    }

    /// Makes every update block the plugin thread for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.script
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn push(&self, position: Position) -> bool {
        match self.script.reporter.lock().as_ref() {
            Some(reporter) => reporter.report(position),
            None => false,
        }
    }

    pub fn opens(&self) -> usize {
        self.script.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.script.updates.load(Ordering::SeqCst)
    }
}

struct MockLocationPlugin {
    script: Arc<BackendScript>,
}

impl Plugin for MockLocationPlugin {
    fn close(&mut self) -> PluginResult<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        *self.script.reporter.lock() = None;
        Ok(())
    }
}

impl LocationPlugin for MockLocationPlugin {
    fn open(&mut self, reporter: PositionReporter) -> PluginResult<()> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        *self.script.reporter.lock() = Some(reporter);
        Ok(())
    }

    fn update(&mut self) -> PluginResult<Option<Position>> {
        self.script.updates.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if let Some(step) = self.script.steps.lock().pop_front() {
            return match step {
                Step::Fix(position) => Ok(Some(position)),
                Step::Fail(reason) => Err(PluginError::remote(reason)),
            };
        }
        if self.script.live.load(Ordering::SeqCst) == 0 {
            return Ok(None);
        }
        // Strictly increasing timestamps so every update is a newer fix.
        let previous = self.script.live.load(Ordering::SeqCst);
        let timestamp = now_millis().max(previous as i64 + 1);
        self.script.live.store(timestamp as u64, Ordering::SeqCst);
        Ok(Some(fix(
            52.52,
            13.40,
            timestamp,
            *self.script.live_accuracy.lock(),
        )))
    }
}

/// Geocoder answering every lookup with a fixed list of address lines.
pub struct MockGeocoder {
    lines: Vec<String>,
}

impl MockGeocoder {
    pub fn install(setup: &TestSetup, package: &str, class: &str, lines: &[&str]) {
        setup
            .resolver
            .install_package(package, vec![package.as_bytes().to_vec()]);
        setup
            .resolver
            .register_component(package, class, BackendKind::Geocoder);
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        setup
            .transport
            .register_geocoder(format!("{}/{}", package, class), move || {
                Ok(Box::new(MockGeocoder {
                    lines: lines.clone(),
                }) as Box<dyn GeocoderPlugin>)
            });
    }

    fn answer(&self, locale: &str) -> Vec<Address> {
        self.lines
            .iter()
            .map(|line| Address {
                address_lines: vec![line.clone()],
                locale: Some(locale.to_string()),
                ..Default::default()
            })
            .collect()
    }
}

impl Plugin for MockGeocoder {
    fn close(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

impl GeocoderPlugin for MockGeocoder {
    fn forward(&mut self, request: &GeocodeRequest) -> PluginResult<Vec<Address>> {
        Ok(self.answer(&request.locale))
    }

    fn reverse(&mut self, request: &ReverseGeocodeRequest) -> PluginResult<Vec<Address>> {
        Ok(self.answer(&request.locale))
    }
}
