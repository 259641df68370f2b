//! Scripted plugins shared by the unit tests of this crate.

use crate::connection::ConnectionContext;
use crate::metrics::FusionMetrics;
use locfuse_core::types::{
    Address, BackendKind, GeocodeRequest, Position, ReverseGeocodeRequest,
};
use locfuse_plugin_api::{
    GeocoderPlugin, LocalTransport, LocationPlugin, Plugin, PluginError, PluginResult,
    PositionReporter, RegistryResolver,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn fixture() -> (ConnectionContext, Arc<RegistryResolver>, Arc<LocalTransport>) {
    let resolver = Arc::new(RegistryResolver::new());
    let transport = Arc::new(LocalTransport::new());
    let context = ConnectionContext {
        resolver: resolver.clone(),
        transport: transport.clone(),
        call_timeout: Duration::from_secs(2),
        bind_timeout: Duration::from_secs(2),
        metrics: Arc::new(FusionMetrics::new()),
    };
    (context, resolver, transport)
}

#[derive(Default)]
struct LocationScript {
    updates: Mutex<VecDeque<PluginResult<Option<Position>>>>,
    reporter: Mutex<Option<PositionReporter>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    updates_served: AtomicUsize,
    fail_open: AtomicBool,
    delay_ms: AtomicU64,
}

/// Handle controlling every instance of a scripted location plugin.
#[derive(Clone, Default)]
pub struct FakeLocation {
    script: Arc<LocationScript>,
}

impl FakeLocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the package and registers the plugin with the transport.
    pub fn install(
        &self,
        resolver: &RegistryResolver,
        transport: &LocalTransport,
        package: &str,
        class: &str,
        certificate: &[u8],
    ) {
        resolver.install_package(package, vec![certificate.to_vec()]);
        resolver.register_component(package, class, BackendKind::Location);
        let script = Arc::clone(&self.script);
        transport.register_location(format!("{}/{}", package, class), move || {
            Ok(Box::new(ScriptedLocation {
                script: Arc::clone(&script),
            }) as Box<dyn LocationPlugin>)
        });
    }

    pub fn push_fix(&self, position: Position) {
        self.script.updates.lock().push_back(Ok(Some(position)));
    }

    pub fn push_failure(&self, reason: &str) {
        self.script
            .updates
            .lock()
            .push_back(Err(PluginError::remote(reason)));
    }

    /// Makes every update block the plugin thread for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.script
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_open(&self) {
        self.script.fail_open.store(true, Ordering::SeqCst);
    }

    /// Pushes a fix through the reporter handed over at open.
    pub fn report(&self, position: Position) -> bool {
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

    pub fn updates_served(&self) -> usize {
        self.script.updates_served.load(Ordering::SeqCst)
    }
}

struct ScriptedLocation {
    script: Arc<LocationScript>,
}

impl Plugin for ScriptedLocation {
    fn close(&mut self) -> PluginResult<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl LocationPlugin for ScriptedLocation {
    fn open(&mut self, reporter: PositionReporter) -> PluginResult<()> {
        if self.script.fail_open.load(Ordering::SeqCst) {
            return Err(PluginError::remote("open refused"));
        }
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        *self.script.reporter.lock() = Some(reporter);
        Ok(())
    }

    fn update(&mut self) -> PluginResult<Option<Position>> {
        self.script.updates_served.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.script.updates.lock().pop_front().unwrap_or(Ok(None))
    }
}

#[derive(Default)]
struct GeocoderScript {
    addresses: Mutex<Vec<Address>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

/// Handle controlling a scripted geocoder plugin.
#[derive(Clone, Default)]
pub struct FakeGeocoder {
    script: Arc<GeocoderScript>,
}

impl FakeGeocoder {
    pub fn answering(lines: &[&str]) -> Self {
        let fake = Self::default();
        *fake.script.addresses.lock() = lines
            .iter()
            .map(|line| Address {
                address_lines: vec![line.to_string()],
                ..Default::default()
            })
            .collect();
        fake
    }

    pub fn install(
        &self,
        resolver: &RegistryResolver,
        transport: &LocalTransport,
        package: &str,
        class: &str,
    ) {
        resolver.install_package(package, vec![package.as_bytes().to_vec()]);
        resolver.register_component(package, class, BackendKind::Geocoder);
        let script = Arc::clone(&self.script);
        transport.register_geocoder(format!("{}/{}", package, class), move || {
            Ok(Box::new(ScriptedGeocoder {
                script: Arc::clone(&script),
            }) as Box<dyn GeocoderPlugin>)
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.script.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

struct ScriptedGeocoder {
    script: Arc<GeocoderScript>,
}

impl ScriptedGeocoder {
    fn answer(&self) -> PluginResult<Vec<Address>> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.failing.load(Ordering::SeqCst) {
            return Err(PluginError::remote("lookup failed"));
        }
        Ok(self.script.addresses.lock().clone())
    }
}

impl Plugin for ScriptedGeocoder {
    fn close(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

impl GeocoderPlugin for ScriptedGeocoder {
    fn forward(&mut self, _request: &GeocodeRequest) -> PluginResult<Vec<Address>> {
        self.answer()
    }

    fn reverse(&mut self, _request: &ReverseGeocodeRequest) -> PluginResult<Vec<Address>> {
        self.answer()
    }
}
