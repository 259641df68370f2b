//! Built-in demo backends, installed when the binary runs without real plugins.

use locfuse_core::types::{now_millis, Address, BackendKind, LatLon, Position};
use locfuse_core::{GeocodeRequest, ReverseGeocodeRequest};
use locfuse_plugin_api::{
    DigestAlgorithm, GeocoderPlugin, LocalTransport, LocationPlugin, Plugin, PluginDescriptor,
    PluginResult, PositionReporter, RegistryResolver,
};

const SAMPLE_PACKAGE: &str = "org.locfuse.sample";
const SAMPLE_CERTIFICATE: &[u8] = b"locfuse sample signing key";

/// A fixed anchor point with a slow drift, reporting a constant accuracy.
struct DriftingBackend {
    name: &'static str,
    anchor: LatLon,
    accuracy: f64,
    ticks: u32,
    reporter: Option<PositionReporter>,
}

impl DriftingBackend {
    fn new(name: &'static str, anchor: LatLon, accuracy: f64) -> Self {
        Self {
            name,
            anchor,
            accuracy,
            ticks: 0,
            reporter: None,
        }
    }
}

impl Plugin for DriftingBackend {
    fn close(&mut self) -> PluginResult<()> {
        self.reporter = None;
        Ok(())
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            description: Some("Synthetic fixes around a fixed anchor".to_string()),
            ..PluginDescriptor::named(self.name)
        }
    }
}

impl LocationPlugin for DriftingBackend {
    fn open(&mut self, reporter: PositionReporter) -> PluginResult<()> {
        self.reporter = Some(reporter);
        Ok(())
    }

    fn update(&mut self) -> PluginResult<Option<Position>> {
        self.ticks = self.ticks.wrapping_add(1);
        let offset = f64::from(self.ticks % 20) * 0.00005;
        Ok(Some(
            Position::new(
                self.anchor.latitude + offset,
                self.anchor.longitude - offset,
                now_millis(),
            )
            .with_accuracy(self.accuracy)
            .with_provider(self.name),
        ))
    }
}

/// Forward and reverse lookups over a small static gazetteer.
struct GazetteerBackend {
    places: Vec<(&'static str, LatLon)>,
}

impl GazetteerBackend {
    fn new() -> Self {
        Self {
            places: vec![
                ("Berlin", LatLon::new(52.5200, 13.4050)),
                ("Hamburg", LatLon::new(53.5511, 9.9937)),
                ("Munich", LatLon::new(48.1351, 11.5820)),
                ("Vienna", LatLon::new(48.2082, 16.3738)),
            ],
        }
    }

    fn address(name: &str, location: LatLon, locale: &str) -> Address {
        Address {
            address_lines: vec![name.to_string()],
            feature_name: Some(name.to_string()),
            locality: Some(name.to_string()),
            location: Some(location),
            locale: Some(locale.to_string()),
            ..Default::default()
        }
    }
}

impl Plugin for GazetteerBackend {
    fn close(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::named("Sample gazetteer")
    }
}

impl GeocoderPlugin for GazetteerBackend {
    fn forward(&mut self, request: &GeocodeRequest) -> PluginResult<Vec<Address>> {
        let needle = request.location_name.to_lowercase();
        Ok(self
            .places
            .iter()
            .filter(|(name, _)| name.to_lowercase().contains(&needle))
            .take(request.max_results as usize)
            .map(|(name, at)| Self::address(name, *at, &request.locale))
            .collect())
    }

    fn reverse(&mut self, request: &ReverseGeocodeRequest) -> PluginResult<Vec<Address>> {
        let distance = |at: &LatLon| {
            (at.latitude - request.location.latitude).powi(2)
                + (at.longitude - request.location.longitude).powi(2)
        };
        let mut nearest: Vec<_> = self.places.iter().collect();
        nearest.sort_by(|a, b| distance(&a.1).total_cmp(&distance(&b.1)));
        Ok(nearest
            .into_iter()
            .take(request.max_results as usize)
            .map(|(name, at)| Self::address(name, *at, &request.locale))
            .collect())
    }
}

/// Backend entries for the installed samples.
pub struct SampleBackends {
    pub location: Vec<String>,
    pub geocoder: Vec<String>,
}

/// Installs the demo package into the resolver and transport.
pub fn install(resolver: &RegistryResolver, transport: &LocalTransport) -> SampleBackends {
    resolver.install_package(SAMPLE_PACKAGE, vec![SAMPLE_CERTIFICATE.to_vec()]);
    resolver.register_component(SAMPLE_PACKAGE, "WifiBackend", BackendKind::Location);
    resolver.register_component(SAMPLE_PACKAGE, "CellBackend", BackendKind::Location);
    resolver.register_component(SAMPLE_PACKAGE, "Gazetteer", BackendKind::Geocoder);

    transport.register_location(format!("{}/WifiBackend", SAMPLE_PACKAGE), || {
        Ok(Box::new(DriftingBackend::new(
            "sample-wifi",
            LatLon::new(52.5163, 13.3777),
            25.0,
        )) as Box<dyn LocationPlugin>)
    });
    transport.register_location(format!("{}/CellBackend", SAMPLE_PACKAGE), || {
        Ok(Box::new(DriftingBackend::new(
            "sample-cell",
            LatLon::new(52.5190, 13.3800),
            900.0,
        )) as Box<dyn LocationPlugin>)
    });
    transport.register_geocoder(format!("{}/Gazetteer", SAMPLE_PACKAGE), || {
        Ok(Box::new(GazetteerBackend::new()) as Box<dyn GeocoderPlugin>)
    });

    let digest = DigestAlgorithm::Sha256.digest(SAMPLE_CERTIFICATE);
    SampleBackends {
        location: vec![
            format!("{}/WifiBackend/{}", SAMPLE_PACKAGE, digest),
            format!("{}/CellBackend", SAMPLE_PACKAGE),
        ],
        geocoder: vec![format!("{}/Gazetteer", SAMPLE_PACKAGE)],
    }
}
