//! Core types for the locfuse location broker.
//!
//! This module defines the data model shared by plugins, the fusion engines and
//! the caller-facing service: plugin addresses, positions, geocoding requests
//! and results, connection states and status codes.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Provider tag stamped on every position accepted from a backend.
pub const NETWORK_PROVIDER: &str = "network";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The two families of plugins the broker manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Produces position fixes
    Location,
    /// Performs forward and reverse geocoding
    Geocoder,
}

impl BackendKind {
    /// Returns the kind as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Location => "location",
            BackendKind::Geocoder => "geocoder",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one installed plugin component.
///
/// The textual form is `package/class[/signatureDigest]`. Two addresses are
/// equal when package and class match; the digest only pins the signing
/// identity that must be verified before binding.
///
/// # Examples
///
/// ```
/// use locfuse_core::types::PluginAddress;
///
/// let pinned: PluginAddress = "pkg.b/Class/deadbeef".parse().unwrap();
/// let plain: PluginAddress = "pkg.b/Class".parse().unwrap();
/// assert_eq!(pinned, plain);
/// assert_eq!(pinned.signature_digest(), Some("deadbeef"));
/// assert_eq!(pinned.to_string(), "pkg.b/Class/deadbeef");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginAddress {
    package: String,
    class: String,
    signature_digest: Option<String>,
}

impl PluginAddress {
    /// Creates an address from its parts.
    pub fn new(
        package: impl Into<String>,
        class: impl Into<String>,
        signature_digest: Option<String>,
    ) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
            signature_digest: signature_digest.filter(|d| !d.is_empty()),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn signature_digest(&self) -> Option<&str> {
        self.signature_digest.as_deref()
    }

    /// Returns the `package/class` form without the digest.
    pub fn component_name(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }

    /// Returns true if this address refers to the given component.
    ///
    /// Digests only take part when both sides carry one.
    pub fn matches(&self, package: &str, class: &str, signature_digest: Option<&str>) -> bool {
        if self.package != package || self.class != class {
            return false;
        }
        match (self.signature_digest(), signature_digest) {
            (Some(ours), Some(theirs)) => ours.eq_ignore_ascii_case(theirs),
            _ => true,
        }
    }
}

impl PartialEq for PluginAddress {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package && self.class == other.class
    }
}

impl Eq for PluginAddress {}

impl Hash for PluginAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package.hash(state);
        self.class.hash(state);
    }
}

impl FromStr for PluginAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '/');
        let package = parts.next().unwrap_or_default();
        let class = parts.next().unwrap_or_default();
        if package.is_empty() || class.is_empty() {
            return Err(ConfigError::invalid_value(
                "plugin address",
                format!("expected package/class[/digest], got '{}'", s),
            ));
        }
        let digest = parts.next().map(|d| d.to_ascii_lowercase());
        Ok(Self::new(package, class, digest))
    }
}

impl TryFrom<String> for PluginAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PluginAddress> for String {
    fn from(address: PluginAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for PluginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.signature_digest {
            Some(digest) => write!(f, "{}/{}/{}", self.package, self.class, digest),
            None => write!(f, "{}/{}", self.package, self.class),
        }
    }
}

/// Lifecycle state of a single plugin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection; the next bind will try again
    Unbound,
    /// Resolution, verification or transport bind in progress
    Binding,
    /// Connected and usable
    Bound,
    /// Tear-down in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unbound => write!(f, "unbound"),
            ConnectionState::Binding => write!(f, "binding"),
            ConnectionState::Bound => write!(f, "bound"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// A geographic fix.
///
/// Positions produced by the fusion engine carry the other contributing
/// backends' fixes in `alternates`; those are metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Horizontal accuracy radius in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Provider tag
    pub provider: String,

    /// Provider tag the backend originally reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_provider: Option<String>,

    /// `package/class` of the backend that produced this fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_component: Option<String>,

    /// Other backends' fixes that took part in the merge
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<Position>,
}

impl Position {
    /// Creates a position without accuracy, tagged with the network provider.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            timestamp,
            provider: NETWORK_PROVIDER.to_string(),
            backend_provider: None,
            backend_component: None,
            alternates: Vec::new(),
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Returns true if coordinates are in range and accuracy, when present,
    /// is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        let coordinates_ok = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        let accuracy_ok = match self.accuracy {
            Some(accuracy) => accuracy.is_finite() && accuracy >= 0.0,
            None => true,
        };
        coordinates_ok && accuracy_ok
    }

    /// Returns true if there is no previous fix or this one is strictly newer.
    pub fn is_newer_than(&self, previous: Option<&Position>) -> bool {
        previous.map_or(true, |p| self.timestamp > p.timestamp)
    }

    /// Milliseconds elapsed between this fix and `now`.
    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Bounding box restricting a forward geocode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLonBounds {
    pub lower_left: LatLon,
    pub upper_right: LatLon,
}

/// Forward geocoding request: name to addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeRequest {
    pub location_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<LatLonBounds>,
    pub max_results: u32,
    pub locale: String,
}

impl GeocodeRequest {
    pub fn new(location_name: impl Into<String>, max_results: u32) -> Self {
        Self {
            location_name: location_name.into(),
            bounds: None,
            max_results,
            locale: "en".to_string(),
        }
    }
}

/// Reverse geocoding request: coordinates to addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseGeocodeRequest {
    pub location: LatLon,
    pub max_results: u32,
    pub locale: String,
}

impl ReverseGeocodeRequest {
    pub fn new(location: LatLon, max_results: u32) -> Self {
        Self {
            location,
            max_results,
            locale: "en".to_string(),
        }
    }
}

/// A geocoding result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub address_lines: Vec<String>,
    pub feature_name: Option<String>,
    pub locality: Option<String>,
    pub admin_area: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub location: Option<LatLon>,
    pub locale: Option<String>,
}

/// Status codes returned across the caller-facing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    NotImplemented = 1,
    PermissionError = 2,
    InvalidArgs = 3,
}

impl StatusCode {
    /// Returns the numeric wire value.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::NotImplemented => write!(f, "NOT_IMPLEMENTED"),
            StatusCode::PermissionError => write!(f, "PERMISSION_ERROR"),
            StatusCode::InvalidArgs => write!(f, "INVALID_ARGS"),
        }
    }
}

/// Identity of the process calling into the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub pid: u32,
    pub uid: u32,
    pub package: String,
}

impl CallerIdentity {
    pub fn new(pid: u32, uid: u32, package: impl Into<String>) -> Self {
        Self {
            pid,
            uid,
            package: package.into(),
        }
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[pid={}, uid={}]", self.package, self.pid, self.uid)
    }
}
