//! Resolution of plugin addresses to installed components, and the signing
//! identity digests used to pin them.

use dashmap::DashMap;
use locfuse_core::types::{BackendKind, PluginAddress};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// A concrete installed component an address resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedComponent {
    pub package: String,
    pub class: String,
    pub kind: BackendKind,
}

impl ResolvedComponent {
    /// Returns the `package/class` form.
    pub fn name(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }
}

/// Digest algorithms usable for signature pinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    /// Digests `data`, returning lowercase hex.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Maps plugin addresses onto installed components.
pub trait PluginResolver: Send + Sync {
    /// Returns the installed component for `address`, if any.
    fn resolve(&self, address: &PluginAddress, kind: BackendKind) -> Option<ResolvedComponent>;

    /// Returns the signing certificates of an installed package.
    fn signing_certificates(&self, package: &str) -> Option<Vec<Vec<u8>>>;

    /// Digest of the package's first signing certificate.
    fn signature_digest(&self, package: &str, algorithm: DigestAlgorithm) -> Option<String> {
        let certificates = self.signing_certificates(package)?;
        let first = certificates.first()?;
        Some(algorithm.digest(first))
    }
}

#[derive(Debug, Clone, Default)]
struct InstalledPackage {
    certificates: Vec<Vec<u8>>,
    components: Vec<(String, BackendKind)>,
}

/// In-process registry of installed plugin packages.
#[derive(Debug, Default)]
pub struct RegistryResolver {
    packages: DashMap<String, InstalledPackage>,
}

impl RegistryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a package together with its signing certificates.
    pub fn install_package(&self, package: impl Into<String>, certificates: Vec<Vec<u8>>) {
        let package = package.into();
        debug!(package = %package, "Package installed");
        self.packages
            .entry(package)
            .or_default()
            .certificates = certificates;
    }

    /// Declares a component exported by an installed package.
    pub fn register_component(
        &self,
        package: impl Into<String>,
        class: impl Into<String>,
        kind: BackendKind,
    ) {
        let class = class.into();
        let mut entry = self.packages.entry(package.into()).or_default();
        if !entry.components.iter().any(|(c, k)| *c == class && *k == kind) {
            entry.components.push((class, kind));
        }
    }

    /// Forgets a package and all of its components.
    pub fn remove_package(&self, package: &str) -> bool {
        self.packages.remove(package).is_some()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

impl PluginResolver for RegistryResolver {
    fn resolve(&self, address: &PluginAddress, kind: BackendKind) -> Option<ResolvedComponent> {
        let package = self.packages.get(address.package())?;
        package
            .components
            .iter()
            .find(|(class, k)| class == address.class() && *k == kind)
            .map(|(class, _)| ResolvedComponent {
                package: address.package().to_string(),
                class: class.clone(),
                kind,
            })
    }

    fn signing_certificates(&self, package: &str) -> Option<Vec<Vec<u8>>> {
        self.packages.get(package).map(|p| p.certificates.clone())
    }
}
