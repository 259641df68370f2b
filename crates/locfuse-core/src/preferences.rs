//! Persisted lists of enabled plugins.
//!
//! Each entry is a `package/class[/signatureDigest]` string. Lists keep their
//! order; duplicates are dropped on write.

use crate::error::{ConfigError, Result};
use crate::types::BackendKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Get/set access to the enabled-backend lists.
pub trait BackendStore: Send + Sync {
    /// Returns the enabled entries for `kind`.
    fn enabled_backends(&self, kind: BackendKind) -> Vec<String>;

    /// Replaces the enabled entries for `kind`.
    fn set_enabled_backends(&self, kind: BackendKind, backends: &[String]) -> Result<()>;
}

/// On-disk layout of the backend lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendLists {
    #[serde(default)]
    pub location_backends: Vec<String>,
    #[serde(default)]
    pub geocoder_backends: Vec<String>,
}

impl BackendLists {
    fn get(&self, kind: BackendKind) -> &Vec<String> {
        match kind {
            BackendKind::Location => &self.location_backends,
            BackendKind::Geocoder => &self.geocoder_backends,
        }
    }

    fn set(&mut self, kind: BackendKind, backends: &[String]) {
        let deduped = dedup_entries(backends);
        match kind {
            BackendKind::Location => self.location_backends = deduped,
            BackendKind::Geocoder => self.geocoder_backends = deduped,
        }
    }
}

fn dedup_entries(backends: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(backends.len());
    for entry in backends {
        let entry = entry.trim();
        if !entry.is_empty() && !out.iter().any(|e| e == entry) {
            out.push(entry.to_string());
        }
    }
    out
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryBackendStore {
    lists: RwLock<BackendLists>,
}

impl MemoryBackendStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with both lists.
    pub fn with_backends(location: &[&str], geocoder: &[&str]) -> Self {
        let mut lists = BackendLists::default();
        let to_owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        lists.set(BackendKind::Location, &to_owned(location));
        lists.set(BackendKind::Geocoder, &to_owned(geocoder));
        Self {
            lists: RwLock::new(lists),
        }
    }
}

impl BackendStore for MemoryBackendStore {
    fn enabled_backends(&self, kind: BackendKind) -> Vec<String> {
        self.lists.read().get(kind).clone()
    }

    fn set_enabled_backends(&self, kind: BackendKind, backends: &[String]) -> Result<()> {
        self.lists.write().set(kind, backends);
        Ok(())
    }
}

/// Store backed by a YAML file, cached in memory and written through on set.
#[derive(Debug)]
pub struct FileBackendStore {
    path: PathBuf,
    lists: RwLock<BackendLists>,
}

impl FileBackendStore {
    /// Opens the store, starting empty if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lists = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::LoadFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            if contents.trim().is_empty() {
                BackendLists::default()
            } else {
                serde_yaml::from_str(&contents).map_err(|e| ConfigError::InvalidFormat {
                    reason: e.to_string(),
                })?
            }
        } else {
            BackendLists::default()
        };

        debug!(
            path = %path.display(),
            location = lists.location_backends.len(),
            geocoder = lists.geocoder_backends.len(),
            "Opened backend store"
        );

        Ok(Self {
            path,
            lists: RwLock::new(lists),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, lists: &BackendLists) -> Result<()> {
        let save_failed = |reason: String| ConfigError::SaveFailed {
            path: self.path.display().to_string(),
            reason,
        };
        let yaml = serde_yaml::to_string(lists).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
            }
        }
        std::fs::write(&self.path, yaml).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }
}

impl BackendStore for FileBackendStore {
    fn enabled_backends(&self, kind: BackendKind) -> Vec<String> {
        self.lists.read().get(kind).clone()
    }

    fn set_enabled_backends(&self, kind: BackendKind, backends: &[String]) -> Result<()> {
        let mut lists = self.lists.write();
        let mut updated = lists.clone();
        updated.set(kind, backends);
        self.persist(&updated)?;
        *lists = updated;
        Ok(())
    }
}
