//! Caller authorization.

use dashmap::DashMap;
use locfuse_core::types::CallerIdentity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Permissions checked by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Receive fused locations
    CoarseLocation,
    /// Change configuration and inspect individual backends
    ServiceAdmin,
    /// Use the geocoders
    Geocode,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::CoarseLocation => write!(f, "coarse_location"),
            Permission::ServiceAdmin => write!(f, "service_admin"),
            Permission::Geocode => write!(f, "geocode"),
        }
    }
}

/// Decides whether a caller holds a permission.
///
/// Checked on every call and again at every location delivery.
pub trait Authorizer: Send + Sync {
    fn check(&self, caller: &CallerIdentity, permission: Permission) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _caller: &CallerIdentity, _permission: Permission) -> bool {
        true
    }
}

/// Grants keyed by caller uid.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    grants: DashMap<u32, HashSet<Permission>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, uid: u32, permissions: &[Permission]) {
        self.grants
            .entry(uid)
            .or_default()
            .extend(permissions.iter().copied());
    }

    pub fn revoke(&self, uid: u32, permission: Permission) {
        if let Some(mut granted) = self.grants.get_mut(&uid) {
            granted.remove(&permission);
        }
    }

    pub fn revoke_all(&self, uid: u32) {
        self.grants.remove(&uid);
    }
}

impl Authorizer for StaticAuthorizer {
    fn check(&self, caller: &CallerIdentity, permission: Permission) -> bool {
        self.grants
            .get(&caller.uid)
            .map(|granted| granted.contains(&permission))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_grants() {
        let authorizer = StaticAuthorizer::new();
        let app = CallerIdentity::new(100, 10_001, "com.example.maps");
        assert!(!authorizer.check(&app, Permission::CoarseLocation));

        authorizer.grant(10_001, &[Permission::CoarseLocation, Permission::Geocode]);
        assert!(authorizer.check(&app, Permission::CoarseLocation));
        assert!(!authorizer.check(&app, Permission::ServiceAdmin));

        authorizer.revoke(10_001, Permission::CoarseLocation);
        assert!(!authorizer.check(&app, Permission::CoarseLocation));
        assert!(authorizer.check(&app, Permission::Geocode));

        authorizer.revoke_all(10_001);
        assert!(!authorizer.check(&app, Permission::Geocode));
    }

    #[test]
    fn test_permission_display() {
        assert_eq!(Permission::CoarseLocation.to_string(), "coarse_location");
        assert!(AllowAll.check(&CallerIdentity::new(1, 0, "root"), Permission::ServiceAdmin));
    }
}
