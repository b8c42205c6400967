//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::lease::LeasePolicy;
use crate::persist::{SnapshotPolicy, SyncMode};

/// Configuration for opening a [`Registry`](crate::Registry).
///
/// Lease and snapshot tunables only seed a fresh registry. Once state has
/// been persisted, the values recorded in the snapshot and log win, so an
/// administrative change survives restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory for `registry.snapshot` and `registry.log` (None = in-memory)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Durability of log appends
    #[serde(default)]
    pub sync_mode: SyncMode,

    #[serde(default)]
    pub lease: LeasePolicy,

    #[serde(default)]
    pub snapshot: SnapshotPolicy,
}

impl RegistryConfig {
    /// An in-memory registry with default policy.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A file-backed registry rooted at `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RegistryPolicy {
        RegistryPolicy {
            lease: self.lease.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Scalar tunables persisted with the registry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryPolicy {
    pub lease: LeasePolicy,
    pub snapshot: SnapshotPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.sync_mode, SyncMode::Immediate);
        assert_eq!(config.lease.min_max_service_lease_ms, 5 * 60 * 1000);
        assert_eq!(config.lease.min_max_event_lease_ms, 30 * 60 * 1000);
        assert_eq!(config.lease.min_renewal_interval_ms, 100);
        assert_eq!(config.snapshot.log_to_snapshot_threshold, 200);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"lease": {"min_max_service_lease_ms": 60000}}"#).unwrap();
        assert_eq!(config.lease.min_max_service_lease_ms, 60_000);
        assert_eq!(config.lease.min_max_event_lease_ms, 30 * 60 * 1000);
        assert_eq!(config.snapshot.snapshot_weight, 10.0);
    }
}
