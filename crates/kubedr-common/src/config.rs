//! Timeout configuration shared by the lifecycle managers

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-operation deadlines, in seconds
///
/// Deserializes from a partial document; missing fields take the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Certificates, issuers and other quickly-ready resources
    pub resource_ready_secs: u64,
    /// One-off database backups
    pub backup_ready_secs: u64,
    /// Database cluster recovery
    pub cluster_ready_secs: u64,
    /// Volume snapshots
    pub snapshot_ready_secs: u64,
    /// Worker pod and endpoint readiness
    pub worker_ready_secs: u64,
    /// Each timeout-scoped cleanup
    pub cleanup_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resource_ready_secs: 120,
            backup_ready_secs: 30 * 60,
            cluster_ready_secs: 60 * 60,
            snapshot_ready_secs: 30 * 60,
            worker_ready_secs: 5 * 60,
            cleanup_secs: 120,
        }
    }
}

impl Timeouts {
    /// Certificate/issuer readiness deadline
    pub fn resource_ready(&self) -> Duration {
        Duration::from_secs(self.resource_ready_secs)
    }

    /// Backup readiness deadline
    pub fn backup_ready(&self) -> Duration {
        Duration::from_secs(self.backup_ready_secs)
    }

    /// Cluster readiness deadline
    pub fn cluster_ready(&self) -> Duration {
        Duration::from_secs(self.cluster_ready_secs)
    }

    /// Snapshot readiness deadline
    pub fn snapshot_ready(&self) -> Duration {
        Duration::from_secs(self.snapshot_ready_secs)
    }

    /// Worker readiness deadline
    pub fn worker_ready(&self) -> Duration {
        Duration::from_secs(self.worker_ready_secs)
    }

    /// Cleanup deadline
    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let t: Timeouts = serde_json::from_str(r#"{"clusterReadySecs": 10}"#).unwrap();
        assert_eq!(t.cluster_ready(), Duration::from_secs(10));
        assert_eq!(t.cleanup(), Timeouts::default().cleanup());
    }
}
