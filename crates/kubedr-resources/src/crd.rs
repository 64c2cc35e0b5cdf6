//! Typed views of the third-party resources kubedr drives
//!
//! Only the fields kubedr reads or writes are modeled; unknown fields are
//! ignored on read. Each readiness predicate follows the waiter contract:
//! `Ok(Some(_))` when ready, `Ok(None)` to keep waiting, `Err` when the
//! resource reached a terminal failure.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use kubedr_common::kube_utils::{has_condition, StatusCondition, CONDITION_READY};
use kubedr_common::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition entry shared by CNPG, cert-manager and snapshot status blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    /// Condition type (e.g. Ready)
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False or Unknown
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusCondition for ResourceCondition {
    fn condition_type(&self) -> &str {
        &self.type_
    }
    fn condition_status(&self) -> &str {
        &self.status
    }
}

// =============================================================================
// CloudNativePG
// =============================================================================

/// Phase CNPG reports once every instance is up
pub const CLUSTER_PHASE_HEALTHY: &str = "Cluster in healthy state";

/// Backup phase for a finished backup
pub const BACKUP_PHASE_COMPLETED: &str = "completed";

/// Backup phase for a failed backup
pub const BACKUP_PHASE_FAILED: &str = "failed";

/// Storage section of a CNPG cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    /// Requested volume size (e.g. "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class for instance volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Reference to an object by name in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

/// Point-in-time recovery target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTarget {
    /// RFC 3339 timestamp to replay WAL up to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time: Option<String>,
}

/// Bootstrap a new cluster by recovering a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRecovery {
    /// Backup to restore from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<LocalObjectReference>,
    /// Optional point-in-time target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_target: Option<RecoveryTarget>,
}

/// How a CNPG cluster is initialized
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfiguration {
    /// Recover from an existing backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<BootstrapRecovery>,
}

/// User-provided TLS secrets for a CNPG cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesConfiguration {
    /// Secret with the server certificate and key
    #[serde(default, rename = "serverTLSSecret", skip_serializing_if = "Option::is_none")]
    pub server_tls_secret: Option<String>,
    /// Secret with the CA that signed the server certificate
    #[serde(default, rename = "serverCASecret", skip_serializing_if = "Option::is_none")]
    pub server_ca_secret: Option<String>,
    /// Secret with the CA used to verify client certificates. Needs `ca.key`
    /// only when `replication_tls_secret` is unset.
    #[serde(default, rename = "clientCASecret", skip_serializing_if = "Option::is_none")]
    pub client_ca_secret: Option<String>,
    /// Secret with the `streaming_replica` client certificate and key
    #[serde(default, rename = "replicationTLSSecret", skip_serializing_if = "Option::is_none")]
    pub replication_tls_secret: Option<String>,
}

/// CNPG `Cluster` spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of instances
    pub instances: i32,
    /// Postgres container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Instance storage
    #[serde(default)]
    pub storage: StorageConfiguration,
    /// Initialization method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapConfiguration>,
    /// TLS secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesConfiguration>,
}

/// CNPG `Cluster` status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Human-readable phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Instances reporting ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_instances: Option<i32>,
    /// Status conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ResourceCondition>>,
}

/// How CNPG takes a one-off backup
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackupMethod {
    /// Base backup to the cluster's object store
    #[default]
    BarmanObjectStore,
    /// CSI volume snapshots of the instance volumes
    VolumeSnapshot,
}

/// CNPG `Backup` spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cluster to back up
    pub cluster: LocalObjectReference,
    /// Backup method
    #[serde(default)]
    pub method: BackupMethod,
}

/// CNPG `Backup` status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// pending, running, completed or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ready once CNPG reports the cluster healthy
pub fn cluster_healthy(cluster: &Cluster) -> Result<Option<()>> {
    let Some(status) = &cluster.status else {
        return Ok(None);
    };
    let healthy = status.phase.as_deref() == Some(CLUSTER_PHASE_HEALTHY)
        || has_condition(status.conditions.as_deref(), CONDITION_READY);
    Ok(healthy.then_some(()))
}

/// Ready once the backup completed; a failed backup is an error
pub fn backup_completed(backup: &Backup) -> Result<Option<()>> {
    let Some(status) = &backup.status else {
        return Ok(None);
    };
    match status.phase.as_deref() {
        Some(BACKUP_PHASE_COMPLETED) => Ok(Some(())),
        Some(BACKUP_PHASE_FAILED) => Err(Error::precondition(
            format!("backup {}", backup.name_any()),
            status
                .error
                .clone()
                .unwrap_or_else(|| "backup failed".to_string()),
        )),
        _ => Ok(None),
    }
}

// =============================================================================
// cert-manager
// =============================================================================

/// Reference to the issuer signing a certificate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer or ClusterIssuer (cert-manager defaults to Issuer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// API group (cert-manager.io when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl IssuerRef {
    /// Namespaced Issuer reference
    pub fn issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some("Issuer".to_string()),
            group: None,
        }
    }

    /// ClusterIssuer reference
    pub fn cluster_issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some("ClusterIssuer".to_string()),
            group: None,
        }
    }

    /// Whether this points at a cluster-scoped issuer
    pub fn is_cluster_scoped(&self) -> bool {
        self.kind.as_deref() == Some("ClusterIssuer")
    }
}

/// cert-manager `Certificate` spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced,
    status = "CertificateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Secret receiving tls.crt, tls.key and ca.crt
    pub secret_name: String,
    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Subject alternative DNS names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    /// Key usages (e.g. "server auth", "client auth")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
    /// Signing issuer
    pub issuer_ref: IssuerRef,
}

/// Conditions-only status used by certificates and issuers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ResourceCondition>>,
}

/// Issuer configuration is opaque to kubedr; only readiness is read
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Issuer",
    plural = "issuers",
    namespaced,
    status = "CertificateStatus"
)]
pub struct IssuerSpec {
    /// Raw issuer configuration (ca, acme, vault, ...)
    #[serde(flatten)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Cluster-scoped issuer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "ClusterIssuer",
    plural = "clusterissuers",
    status = "CertificateStatus"
)]
pub struct ClusterIssuerSpec {
    /// Raw issuer configuration
    #[serde(flatten)]
    pub config: BTreeMap<String, serde_json::Value>,
}

fn conditions_ready(status: Option<&CertificateStatus>) -> Option<()> {
    let conditions = status.and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_READY).then_some(())
}

/// Ready once the certificate has been issued
pub fn certificate_ready(cert: &Certificate) -> Result<Option<()>> {
    Ok(conditions_ready(cert.status.as_ref()))
}

/// Ready once the issuer can sign
pub fn issuer_ready(issuer: &Issuer) -> Result<Option<()>> {
    Ok(conditions_ready(issuer.status.as_ref()))
}

/// Ready once the cluster issuer can sign
pub fn cluster_issuer_ready(issuer: &ClusterIssuer) -> Result<Option<()>> {
    Ok(conditions_ready(issuer.status.as_ref()))
}

// =============================================================================
// CSI snapshots
// =============================================================================

/// What a snapshot is taken of
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// PVC to snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// `VolumeSnapshot` spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    namespaced,
    status = "VolumeSnapshotStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Snapshot source
    pub source: VolumeSnapshotSource,
    /// Snapshot class (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot failure reported by the CSI driver
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotError {
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `VolumeSnapshot` status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Snapshot can be used as a data source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Minimum size of a volume restored from this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
    /// Driver-reported failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

/// Ready once the snapshot can be restored; yields the ready snapshot
pub fn snapshot_ready(snapshot: &VolumeSnapshot) -> Result<Option<VolumeSnapshot>> {
    let Some(status) = &snapshot.status else {
        return Ok(None);
    };
    if let Some(err) = &status.error {
        return Err(Error::precondition(
            format!("volumesnapshot {}", snapshot.name_any()),
            err.message
                .clone()
                .unwrap_or_else(|| "snapshot failed".to_string()),
        ));
    }
    Ok((status.ready_to_use == Some(true)).then(|| snapshot.clone()))
}
