//! Volume clones and the disaster-recovery volume
//!
//! [`clone_pvc`] copies a live claim through a CSI snapshot so a worker can
//! read a consistent view of it. [`DrVolume`] is the claim that collects the
//! output of a DR event before it is snapshotted and shipped off-cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{debug, info, instrument};

use kubedr_common::config::Timeouts;
use kubedr_common::kube_utils::managed_metadata;
use kubedr_common::quantity::{format_bytes, parse_bytes};
use kubedr_common::{Cleanup, Error, Result, ResultExt, Scope};

use crate::crd::{VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use crate::ops::{DatabaseClusterOps, VolumeOps};

const STORAGE: &str = "storage";
const READ_WRITE_ONCE: &str = "ReadWriteOnce";
const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// DR volume headroom over the summed cluster sizes
const DR_VOLUME_FACTOR: u128 = 2;

/// Size of the DR volume in bytes.
///
/// An explicit size wins and must be positive. Otherwise the declared sizes
/// of the clusters being backed up are summed and doubled, leaving room for
/// dumps plus the previous event's data.
pub fn calculate_dr_volume_size(explicit: Option<&str>, cluster_sizes: &[String]) -> Result<u128> {
    if let Some(size) = explicit {
        let bytes = parse_bytes(size).context("DR volume size")?;
        if bytes == 0 {
            return Err(Error::validation("DR volume", "explicit size must be positive"));
        }
        return Ok(bytes);
    }

    let mut total: u128 = 0;
    for size in cluster_sizes {
        total += parse_bytes(size).with_context(|| format!("cluster storage size {}", size))?;
    }
    if total == 0 {
        return Err(Error::validation(
            "DR volume",
            "no size given and no cluster storage to derive one from",
        ));
    }
    Ok(total * DR_VOLUME_FACTOR)
}

/// Requested storage of a claim, if declared
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(STORAGE)
        .map(|q| q.0.as_str())
}

fn claim(
    namespace: &str,
    name: &str,
    size: String,
    access_modes: Vec<String>,
    storage_class: Option<String>,
    data_source: Option<TypedLocalObjectReference>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: managed_metadata(name, namespace, BTreeMap::new()),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(STORAGE.to_string(), Quantity(size))])),
                ..Default::default()
            }),
            storage_class_name: storage_class,
            data_source,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn snapshot_of(
    namespace: &str,
    name: &str,
    claim: &str,
    class: Option<String>,
) -> VolumeSnapshot {
    VolumeSnapshot {
        metadata: managed_metadata(name, namespace, BTreeMap::new()),
        spec: VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim.to_string()),
            },
            volume_snapshot_class_name: class,
        },
        status: None,
    }
}

// =============================================================================
// DR volume
// =============================================================================

/// Where and how large the DR volume is
#[derive(Clone, Debug, Default)]
pub struct DrVolumeOptions {
    /// Namespace of the claim and of the referenced clusters
    pub namespace: String,
    /// Claim name
    pub name: String,
    /// Explicit size; derived from `clusters` when unset
    pub size: Option<String>,
    /// Storage class for a newly created claim
    pub storage_class: Option<String>,
    /// Snapshot class for event snapshots
    pub snapshot_class: Option<String>,
    /// Clusters whose declared storage sizes the volume is derived from
    pub clusters: Vec<String>,
    /// Snapshot deadlines
    pub timeouts: Timeouts,
}

/// The claim collecting a DR event's output
pub struct DrVolume {
    options: DrVolumeOptions,
    volumes: Arc<dyn VolumeOps>,
    clusters: Arc<dyn DatabaseClusterOps>,
    claim: Option<String>,
}

impl DrVolume {
    /// Describe the DR volume; nothing is created until [`DrVolume::ensure_exists`]
    pub fn new(
        options: DrVolumeOptions,
        volumes: Arc<dyn VolumeOps>,
        clusters: Arc<dyn DatabaseClusterOps>,
    ) -> Self {
        Self {
            options,
            volumes,
            clusters,
            claim: None,
        }
    }

    /// Claim name once the volume exists
    pub fn claim_name(&self) -> Option<&str> {
        self.claim.as_deref()
    }

    async fn cluster_sizes(&self) -> Result<Vec<String>> {
        let ns = &self.options.namespace;
        let mut sizes = Vec::with_capacity(self.options.clusters.len());
        for name in &self.options.clusters {
            let cluster = self.clusters.get_cluster(ns, name).await?.ok_or_else(|| {
                Error::precondition(format!("cluster {}/{}", ns, name), "cluster does not exist")
            })?;
            let size = cluster.spec.storage.size.ok_or_else(|| {
                Error::validation(format!("cluster {}/{}", ns, name), "spec.storage.size is not set")
            })?;
            sizes.push(size);
        }
        Ok(sizes)
    }

    /// Reuse the claim if it exists, otherwise create it with the computed size
    #[instrument(skip(self, scope), fields(namespace = %self.options.namespace, name = %self.options.name))]
    pub async fn ensure_exists(&mut self, scope: &Scope) -> Result<()> {
        let ns = self.options.namespace.clone();
        let name = self.options.name.clone();

        let sizes = if self.options.size.is_some() {
            Vec::new()
        } else {
            scope.run("read cluster sizes", self.cluster_sizes()).await?
        };
        let bytes = calculate_dr_volume_size(self.options.size.as_deref(), &sizes)?;

        if let Some(existing) = self.volumes.get_pvc(&ns, &name).await? {
            debug!(
                requested = ?requested_storage(&existing),
                wanted = %format_bytes(bytes),
                "reusing existing DR volume"
            );
            self.claim = Some(name);
            return Ok(());
        }

        let pvc = claim(
            &ns,
            &name,
            format_bytes(bytes),
            vec![READ_WRITE_ONCE.to_string()],
            self.options.storage_class.clone(),
            None,
        );
        self.volumes
            .create_pvc(&ns, &pvc)
            .await
            .with_context(|| format!("create DR volume {}/{}", ns, name))?;
        info!(size = %format_bytes(bytes), "DR volume created");
        self.claim = Some(name);
        Ok(())
    }

    /// Snapshot the DR volume and wait until the snapshot is ready to use
    #[instrument(skip(self, scope), fields(namespace = %self.options.namespace))]
    pub async fn snapshot_and_wait_ready(
        &self,
        scope: &Scope,
        snapshot_name: &str,
    ) -> Result<VolumeSnapshot> {
        let ns = self.options.namespace.as_str();
        let claim_name = self.claim.as_deref().ok_or_else(|| {
            Error::precondition(
                format!("DR volume {}/{}", ns, self.options.name),
                "volume does not exist yet",
            )
        })?;

        let snapshot = snapshot_of(
            ns,
            snapshot_name,
            claim_name,
            self.options.snapshot_class.clone(),
        );
        self.volumes
            .create_snapshot(ns, &snapshot)
            .await
            .with_context(|| format!("create volumesnapshot {}/{}", ns, snapshot_name))?;

        let mut result = self
            .volumes
            .wait_snapshot_ready(scope, ns, snapshot_name, self.options.timeouts.snapshot_ready())
            .await
            .with_context(|| format!("wait for volumesnapshot {}/{}", ns, snapshot_name));
        if result.is_err() {
            Cleanup::new(|| self.volumes.delete_snapshot(ns, snapshot_name))
                .context(format!("delete volumesnapshot {}/{}", ns, snapshot_name))
                .timeout(self.options.timeouts.cleanup())
                .fold_into(scope, &mut result)
                .await;
        }
        result
    }

    /// Delete the claim (absent is success)
    pub async fn delete(&mut self, scope: &Scope) -> Result<()> {
        let Some(name) = self.claim.clone() else {
            return Ok(());
        };
        let ns = self.options.namespace.as_str();
        scope
            .run("delete DR volume", self.volumes.delete_pvc(ns, &name))
            .await
            .with_context(|| format!("delete DR volume {}/{}", ns, name))?;
        self.claim = None;
        Ok(())
    }
}

// =============================================================================
// PVC clones
// =============================================================================

/// Parameters for [`clone_pvc`]
#[derive(Clone, Debug, Default)]
pub struct ClonePvcOptions {
    /// Namespace of the source and the clone
    pub namespace: String,
    /// Claim to clone
    pub source: String,
    /// Name of the new claim; the snapshot is `<name>-snap`
    pub name: String,
    /// Snapshot class (cluster default when unset)
    pub snapshot_class: Option<String>,
    /// Storage class of the clone (source's when unset)
    pub storage_class: Option<String>,
    /// Snapshot deadlines
    pub timeouts: Timeouts,
}

/// A snapshot-backed copy of a claim
pub struct ClonedVolume {
    namespace: String,
    claim: Option<String>,
    snapshot: Option<String>,
    volumes: Arc<dyn VolumeOps>,
}

impl std::fmt::Debug for ClonedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonedVolume")
            .field("namespace", &self.namespace)
            .field("claim", &self.claim)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl ClonedVolume {
    /// Name of the cloned claim, while it exists
    pub fn claim_name(&self) -> Option<&str> {
        self.claim.as_deref()
    }

    /// Delete the claim and the snapshot it was restored from
    pub async fn delete(&mut self, scope: &Scope) -> Result<()> {
        let ns = self.namespace.clone();
        let mut errors = Vec::new();

        if let Some(name) = self.claim.clone() {
            match scope
                .run("delete pvc", self.volumes.delete_pvc(&ns, &name))
                .await
                .with_context(|| format!("delete pvc {}/{}", ns, name))
            {
                Ok(()) => self.claim = None,
                Err(e) => errors.push(e),
            }
        }
        if let Some(name) = self.snapshot.clone() {
            match scope
                .run("delete volumesnapshot", self.volumes.delete_snapshot(&ns, &name))
                .await
                .with_context(|| format!("delete volumesnapshot {}/{}", ns, name))
            {
                Ok(()) => self.snapshot = None,
                Err(e) => errors.push(e),
            }
        }

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Clone a claim through a CSI snapshot.
///
/// The clone's size is the larger of the snapshot's restore size and the
/// source's request. On failure every recorded part is deleted.
#[instrument(skip(scope, volumes, options), fields(namespace = %options.namespace, source = %options.source, name = %options.name))]
pub async fn clone_pvc(
    scope: &Scope,
    volumes: Arc<dyn VolumeOps>,
    options: &ClonePvcOptions,
) -> Result<ClonedVolume> {
    let ns = options.namespace.as_str();
    let source = volumes.get_pvc(ns, &options.source).await?.ok_or_else(|| {
        Error::precondition(format!("pvc {}/{}", ns, options.source), "source claim does not exist")
    })?;

    let mut cloned = ClonedVolume {
        namespace: ns.to_string(),
        claim: None,
        snapshot: None,
        volumes: volumes.clone(),
    };
    let mut result = copy_claim(scope, volumes.as_ref(), options, &source, &mut cloned).await;

    if result.is_err() {
        let target = &mut cloned;
        Cleanup::with_scope(move |s| async move { target.delete(&s).await })
            .context(format!("delete clone of pvc {}/{}", ns, options.source))
            .timeout(options.timeouts.cleanup())
            .fold_into(scope, &mut result)
            .await;
    }
    result.map(|()| cloned)
}

async fn copy_claim(
    scope: &Scope,
    volumes: &dyn VolumeOps,
    options: &ClonePvcOptions,
    source: &PersistentVolumeClaim,
    cloned: &mut ClonedVolume,
) -> Result<()> {
    let ns = options.namespace.as_str();
    let snapshot_name = format!("{}-snap", options.name);

    let snapshot = snapshot_of(ns, &snapshot_name, &options.source, options.snapshot_class.clone());
    volumes
        .create_snapshot(ns, &snapshot)
        .await
        .with_context(|| format!("create volumesnapshot {}/{}", ns, snapshot_name))?;
    cloned.snapshot = Some(snapshot_name.clone());

    let ready = volumes
        .wait_snapshot_ready(scope, ns, &snapshot_name, options.timeouts.snapshot_ready())
        .await
        .with_context(|| format!("wait for volumesnapshot {}/{}", ns, snapshot_name))?;

    let restore = match ready.status.as_ref().and_then(|s| s.restore_size.as_deref()) {
        Some(size) => parse_bytes(size).context("snapshot restore size")?,
        None => 0,
    };
    let requested = match requested_storage(source) {
        Some(size) => parse_bytes(size).context("source claim request")?,
        None => 0,
    };
    let bytes = restore.max(requested);
    if bytes == 0 {
        return Err(Error::validation(
            format!("pvc {}/{}", ns, options.source),
            "neither the snapshot nor the source claim declares a size",
        ));
    }

    let spec = source.spec.as_ref();
    let access_modes = spec
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_else(|| vec![READ_WRITE_ONCE.to_string()]);
    let storage_class = options
        .storage_class
        .clone()
        .or_else(|| spec.and_then(|s| s.storage_class_name.clone()));
    let pvc = claim(
        ns,
        &options.name,
        format_bytes(bytes),
        access_modes,
        storage_class,
        Some(TypedLocalObjectReference {
            api_group: Some(SNAPSHOT_API_GROUP.to_string()),
            kind: "VolumeSnapshot".to_string(),
            name: snapshot_name,
        }),
    );
    volumes
        .create_pvc(ns, &pvc)
        .await
        .with_context(|| format!("create pvc {}/{}", ns, options.name))?;
    cloned.claim = Some(options.name.clone());
    info!(size = %format_bytes(bytes), "pvc cloned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use mockall::predicate::*;

    use super::*;
    use crate::crd::{Cluster, ClusterSpec, StorageConfiguration, VolumeSnapshotStatus};
    use crate::ops::{MockDatabaseClusterOps, MockVolumeOps};

    const GI: u128 = 1024 * 1024 * 1024;

    fn sized_pvc(name: &str, size: &str) -> PersistentVolumeClaim {
        claim(
            "billing",
            name,
            size.to_string(),
            vec!["ReadWriteOnce".to_string()],
            Some("fast".to_string()),
            None,
        )
    }

    fn ready_snapshot(restore: Option<&str>) -> VolumeSnapshot {
        let mut snap = snapshot_of("billing", "files-dr-snap", "files", None);
        snap.status = Some(VolumeSnapshotStatus {
            ready_to_use: Some(true),
            restore_size: restore.map(str::to_string),
            error: None,
        });
        snap
    }

    fn cluster_of(size: &str) -> Cluster {
        Cluster::new(
            "db",
            ClusterSpec {
                instances: 1,
                storage: StorageConfiguration {
                    size: Some(size.to_string()),
                    storage_class: None,
                },
                ..Default::default()
            },
        )
    }

    // ==========================================================================
    // Story: DR volume sizing
    // ==========================================================================

    #[test]
    fn story_dr_volume_is_twice_the_summed_cluster_sizes() {
        let bytes =
            calculate_dr_volume_size(None, &["1Gi".to_string(), "3Gi".to_string()]).unwrap();
        assert_eq!(bytes, 8 * GI);
        assert_eq!(format_bytes(bytes), "8Gi");
    }

    #[test]
    fn explicit_size_wins_over_cluster_sizes() {
        let bytes = calculate_dr_volume_size(Some("50Gi"), &["1Gi".to_string()]).unwrap();
        assert_eq!(bytes, 50 * GI);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(calculate_dr_volume_size(None, &[]).is_err());
        assert!(calculate_dr_volume_size(Some("0"), &[]).is_err());
        assert!(calculate_dr_volume_size(None, &["lots".to_string()]).is_err());
    }

    // ==========================================================================
    // Story: DR volume lifecycle
    // ==========================================================================

    fn dr_options() -> DrVolumeOptions {
        DrVolumeOptions {
            namespace: "billing".to_string(),
            name: "dr".to_string(),
            clusters: vec!["db".to_string(), "ledger".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_missing_dr_volume_is_created_from_cluster_sizes() {
        let mut clusters = MockDatabaseClusterOps::new();
        clusters
            .expect_get_cluster()
            .with(eq("billing"), eq("db"))
            .returning(|_, _| Ok(Some(cluster_of("1Gi"))));
        clusters
            .expect_get_cluster()
            .with(eq("billing"), eq("ledger"))
            .returning(|_, _| Ok(Some(cluster_of("3Gi"))));

        let mut volumes = MockVolumeOps::new();
        volumes.expect_get_pvc().returning(|_, _| Ok(None));
        volumes
            .expect_create_pvc()
            .withf(|ns, pvc| ns == "billing" && requested_storage(pvc) == Some("8Gi"))
            .times(1)
            .returning(|_, pvc| Ok(pvc.clone()));

        let mut dr = DrVolume::new(dr_options(), Arc::new(volumes), Arc::new(clusters));
        dr.ensure_exists(&Scope::background()).await.unwrap();
        assert_eq!(dr.claim_name(), Some("dr"));
    }

    #[tokio::test]
    async fn existing_dr_volume_is_reused() {
        let mut clusters = MockDatabaseClusterOps::new();
        clusters
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(cluster_of("1Gi"))));
        let mut volumes = MockVolumeOps::new();
        volumes
            .expect_get_pvc()
            .returning(|_, name| Ok(Some(sized_pvc(name, "4Gi"))));
        volumes.expect_create_pvc().times(0);

        let mut dr = DrVolume::new(dr_options(), Arc::new(volumes), Arc::new(clusters));
        dr.ensure_exists(&Scope::background()).await.unwrap();
        assert_eq!(dr.claim_name(), Some("dr"));
    }

    #[tokio::test]
    async fn snapshot_before_the_volume_exists_is_a_precondition_error() {
        let dr = DrVolume::new(
            dr_options(),
            Arc::new(MockVolumeOps::new()),
            Arc::new(MockDatabaseClusterOps::new()),
        );
        let err = dr
            .snapshot_and_wait_ready(&Scope::background(), "nightly-2024-03-09T04-05-06Z")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
    }

    #[tokio::test]
    async fn failed_event_snapshot_is_deleted() {
        let mut volumes = MockVolumeOps::new();
        volumes.expect_get_pvc().returning(|_, _| Ok(None));
        volumes
            .expect_create_pvc()
            .returning(|_, pvc| Ok(pvc.clone()));
        volumes
            .expect_create_snapshot()
            .returning(|_, s| Ok(s.clone()));
        volumes
            .expect_wait_snapshot_ready()
            .returning(|_, _, _, _| Err(Error::precondition("volumesnapshot e", "driver error")));
        volumes
            .expect_delete_snapshot()
            .with(eq("billing"), eq("e"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut opts = dr_options();
        opts.size = Some("10Gi".to_string());
        let mut dr = DrVolume::new(opts, Arc::new(volumes), Arc::new(MockDatabaseClusterOps::new()));
        dr.ensure_exists(&Scope::background()).await.unwrap();
        assert!(dr
            .snapshot_and_wait_ready(&Scope::background(), "e")
            .await
            .is_err());
    }

    // ==========================================================================
    // Story: PVC clones
    // ==========================================================================

    fn clone_options() -> ClonePvcOptions {
        ClonePvcOptions {
            namespace: "billing".to_string(),
            source: "files".to_string(),
            name: "files-dr".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_clone_uses_the_larger_of_restore_size_and_request() {
        let mut volumes = MockVolumeOps::new();
        volumes
            .expect_get_pvc()
            .returning(|_, name| Ok(Some(sized_pvc(name, "5Gi"))));
        volumes
            .expect_create_snapshot()
            .times(1)
            .returning(|_, s| Ok(s.clone()));
        volumes
            .expect_wait_snapshot_ready()
            .with(always(), eq("billing"), eq("files-dr-snap"), always())
            .returning(|_, _, _, _| Ok(ready_snapshot(Some("6Gi"))));
        volumes
            .expect_create_pvc()
            .withf(|_, pvc| {
                let spec = pvc.spec.as_ref().unwrap();
                requested_storage(pvc) == Some("6Gi")
                    && spec.storage_class_name.as_deref() == Some("fast")
                    && spec.data_source.as_ref().unwrap().name == "files-dr-snap"
            })
            .times(1)
            .returning(|_, pvc| Ok(pvc.clone()));

        let cloned = clone_pvc(&Scope::background(), Arc::new(volumes), &clone_options())
            .await
            .unwrap();
        assert_eq!(cloned.claim_name(), Some("files-dr"));
    }

    #[tokio::test]
    async fn story_failed_clone_deletes_its_snapshot() {
        let mut volumes = MockVolumeOps::new();
        volumes
            .expect_get_pvc()
            .returning(|_, name| Ok(Some(sized_pvc(name, "5Gi"))));
        volumes
            .expect_create_snapshot()
            .returning(|_, s| Ok(s.clone()));
        volumes
            .expect_wait_snapshot_ready()
            .returning(|_, _, _, _| Ok(ready_snapshot(None)));
        volumes
            .expect_create_pvc()
            .returning(|_, _| Err(Error::internal("quota exceeded")));
        volumes.expect_delete_pvc().times(0);
        volumes
            .expect_delete_snapshot()
            .with(eq("billing"), eq("files-dr-snap"))
            .times(1)
            .returning(|_, _| Ok(()));

        let err = clone_pvc(&Scope::background(), Arc::new(volumes), &clone_options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn missing_source_claim_creates_nothing() {
        let mut volumes = MockVolumeOps::new();
        volumes.expect_get_pvc().returning(|_, _| Ok(None));
        volumes.expect_create_snapshot().times(0);

        let err = clone_pvc(&Scope::background(), Arc::new(volumes), &clone_options())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
    }
}
