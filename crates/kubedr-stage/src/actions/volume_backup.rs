//! File-level backup of a persistent volume claim via a snapshot clone

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kubedr_common::config::Timeouts;
use kubedr_common::{Error, Result, Scope};
use kubedr_proto::SyncFilesRequest;
use kubedr_resources::ops::VolumeOps;
use kubedr_resources::volume::{clone_pvc, ClonePvcOptions, ClonedVolume};
use kubedr_resources::worker::{
    generate_name, volume_name, WorkerClient, WorkerOptions, WorkerVolume,
};

use super::{dr_volume, require, volume_copy_dir};
use crate::stage::{Action, CleanupAction};

/// Which claim to copy
#[derive(Clone, Debug)]
pub struct VolumeBackupConfig {
    /// Namespace of the claim
    pub namespace: String,
    /// Claim to back up
    pub pvc: String,
    /// DR volume claim receiving the copy
    pub dr_claim: String,
    /// Snapshot class; cluster default when unset
    pub snapshot_class: Option<String>,
    /// Storage class of the clone; source's class when unset
    pub storage_class: Option<String>,
    /// Per-step deadlines
    pub timeouts: Timeouts,
}

/// Clones the claim during setup and copies the clone onto the DR volume
pub struct VolumeBackupAction {
    config: VolumeBackupConfig,
    volumes: Arc<dyn VolumeOps>,
    clone: Option<ClonedVolume>,
}

impl VolumeBackupAction {
    /// Create the action
    pub fn new(config: VolumeBackupConfig, volumes: Arc<dyn VolumeOps>) -> Self {
        Self {
            config,
            volumes,
            clone: None,
        }
    }

    fn source_mount(&self) -> String {
        format!("/src/{}", self.config.pvc)
    }
}

#[async_trait]
impl Action for VolumeBackupAction {
    async fn validate(&self, _scope: &Scope) -> Result<()> {
        let c = &self.config;
        require(
            "VolumeBackupConfig",
            &[("namespace", &c.namespace), ("pvc", &c.pvc), ("DR claim", &c.dr_claim)],
        )?;
        if c.pvc == c.dr_claim {
            return Err(Error::validation(
                "VolumeBackupConfig",
                "the DR volume cannot back up itself",
            ));
        }
        if self.volumes.get_pvc(&c.namespace, &c.pvc).await?.is_none() {
            return Err(Error::precondition(
                format!("pvc {}/{}", c.namespace, c.pvc),
                "claim does not exist",
            ));
        }
        Ok(())
    }

    async fn setup(&mut self, scope: &Scope, worker: &mut WorkerOptions) -> Result<()> {
        let options = ClonePvcOptions {
            namespace: self.config.namespace.clone(),
            source: self.config.pvc.clone(),
            name: generate_name(&format!("{}-dr", self.config.pvc)),
            snapshot_class: self.config.snapshot_class.clone(),
            storage_class: self.config.storage_class.clone(),
            timeouts: self.config.timeouts.clone(),
        };
        let clone = clone_pvc(scope, self.volumes.clone(), &options).await?;
        let claim = clone.claim_name().map(str::to_string);
        self.clone = Some(clone);
        let claim = claim.ok_or_else(|| {
            Error::internal_with_context("volume backup", "cloned volume has no claim")
        })?;

        worker.add_volume(dr_volume(&self.config.dr_claim))?;
        worker.add_volume(
            WorkerVolume::pvc(volume_name("src", &self.config.pvc), claim, self.source_mount())
                .read_only(),
        )?;
        Ok(())
    }

    async fn execute(&mut self, _scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
        let destination = volume_copy_dir(&self.config.pvc);
        info!(pvc = %self.config.pvc, destination = %destination, "copying volume clone");
        client
            .sync_files(SyncFilesRequest {
                source_path: self.source_mount(),
                destination_path: destination,
                delete_extraneous: true,
            })
            .await
    }

    fn as_cleanup(&mut self) -> Option<&mut dyn CleanupAction> {
        Some(self)
    }
}

#[async_trait]
impl CleanupAction for VolumeBackupAction {
    async fn cleanup(&mut self, scope: &Scope) -> Result<()> {
        if let Some(clone) = self.clone.as_mut() {
            clone.delete(scope).await?;
        }
        self.clone = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kubedr_resources::crd::{VolumeSnapshot, VolumeSnapshotStatus};

    use super::*;
    use crate::actions::mocks::{MockVolumes, MockWorker};

    fn config() -> VolumeBackupConfig {
        VolumeBackupConfig {
            namespace: "billing".to_string(),
            pvc: "uploads".to_string(),
            dr_claim: "dr-claim".to_string(),
            snapshot_class: None,
            storage_class: None,
            timeouts: Timeouts::default(),
        }
    }

    fn claim(name: &str, size: &str) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some(name.to_string());
        pvc.spec = Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        });
        pvc
    }

    #[tokio::test]
    async fn backing_up_the_dr_volume_is_rejected() {
        let mut config = config();
        config.pvc = "dr-claim".to_string();
        let mut volumes = MockVolumes::new();
        volumes.expect_get_pvc().times(0);
        let action = VolumeBackupAction::new(config, Arc::new(volumes));

        let err = action.validate(&Scope::background()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn story_clone_is_mounted_read_only_copied_and_deleted() {
        let mut volumes = MockVolumes::new();
        volumes
            .expect_get_pvc()
            .returning(|_, name| Ok(Some(claim(name, "5Gi"))));
        volumes
            .expect_create_snapshot()
            .times(1)
            .returning(|_, s| Ok(s.clone()));
        volumes
            .expect_wait_snapshot_ready()
            .returning(|_, _, name, _| {
                let mut ready = VolumeSnapshot::new(name, Default::default());
                ready.status = Some(VolumeSnapshotStatus {
                    ready_to_use: Some(true),
                    restore_size: Some("5Gi".to_string()),
                    error: None,
                });
                Ok(ready)
            });
        volumes
            .expect_create_pvc()
            .times(1)
            .returning(|_, p| Ok(p.clone()));
        volumes
            .expect_delete_pvc()
            .withf(|_, name| name.starts_with("uploads-dr-"))
            .times(1)
            .returning(|_, _| Ok(()));
        volumes
            .expect_delete_snapshot()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut action = VolumeBackupAction::new(config(), Arc::new(volumes));

        let scope = Scope::background();
        action.validate(&scope).await.unwrap();
        let mut worker = WorkerOptions::new("dr", "kubedr/worker:1");
        action.setup(&scope, &mut worker).await.unwrap();

        let source = worker
            .volumes
            .iter()
            .find(|v| v.mount_path == "/src/uploads")
            .unwrap();
        assert!(source.read_only);

        let mut client = MockWorker::new();
        client
            .expect_sync_files()
            .withf(|req| {
                req.source_path == "/src/uploads"
                    && req.destination_path == "/dr/volumes/uploads"
                    && req.delete_extraneous
            })
            .times(1)
            .returning(|_| Ok(()));
        action.execute(&scope, Arc::new(client)).await.unwrap();

        action.as_cleanup().unwrap().cleanup(&scope).await.unwrap();
        action.as_cleanup().unwrap().cleanup(&scope).await.unwrap();
    }
}
