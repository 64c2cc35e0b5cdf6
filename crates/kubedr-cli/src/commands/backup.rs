//! `kubedr backup`: dump clusters and copy volumes onto the DR volume,
//! upload it, then snapshot it

use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use tracing::info;

use kubedr_common::DrEvent;
use kubedr_proto::SyncDirection;
use kubedr_resources::crd::BackupMethod;
use kubedr_stage::actions::{
    ClusterBackupAction, ClusterBackupConfig, ObjectStorageSyncAction, VolumeBackupAction,
    VolumeBackupConfig,
};

use super::{interruptible_scope, CommonArgs};
use crate::{Error, Result};

/// How the seed backup of each cluster clone is taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SeedBackupMethod {
    #[default]
    ObjectStore,
    VolumeSnapshot,
}

impl From<SeedBackupMethod> for BackupMethod {
    fn from(method: SeedBackupMethod) -> Self {
        match method {
            SeedBackupMethod::ObjectStore => BackupMethod::BarmanObjectStore,
            SeedBackupMethod::VolumeSnapshot => BackupMethod::VolumeSnapshot,
        }
    }
}

/// Back up database clusters and volumes
#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Event name; the run is recorded as `<name>-<start time>`
    #[arg(long, env = "KUBEDR_EVENT_NAME", default_value = "backup")]
    pub name: String,

    /// Database cluster to back up (repeatable)
    #[arg(long = "cluster", env = "KUBEDR_CLUSTERS", value_delimiter = ',')]
    pub clusters: Vec<String>,

    /// Persistent volume claim to back up (repeatable)
    #[arg(long = "volume", env = "KUBEDR_VOLUMES", value_delimiter = ',')]
    pub volumes: Vec<String>,

    /// Databases to dump from every cluster; all when unset
    #[arg(long = "database", env = "KUBEDR_DATABASES", value_delimiter = ',')]
    pub databases: Vec<String>,

    /// Back up cluster state as of this RFC 3339 instant
    #[arg(long, env = "KUBEDR_RECOVERY_TARGET_TIME")]
    pub recovery_target_time: Option<DateTime<Utc>>,

    /// Seed backup method for cluster clones
    #[arg(long, env = "KUBEDR_BACKUP_METHOD", value_enum, default_value_t = SeedBackupMethod::ObjectStore)]
    pub backup_method: SeedBackupMethod,
}

/// Run the backup command
pub async fn run(args: BackupArgs) -> Result<()> {
    if args.clusters.is_empty() && args.volumes.is_empty() {
        return Err(Error::validation("nothing to back up: pass --cluster or --volume"));
    }
    let common = &args.common;
    let timeouts = common.load_timeouts()?;
    let mut event = DrEvent::start(&args.name);
    let event_name = event.full_name().to_lowercase();
    info!(event = %event_name, "backup started");

    let scope = interruptible_scope();
    let ops = common.kube_ops().await?;

    let mut dr = common.dr_volume(&ops, args.clusters.clone(), &timeouts);
    dr.ensure_exists(&scope).await?;

    let mut stage = common.stage(&ops, &timeouts)?;
    for cluster in &args.clusters {
        let config = ClusterBackupConfig {
            namespace: common.namespace.clone(),
            cluster: cluster.clone(),
            dr_claim: common.dr_volume.clone(),
            issuer: common.issuer_ref(),
            databases: args.databases.clone(),
            recovery_target_time: args.recovery_target_time,
            backup_method: args.backup_method.into(),
            timeouts: timeouts.clone(),
        };
        stage = stage.with_action(
            format!("cluster-backup/{}", cluster),
            ClusterBackupAction::new(config, ops.clone(), ops.clone()),
        );
    }
    for pvc in &args.volumes {
        let config = VolumeBackupConfig {
            namespace: common.namespace.clone(),
            pvc: pvc.clone(),
            dr_claim: common.dr_volume.clone(),
            snapshot_class: common.snapshot_class.clone(),
            storage_class: common.storage_class.clone(),
            timeouts: timeouts.clone(),
        };
        stage = stage.with_action(
            format!("volume-backup/{}", pvc),
            VolumeBackupAction::new(config, ops.clone()),
        );
    }
    stage = stage.with_action(
        "object-storage-upload",
        ObjectStorageSyncAction::new(common.object_storage(SyncDirection::Upload, &event_name)),
    );
    stage.run(&scope).await?;

    let snapshot = dr.snapshot_and_wait_ready(&scope, &event_name).await?;
    event.stop();
    info!(
        event = %event_name,
        snapshot = ?snapshot.metadata.name,
        duration_secs = event.duration().map(|d| d.num_seconds()),
        "backup finished"
    );
    println!("{}", serde_json::to_string(&event).unwrap_or_default());
    Ok(())
}
