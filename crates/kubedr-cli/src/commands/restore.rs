//! `kubedr restore`: download an event onto the DR volume and restore its
//! database dumps

use clap::Args;
use tracing::info;

use kubedr_proto::SyncDirection;
use kubedr_stage::actions::{ClusterRestoreAction, ClusterRestoreConfig, ObjectStorageSyncAction};

use super::{interruptible_scope, CommonArgs};
use crate::{Error, Result};

/// Restore database clusters from a backup event
#[derive(Args, Debug)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Full name of the backup event to restore
    #[arg(long, env = "KUBEDR_EVENT")]
    pub event: String,

    /// Cluster to restore into, as `target` or `target=source` (repeatable)
    #[arg(long = "cluster", env = "KUBEDR_CLUSTERS", value_delimiter = ',', required = true)]
    pub clusters: Vec<String>,

    /// Databases to restore; every dump when unset
    #[arg(long = "database", env = "KUBEDR_DATABASES", value_delimiter = ',')]
    pub databases: Vec<String>,

    /// Drop existing objects before restoring them
    #[arg(long, env = "KUBEDR_CLEAN")]
    pub clean: bool,
}

/// `target` or `target=source`
fn parse_mapping(raw: &str) -> Result<(String, Option<String>)> {
    match raw.split_once('=') {
        None if !raw.is_empty() => Ok((raw.to_string(), None)),
        Some((target, source)) if !target.is_empty() && !source.is_empty() => {
            Ok((target.to_string(), Some(source.to_string())))
        }
        _ => Err(Error::validation(format!(
            "invalid cluster mapping {:?}, expected target or target=source",
            raw
        ))),
    }
}

/// Run the restore command
pub async fn run(args: RestoreArgs) -> Result<()> {
    let mappings = args
        .clusters
        .iter()
        .map(|raw| parse_mapping(raw))
        .collect::<Result<Vec<_>>>()?;
    let common = &args.common;
    let timeouts = common.load_timeouts()?;
    let event = args.event.to_lowercase();
    info!(event = %event, clusters = mappings.len(), "restore started");

    let scope = interruptible_scope();
    let ops = common.kube_ops().await?;

    let targets = mappings.iter().map(|(target, _)| target.clone()).collect();
    let mut dr = common.dr_volume(&ops, targets, &timeouts);
    dr.ensure_exists(&scope).await?;

    let mut stage = common.stage(&ops, &timeouts)?.with_action(
        "object-storage-download",
        ObjectStorageSyncAction::new(common.object_storage(SyncDirection::Download, &event)),
    );
    for (target, source) in mappings {
        let config = ClusterRestoreConfig {
            namespace: common.namespace.clone(),
            cluster: target.clone(),
            source_cluster: source,
            dr_claim: common.dr_volume.clone(),
            issuer: common.issuer_ref(),
            databases: args.databases.clone(),
            clean: args.clean,
            timeouts: timeouts.clone(),
        };
        stage = stage.with_action(
            format!("cluster-restore/{}", target),
            ClusterRestoreAction::new(config, ops.clone(), ops.clone()),
        );
    }
    stage.run(&scope).await?;

    info!(event = %event, "restore finished");
    Ok(())
}
