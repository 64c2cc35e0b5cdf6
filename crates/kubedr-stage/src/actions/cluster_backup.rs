//! Logical backup of a database cluster
//!
//! Dumps are taken from a point-in-time clone, never from the live cluster,
//! so the source sees no extra load beyond the seed backup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use kubedr_common::config::Timeouts;
use kubedr_common::{Error, Result, Scope};
use kubedr_proto::{DumpPostgresRequest, PostgresTarget};
use kubedr_resources::cluster_clone::{POSTGRES_PORT, SUPERUSER};
use kubedr_resources::crd::{BackupMethod, IssuerRef};
use kubedr_resources::ops::{CertificateOps, DatabaseClusterOps};
use kubedr_resources::worker::{generate_name, WorkerClient, WorkerOptions};
use kubedr_resources::{CloneClusterOptions, ClonedCluster, ClusterCloneManager};

use super::{cluster_dump_dir, dr_volume, require, tls_volume};
use crate::stage::{Action, CleanupAction};

/// What to back up
#[derive(Clone, Debug)]
pub struct ClusterBackupConfig {
    /// Namespace of the cluster
    pub namespace: String,
    /// Cluster to back up
    pub cluster: String,
    /// DR volume claim the dump is written to
    pub dr_claim: String,
    /// Issuer for the clone's certificates
    pub issuer: IssuerRef,
    /// Databases to dump; empty dumps all of them
    pub databases: Vec<String>,
    /// Back up the state as of this instant
    pub recovery_target_time: Option<DateTime<Utc>>,
    /// How the clone's seed backup is taken
    pub backup_method: BackupMethod,
    /// Per-step deadlines
    pub timeouts: Timeouts,
}

/// Clones the cluster during setup and dumps the clone on the worker
pub struct ClusterBackupAction {
    config: ClusterBackupConfig,
    clusters: Arc<dyn DatabaseClusterOps>,
    manager: ClusterCloneManager,
    clone: Option<ClonedCluster>,
}

impl ClusterBackupAction {
    /// Create the action
    pub fn new(
        config: ClusterBackupConfig,
        clusters: Arc<dyn DatabaseClusterOps>,
        certificates: Arc<dyn CertificateOps>,
    ) -> Self {
        Self {
            manager: ClusterCloneManager::new(clusters.clone(), certificates),
            config,
            clusters,
            clone: None,
        }
    }
}

#[async_trait]
impl Action for ClusterBackupAction {
    async fn validate(&self, _scope: &Scope) -> Result<()> {
        let c = &self.config;
        require(
            "ClusterBackupConfig",
            &[
                ("namespace", &c.namespace),
                ("cluster", &c.cluster),
                ("DR claim", &c.dr_claim),
                ("issuer", &c.issuer.name),
            ],
        )?;
        if self.clusters.get_cluster(&c.namespace, &c.cluster).await?.is_none() {
            return Err(Error::precondition(
                format!("cluster {}/{}", c.namespace, c.cluster),
                "cluster does not exist",
            ));
        }
        Ok(())
    }

    async fn setup(&mut self, scope: &Scope, worker: &mut WorkerOptions) -> Result<()> {
        let c = &self.config;
        let options = CloneClusterOptions {
            namespace: c.namespace.clone(),
            source_name: c.cluster.clone(),
            clone_name: generate_name(&format!("{}-dr", c.cluster)),
            issuer: c.issuer.clone(),
            recovery_target_time: c.recovery_target_time,
            backup_method: c.backup_method,
            timeouts: c.timeouts.clone(),
        };
        let clone = self.manager.clone_cluster(scope, &options).await?;
        let (tls, _) = tls_volume(&clone.client_secret_name());
        self.clone = Some(clone);

        worker.add_volume(dr_volume(&c.dr_claim))?;
        worker.add_volume(tls)?;
        Ok(())
    }

    async fn execute(&mut self, _scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
        let clone = self.clone.as_ref().ok_or_else(|| {
            Error::internal_with_context("cluster backup", "executed before setup")
        })?;
        let (_, tls) = tls_volume(&clone.client_secret_name());
        let output_dir = cluster_dump_dir(&self.config.cluster);
        info!(clone = %clone.name(), output_dir = %output_dir, "dumping cluster clone");

        client
            .dump_postgres(DumpPostgresRequest {
                target: Some(PostgresTarget {
                    host: clone.rw_service_host(),
                    port: u32::from(POSTGRES_PORT),
                    username: SUPERUSER.to_string(),
                    databases: self.config.databases.clone(),
                    tls: Some(tls),
                }),
                output_dir,
            })
            .await
    }

    fn as_cleanup(&mut self) -> Option<&mut dyn CleanupAction> {
        Some(self)
    }
}

#[async_trait]
impl CleanupAction for ClusterBackupAction {
    async fn cleanup(&mut self, scope: &Scope) -> Result<()> {
        if let Some(clone) = self.clone.as_mut() {
            clone.delete(scope).await?;
        }
        self.clone = None;
        Ok(())
    }
}
