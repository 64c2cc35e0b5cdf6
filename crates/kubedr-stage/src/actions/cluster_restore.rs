//! Restore of logical dumps into an existing database cluster

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kubedr_common::config::Timeouts;
use kubedr_common::{Cleanup, Error, Result, ResultExt, Scope};
use kubedr_proto::{PostgresTarget, RestorePostgresRequest};
use kubedr_resources::cluster_clone::{client_certificate, rw_service_host, POSTGRES_PORT, SUPERUSER};
use kubedr_resources::crd::IssuerRef;
use kubedr_resources::ops::{CertificateOps, DatabaseClusterOps};
use kubedr_resources::worker::{generate_name, WorkerClient, WorkerOptions};

use super::{cluster_dump_dir, dr_volume, require, tls_volume};
use crate::stage::{Action, CleanupAction};

/// What to restore, and where
#[derive(Clone, Debug)]
pub struct ClusterRestoreConfig {
    /// Namespace of the target cluster
    pub namespace: String,
    /// Cluster receiving the data
    pub cluster: String,
    /// Cluster the dumps were taken from; defaults to the target
    pub source_cluster: Option<String>,
    /// DR volume claim holding the dumps
    pub dr_claim: String,
    /// Issuer trusted by the target cluster for client certificates
    pub issuer: IssuerRef,
    /// Databases to restore; empty restores every dump found
    pub databases: Vec<String>,
    /// Drop existing objects before restoring
    pub clean: bool,
    /// Per-step deadlines
    pub timeouts: Timeouts,
}

/// Issues a client certificate during setup and restores through the worker
pub struct ClusterRestoreAction {
    config: ClusterRestoreConfig,
    clusters: Arc<dyn DatabaseClusterOps>,
    certificates: Arc<dyn CertificateOps>,
    certificate: Option<String>,
}

impl ClusterRestoreAction {
    /// Create the action
    pub fn new(
        config: ClusterRestoreConfig,
        clusters: Arc<dyn DatabaseClusterOps>,
        certificates: Arc<dyn CertificateOps>,
    ) -> Self {
        Self {
            config,
            clusters,
            certificates,
            certificate: None,
        }
    }

    fn source_cluster(&self) -> &str {
        self.config
            .source_cluster
            .as_deref()
            .unwrap_or(&self.config.cluster)
    }
}

#[async_trait]
impl Action for ClusterRestoreAction {
    async fn validate(&self, _scope: &Scope) -> Result<()> {
        let c = &self.config;
        require(
            "ClusterRestoreConfig",
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
                "restore target does not exist",
            ));
        }
        Ok(())
    }

    async fn setup(&mut self, scope: &Scope, worker: &mut WorkerOptions) -> Result<()> {
        let c = &self.config;
        let ns = c.namespace.as_str();
        self.certificates
            .wait_issuer_ready(scope, ns, &c.issuer, c.timeouts.resource_ready())
            .await
            .map_err(|e| {
                Error::precondition(format!("issuer {}", c.issuer.name), format!("not ready: {}", e))
            })?;

        let name = generate_name(&format!("{}-restore-tls", c.cluster));
        self.certificates
            .create_certificate(ns, &client_certificate(ns, &name, SUPERUSER, &c.issuer))
            .await
            .with_context(|| format!("create certificate {}/{}", ns, name))?;
        self.certificate = Some(name.clone());
        self.certificates
            .wait_certificate_ready(scope, ns, &name, c.timeouts.resource_ready())
            .await
            .with_context(|| format!("wait for certificate {}/{}", ns, name))?;

        worker.add_volume(dr_volume(&c.dr_claim))?;
        worker.add_volume(tls_volume(&name).0)?;
        Ok(())
    }

    async fn execute(&mut self, _scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
        let certificate = self.certificate.as_deref().ok_or_else(|| {
            Error::internal_with_context("cluster restore", "executed before setup")
        })?;
        let (_, tls) = tls_volume(certificate);
        let input_dir = cluster_dump_dir(self.source_cluster());
        info!(cluster = %self.config.cluster, input_dir = %input_dir, "restoring cluster");

        client
            .restore_postgres(RestorePostgresRequest {
                target: Some(PostgresTarget {
                    host: rw_service_host(&self.config.cluster, &self.config.namespace),
                    port: u32::from(POSTGRES_PORT),
                    username: SUPERUSER.to_string(),
                    databases: self.config.databases.clone(),
                    tls: Some(tls),
                }),
                input_dir,
                clean: self.config.clean,
            })
            .await
    }

    fn as_cleanup(&mut self) -> Option<&mut dyn CleanupAction> {
        Some(self)
    }
}

#[async_trait]
impl CleanupAction for ClusterRestoreAction {
    async fn cleanup(&mut self, scope: &Scope) -> Result<()> {
        let Some(name) = self.certificate.clone() else {
            return Ok(());
        };
        let ns = self.config.namespace.clone();
        let certificates = self.certificates.clone();
        Cleanup::new(move || async move { certificates.delete_certificate(&ns, &name).await })
            .context("delete restore client certificate")
            .run(scope)
            .await?;
        self.certificate = None;
        Ok(())
    }
}
