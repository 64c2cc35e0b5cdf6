//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, ValueEnum};
use tracing::{info, warn};

use kubedr_common::config::Timeouts;
use kubedr_common::kube_utils::create_client;
use kubedr_common::{Scope, DEFAULT_WORKER_GRPC_PORT};
use kubedr_proto::SyncDirection;
use kubedr_resources::crd::IssuerRef;
use kubedr_resources::volume::{DrVolume, DrVolumeOptions};
use kubedr_resources::worker::{
    GrpcWorkerConnector, TokioNetworkProbe, WorkerManager, WorkerOptions, WorkerTls,
};
use kubedr_resources::KubeOps;
use kubedr_stage::actions::ObjectStorageSyncConfig;
use kubedr_stage::{Stage, StageOptions};

use crate::{Error, Result};

pub mod backup;
pub mod restore;

/// Kind of the cert-manager issuer signing database certificates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IssuerKind {
    #[default]
    Issuer,
    ClusterIssuer,
}

/// Flags shared by backup and restore
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to kubeconfig file (in-cluster or default resolution when unset)
    #[arg(long, env = "KUBEDR_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace of the databases, volumes, DR volume and worker
    #[arg(long, short = 'n', env = "KUBEDR_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Worker container image
    #[arg(long, env = "KUBEDR_WORKER_IMAGE")]
    pub worker_image: String,

    /// Worker gRPC port
    #[arg(long, env = "KUBEDR_WORKER_PORT", default_value_t = DEFAULT_WORKER_GRPC_PORT)]
    pub worker_port: u16,

    /// Worker service type (ClusterIP, NodePort or LoadBalancer)
    #[arg(long, env = "KUBEDR_WORKER_SERVICE_TYPE", default_value = "ClusterIP")]
    pub worker_service_type: String,

    /// Directory holding ca.crt, tls.crt and tls.key for mutual TLS with the worker
    #[arg(long, env = "KUBEDR_WORKER_TLS_DIR")]
    pub worker_tls_dir: Option<PathBuf>,

    /// Extra DNS suffixes tried when looking for the worker (comma separated)
    #[arg(long, env = "KUBEDR_SEARCH_DOMAINS", value_delimiter = ',')]
    pub search_domains: Vec<String>,

    /// Name of the DR volume claim
    #[arg(long, env = "KUBEDR_DR_VOLUME", default_value = "kubedr-dr")]
    pub dr_volume: String,

    /// DR volume size; twice the summed cluster sizes when unset
    #[arg(long, env = "KUBEDR_DR_VOLUME_SIZE")]
    pub dr_volume_size: Option<String>,

    /// Storage class for the DR volume and volume clones
    #[arg(long, env = "KUBEDR_STORAGE_CLASS")]
    pub storage_class: Option<String>,

    /// Volume snapshot class
    #[arg(long, env = "KUBEDR_SNAPSHOT_CLASS")]
    pub snapshot_class: Option<String>,

    /// cert-manager issuer for database client certificates
    #[arg(long, env = "KUBEDR_ISSUER")]
    pub issuer: String,

    /// Kind of the issuer
    #[arg(long, env = "KUBEDR_ISSUER_KIND", value_enum, default_value_t = IssuerKind::Issuer)]
    pub issuer_kind: IssuerKind,

    /// Object storage location, `s3://bucket/prefix`
    #[arg(long, env = "KUBEDR_REMOTE_URL")]
    pub remote_url: String,

    /// Secret holding object storage credentials
    #[arg(long, env = "KUBEDR_CREDENTIALS_SECRET")]
    pub credentials_secret: String,

    /// Object storage endpoint for non-AWS stores
    #[arg(long, env = "KUBEDR_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Object storage region
    #[arg(long, env = "KUBEDR_S3_REGION")]
    pub s3_region: Option<String>,

    /// JSON file overriding per-step timeouts, in seconds
    #[arg(long, env = "KUBEDR_TIMEOUTS")]
    pub timeouts: Option<PathBuf>,
}

impl CommonArgs {
    pub fn load_timeouts(&self) -> Result<Timeouts> {
        match &self.timeouts {
            Some(path) => {
                let raw = read(path)?;
                serde_json::from_str(&raw).map_err(|source| Error::Timeouts {
                    path: path.clone(),
                    source,
                })
            }
            None => Ok(Timeouts::default()),
        }
    }

    pub fn issuer_ref(&self) -> IssuerRef {
        match self.issuer_kind {
            IssuerKind::Issuer => IssuerRef::issuer(&self.issuer),
            IssuerKind::ClusterIssuer => IssuerRef::cluster_issuer(&self.issuer),
        }
    }

    pub async fn kube_ops(&self) -> Result<Arc<KubeOps>> {
        let client = create_client(self.kubeconfig.as_deref()).await?;
        Ok(Arc::new(KubeOps::new(client)))
    }

    pub fn dr_volume(&self, ops: &Arc<KubeOps>, clusters: Vec<String>, timeouts: &Timeouts) -> DrVolume {
        DrVolume::new(
            DrVolumeOptions {
                namespace: self.namespace.clone(),
                name: self.dr_volume.clone(),
                size: self.dr_volume_size.clone(),
                storage_class: self.storage_class.clone(),
                snapshot_class: self.snapshot_class.clone(),
                clusters,
                timeouts: timeouts.clone(),
            },
            ops.clone(),
            ops.clone(),
        )
    }

    pub fn stage(&self, ops: &Arc<KubeOps>, timeouts: &Timeouts) -> Result<Stage> {
        let tls = self.worker_tls_dir.as_deref().map(load_worker_tls).transpose()?;
        let manager = WorkerManager::new(
            ops.clone(),
            Arc::new(TokioNetworkProbe::default()),
            Arc::new(GrpcWorkerConnector::new(tls)),
        );

        let mut worker = WorkerOptions::new(&self.namespace, &self.worker_image);
        worker.port = self.worker_port;
        worker.service_type = self.worker_service_type.clone();
        worker.ready_timeout = timeouts.worker_ready();
        worker.cleanup_timeout = timeouts.cleanup();

        let mut options = StageOptions::new(worker);
        options.search_domains = self.search_domains.clone();
        options.cleanup_timeout = timeouts.cleanup();
        Ok(Stage::new(Arc::new(manager), options))
    }

    /// Object storage transfer of the whole DR volume under `<remote url>/<event>`
    pub fn object_storage(&self, direction: SyncDirection, event: &str) -> ObjectStorageSyncConfig {
        ObjectStorageSyncConfig {
            direction,
            dr_claim: self.dr_volume.clone(),
            local_subdir: String::new(),
            remote_url: format!("{}/{}", self.remote_url.trim_end_matches('/'), event),
            credentials_secret: self.credentials_secret.clone(),
            endpoint: self.s3_endpoint.clone(),
            region: self.s3_region.clone(),
        }
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::read(path, e))
}

fn load_worker_tls(dir: &Path) -> Result<WorkerTls> {
    Ok(WorkerTls {
        ca_pem: read(&dir.join("ca.crt"))?,
        cert_pem: read(&dir.join("tls.crt"))?,
        key_pem: read(&dir.join("tls.key"))?,
    })
}

/// Root scope of a command, cancelled on Ctrl-C
pub fn interruptible_scope() -> Scope {
    let scope = Scope::background();
    let on_signal = scope.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, cancelling and cleaning up");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
    info!("press Ctrl-C to cancel; created resources are still cleaned up");
    scope
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    fn parse(extra: &[&str]) -> CommonArgs {
        let mut args = vec![
            "kubedr",
            "--worker-image",
            "kubedr/worker:1",
            "--issuer",
            "pg-ca",
            "--remote-url",
            "s3://dr-bucket/billing/",
            "--credentials-secret",
            "s3-creds",
        ];
        args.extend_from_slice(extra);
        TestCli::try_parse_from(args).unwrap().common
    }

    #[test]
    fn defaults_fill_the_optional_flags() {
        let common = parse(&[]);
        assert_eq!(common.namespace, "default");
        assert_eq!(common.worker_port, 50051);
        assert_eq!(common.dr_volume, "kubedr-dr");
        assert_eq!(common.load_timeouts().unwrap(), Timeouts::default());
        assert_eq!(common.issuer_ref(), IssuerRef::issuer("pg-ca"));
    }

    #[test]
    fn search_domains_are_comma_separated() {
        let common = parse(&["--search-domains", "example.com,corp.internal"]);
        assert_eq!(common.search_domains, vec!["example.com", "corp.internal"]);
    }

    #[test]
    fn cluster_issuers_are_supported() {
        let common = parse(&["--issuer-kind", "cluster-issuer"]);
        assert!(common.issuer_ref().is_cluster_scoped());
    }

    #[test]
    fn event_data_lives_under_its_own_prefix() {
        let common = parse(&[]);
        let sync = common.object_storage(SyncDirection::Upload, "nightly-2026-10-16t02-00-00z");
        assert_eq!(sync.remote_url, "s3://dr-bucket/billing/nightly-2026-10-16t02-00-00z");
        assert_eq!(sync.dr_claim, "kubedr-dr");
    }

    #[test]
    fn missing_timeouts_file_is_a_read_error() {
        let common = parse(&["--timeouts", "/nonexistent/kubedr-timeouts.json"]);
        assert!(matches!(common.load_timeouts(), Err(Error::Read { .. })));
    }
}
