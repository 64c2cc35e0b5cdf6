//! Point-in-time clones of CloudNativePG clusters
//!
//! A clone is built as a saga: a one-off backup of the source, server,
//! superuser and replication certificates from the caller's issuer, then a new cluster
//! bootstrapped from the backup. Each created resource is recorded on the
//! [`ClonedCluster`] as soon as it exists, so a failure at any step deletes
//! exactly what was built. The backup is always temporary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, instrument};

use kubedr_common::config::Timeouts;
use kubedr_common::kube_utils::managed_metadata;
use kubedr_common::quantity::parse_bytes;
use kubedr_common::{Cleanup, Error, Result, ResultExt, Scope};

use crate::crd::{
    Backup, BackupMethod, BackupSpec, BootstrapConfiguration, BootstrapRecovery, Certificate,
    CertificateSpec, CertificatesConfiguration, Cluster, ClusterSpec, IssuerRef,
    LocalObjectReference, RecoveryTarget,
};
use crate::ops::{CertificateOps, DatabaseClusterOps};

/// Postgres superuser the client certificate is issued for
pub const SUPERUSER: &str = "postgres";

/// User CNPG replicas authenticate as when streaming from the primary
pub const REPLICATION_USER: &str = "streaming_replica";

/// Postgres port served by CNPG services
pub const POSTGRES_PORT: u16 = 5432;

/// Service roles CNPG creates for every cluster
const SERVICE_ROLES: [&str; 3] = ["rw", "r", "ro"];

/// Label linking clone resources to their source cluster
const LABEL_CLONE_SOURCE: &str = "kubedr.io/clone-source";

/// Parameters for [`ClusterCloneManager::clone_cluster`]
#[derive(Clone, Debug)]
pub struct CloneClusterOptions {
    /// Namespace of the source cluster; the clone is created alongside it
    pub namespace: String,
    /// Source cluster name
    pub source_name: String,
    /// Name for the new cluster
    pub clone_name: String,
    /// Issuer signing the clone's server and client certificates
    pub issuer: IssuerRef,
    /// Replay WAL up to this instant instead of the end of the backup
    pub recovery_target_time: Option<DateTime<Utc>>,
    /// How the temporary backup is taken
    pub backup_method: BackupMethod,
    /// Per-step deadlines
    pub timeouts: Timeouts,
}

impl CloneClusterOptions {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("source name", &self.source_name),
            ("clone name", &self.clone_name),
            ("issuer", &self.issuer.name),
        ] {
            if value.is_empty() {
                return Err(Error::validation(
                    "CloneClusterOptions",
                    format!("{} is required", field),
                ));
            }
        }
        if self.source_name == self.clone_name {
            return Err(Error::validation(
                "CloneClusterOptions",
                "clone name must differ from the source cluster",
            ));
        }
        Ok(())
    }

    fn backup_name(&self) -> String {
        format!("{}-seed", self.clone_name)
    }
}

/// Name of the server certificate and its secret for a cluster
pub fn server_certificate_name(cluster: &str) -> String {
    format!("{}-server-tls", cluster)
}

/// Name of the superuser client certificate and its secret for a cluster
pub fn client_certificate_name(cluster: &str) -> String {
    format!("{}-{}-tls", cluster, SUPERUSER)
}

/// Name of the replication client certificate and its secret for a cluster
pub fn replication_certificate_name(cluster: &str) -> String {
    format!("{}-replication-tls", cluster)
}

/// In-cluster host name of a cluster's read-write service
pub fn rw_service_host(cluster: &str, namespace: &str) -> String {
    format!("{}-rw.{}.svc", cluster, namespace)
}

/// Server certificate covering every CNPG service of `cluster`
pub fn server_certificate(namespace: &str, cluster: &str, issuer: &IssuerRef) -> Certificate {
    let dns_names = SERVICE_ROLES
        .iter()
        .flat_map(|role| {
            let host = format!("{}-{}", cluster, role);
            [
                host.clone(),
                format!("{}.{}", host, namespace),
                format!("{}.{}.svc", host, namespace),
            ]
        })
        .collect();
    let name = server_certificate_name(cluster);
    Certificate {
        metadata: managed_metadata(&name, namespace, BTreeMap::new()),
        spec: CertificateSpec {
            secret_name: name,
            common_name: Some(format!("{}-rw", cluster)),
            dns_names,
            usages: vec!["server auth".to_string()],
            issuer_ref: issuer.clone(),
        },
        status: None,
    }
}

/// Client certificate authenticating as `user` against `cluster`
pub fn client_certificate(
    namespace: &str,
    name: &str,
    user: &str,
    issuer: &IssuerRef,
) -> Certificate {
    Certificate {
        metadata: managed_metadata(name, namespace, BTreeMap::new()),
        spec: CertificateSpec {
            secret_name: name.to_string(),
            common_name: Some(user.to_string()),
            dns_names: Vec::new(),
            usages: vec!["client auth".to_string()],
            issuer_ref: issuer.clone(),
        },
        status: None,
    }
}

fn source_labels(source: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CLONE_SOURCE.to_string(), source.to_string())])
}

fn seed_backup(options: &CloneClusterOptions) -> Backup {
    Backup {
        metadata: managed_metadata(
            options.backup_name(),
            &options.namespace,
            source_labels(&options.source_name),
        ),
        spec: BackupSpec {
            cluster: LocalObjectReference {
                name: options.source_name.clone(),
            },
            method: options.backup_method,
        },
        status: None,
    }
}

fn clone_spec(options: &CloneClusterOptions, source: &Cluster) -> Cluster {
    let recovery_target = options.recovery_target_time.map(|t| RecoveryTarget {
        target_time: Some(t.to_rfc3339_opts(SecondsFormat::Secs, true)),
    });
    Cluster {
        metadata: managed_metadata(
            &options.clone_name,
            &options.namespace,
            source_labels(&options.source_name),
        ),
        spec: ClusterSpec {
            instances: source.spec.instances,
            image_name: source.spec.image_name.clone(),
            storage: source.spec.storage.clone(),
            bootstrap: Some(BootstrapConfiguration {
                recovery: Some(BootstrapRecovery {
                    backup: Some(LocalObjectReference {
                        name: options.backup_name(),
                    }),
                    recovery_target,
                }),
            }),
            certificates: Some(CertificatesConfiguration {
                server_tls_secret: Some(server_certificate_name(&options.clone_name)),
                server_ca_secret: Some(server_certificate_name(&options.clone_name)),
                client_ca_secret: Some(client_certificate_name(&options.clone_name)),
                replication_tls_secret: Some(replication_certificate_name(&options.clone_name)),
            }),
        },
        status: None,
    }
}

/// A cluster clone and the certificates issued for it
///
/// Fields are set as each resource is created and cleared once it is
/// deleted, so [`ClonedCluster::delete`] only touches what exists.
pub struct ClonedCluster {
    namespace: String,
    name: String,
    cluster: Option<String>,
    server_certificate: Option<String>,
    client_certificate: Option<String>,
    replication_certificate: Option<String>,
    clusters: Arc<dyn DatabaseClusterOps>,
    certificates: Arc<dyn CertificateOps>,
}

impl std::fmt::Debug for ClonedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonedCluster")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("cluster", &self.cluster)
            .field("server_certificate", &self.server_certificate)
            .field("client_certificate", &self.client_certificate)
            .field("replication_certificate", &self.replication_certificate)
            .finish()
    }
}

impl ClonedCluster {
    fn new(
        namespace: &str,
        name: &str,
        clusters: Arc<dyn DatabaseClusterOps>,
        certificates: Arc<dyn CertificateOps>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cluster: None,
            server_certificate: None,
            client_certificate: None,
            replication_certificate: None,
            clusters,
            certificates,
        }
    }

    /// Clone cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Host name of the clone's read-write service
    pub fn rw_service_host(&self) -> String {
        rw_service_host(&self.name, &self.namespace)
    }

    /// Secret holding the superuser client certificate, key and CA
    pub fn client_secret_name(&self) -> String {
        client_certificate_name(&self.name)
    }

    /// Secret holding the server certificate
    pub fn server_secret_name(&self) -> String {
        server_certificate_name(&self.name)
    }

    /// Whether nothing recorded remains to be deleted
    pub fn is_empty(&self) -> bool {
        self.cluster.is_none()
            && self.server_certificate.is_none()
            && self.client_certificate.is_none()
            && self.replication_certificate.is_none()
    }

    /// Delete the cluster and its certificates.
    ///
    /// Every recorded resource is attempted; failures are aggregated and the
    /// failed resources stay recorded so a later call can retry them.
    #[instrument(skip(self, scope), fields(namespace = %self.namespace, name = %self.name))]
    pub async fn delete(&mut self, scope: &Scope) -> Result<()> {
        let mut errors = Vec::new();
        let ns = self.namespace.clone();

        if let Some(name) = self.cluster.clone() {
            let outcome = scope
                .run("delete cluster", self.clusters.delete_cluster(&ns, &name))
                .await
                .with_context(|| format!("delete cluster {}/{}", ns, name));
            settle(&mut self.cluster, outcome, &mut errors);
        }
        for slot in [
            &mut self.server_certificate,
            &mut self.client_certificate,
            &mut self.replication_certificate,
        ] {
            if let Some(name) = slot.clone() {
                let outcome = scope
                    .run(
                        "delete certificate",
                        self.certificates.delete_certificate(&ns, &name),
                    )
                    .await
                    .with_context(|| format!("delete certificate {}/{}", ns, name));
                settle(slot, outcome, &mut errors);
            }
        }

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => {
                info!("cluster clone deleted");
                Ok(())
            }
        }
    }
}

fn settle(slot: &mut Option<String>, outcome: Result<()>, errors: &mut Vec<Error>) {
    match outcome {
        Ok(()) => *slot = None,
        Err(e) => errors.push(e),
    }
}

/// Builds and tears down cluster clones
pub struct ClusterCloneManager {
    clusters: Arc<dyn DatabaseClusterOps>,
    certificates: Arc<dyn CertificateOps>,
}

impl ClusterCloneManager {
    /// Create a manager over the given API seams
    pub fn new(clusters: Arc<dyn DatabaseClusterOps>, certificates: Arc<dyn CertificateOps>) -> Self {
        Self {
            clusters,
            certificates,
        }
    }

    /// Clone a cluster, optionally to a point in time.
    ///
    /// Returns a ready clone or an error, never a partially built handle. The
    /// temporary backup is deleted on every path; if that deletion fails the
    /// otherwise-finished clone is deleted too and the failure returned.
    #[instrument(
        skip(self, scope, options),
        fields(namespace = %options.namespace, source = %options.source_name, clone = %options.clone_name)
    )]
    pub async fn clone_cluster(
        &self,
        scope: &Scope,
        options: &CloneClusterOptions,
    ) -> Result<ClonedCluster> {
        options.validate()?;
        let ns = options.namespace.as_str();
        let timeouts = &options.timeouts;

        self.certificates
            .wait_issuer_ready(scope, ns, &options.issuer, timeouts.resource_ready())
            .await
            .map_err(|e| {
                Error::precondition(
                    format!("issuer {}", options.issuer.name),
                    format!("not ready: {}", e),
                )
            })?;

        let source = self
            .clusters
            .get_cluster(ns, &options.source_name)
            .await?
            .ok_or_else(|| {
                Error::precondition(
                    format!("cluster {}/{}", ns, options.source_name),
                    "source cluster does not exist",
                )
            })?;
        let size = source.spec.storage.size.as_deref().ok_or_else(|| {
            Error::validation(
                format!("cluster {}/{}", ns, options.source_name),
                "spec.storage.size is not set",
            )
        })?;
        parse_bytes(size).with_context(|| format!("cluster {}/{} storage size", ns, options.source_name))?;

        let backup_name = options.backup_name();
        self.clusters
            .create_backup(ns, &seed_backup(options))
            .await
            .with_context(|| format!("create backup {}/{}", ns, backup_name))?;
        let delete_backup = Cleanup::new(|| self.clusters.delete_backup(ns, &backup_name))
            .context(format!("delete backup {}/{}", ns, backup_name))
            .timeout(timeouts.cleanup());

        let mut cloned = ClonedCluster::new(
            ns,
            &options.clone_name,
            self.clusters.clone(),
            self.certificates.clone(),
        );
        let mut result = self
            .build_clone(scope, options, &source, &mut cloned)
            .await;
        let built = result.is_ok();

        if !built {
            discard(&mut cloned, timeouts, scope, &mut result).await;
        }
        delete_backup.fold_into(scope, &mut result).await;
        if built && result.is_err() {
            discard(&mut cloned, timeouts, scope, &mut result).await;
        }

        result.map(|()| {
            info!("cluster clone ready");
            cloned
        })
    }

    async fn build_clone(
        &self,
        scope: &Scope,
        options: &CloneClusterOptions,
        source: &Cluster,
        cloned: &mut ClonedCluster,
    ) -> Result<()> {
        let ns = options.namespace.as_str();
        let timeouts = &options.timeouts;
        let backup_name = options.backup_name();

        self.clusters
            .wait_backup_ready(scope, ns, &backup_name, timeouts.backup_ready())
            .await
            .with_context(|| format!("wait for backup {}/{}", ns, backup_name))?;

        let ready = timeouts.resource_ready();
        let server = server_certificate(ns, &options.clone_name, &options.issuer);
        self.issue_certificate(scope, ns, &server, &mut cloned.server_certificate, ready)
            .await?;
        let client = client_certificate(
            ns,
            &client_certificate_name(&options.clone_name),
            SUPERUSER,
            &options.issuer,
        );
        self.issue_certificate(scope, ns, &client, &mut cloned.client_certificate, ready)
            .await?;
        let replication = client_certificate(
            ns,
            &replication_certificate_name(&options.clone_name),
            REPLICATION_USER,
            &options.issuer,
        );
        self.issue_certificate(
            scope,
            ns,
            &replication,
            &mut cloned.replication_certificate,
            ready,
        )
        .await?;

        self.clusters
            .create_cluster(ns, &clone_spec(options, source))
            .await
            .with_context(|| format!("create cluster {}/{}", ns, options.clone_name))?;
        cloned.cluster = Some(options.clone_name.clone());
        self.clusters
            .wait_cluster_ready(scope, ns, &options.clone_name, timeouts.cluster_ready())
            .await
            .with_context(|| format!("wait for cluster {}/{}", ns, options.clone_name))?;

        Ok(())
    }

    /// Create a certificate, record it in `slot` and wait until it is issued
    async fn issue_certificate(
        &self,
        scope: &Scope,
        ns: &str,
        certificate: &Certificate,
        slot: &mut Option<String>,
        timeout: Duration,
    ) -> Result<()> {
        let name = certificate.spec.secret_name.as_str();
        self.certificates
            .create_certificate(ns, certificate)
            .await
            .with_context(|| format!("create certificate {}/{}", ns, name))?;
        *slot = Some(name.to_string());
        self.certificates
            .wait_certificate_ready(scope, ns, name, timeout)
            .await
            .with_context(|| format!("wait for certificate {}/{}", ns, name))
    }
}

async fn discard(
    cloned: &mut ClonedCluster,
    timeouts: &Timeouts,
    scope: &Scope,
    result: &mut Result<()>,
) {
    let context = format!("delete cluster clone {}/{}", cloned.namespace, cloned.name);
    Cleanup::with_scope(move |s| async move { cloned.delete(&s).await })
        .context(context)
        .timeout(timeouts.cleanup())
        .fold_into(scope, result)
        .await;
}
