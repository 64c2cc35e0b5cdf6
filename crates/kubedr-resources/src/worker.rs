//! Disposable worker instances
//!
//! A worker is one restart-never pod running the kubedr worker image plus a
//! Service in front of it. The orchestrator may run outside the cluster, so
//! after the Service has a ready endpoint the manager searches for an
//! address it can actually reach, preferring DNS names (TLS verification is
//! done against them) over raw IPs.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use sha2::{Digest, Sha256};
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, instrument, warn};

use kubedr_common::kube_utils::managed_metadata;
use kubedr_common::{
    Cleanup, Error, Result, ResultExt, Scope, DEFAULT_PROBE_TIMEOUT, DEFAULT_WORKER_GRPC_PORT,
    LABEL_NAME, LABEL_WORKER,
};
use kubedr_proto::{
    DumpPostgresRequest, RestorePostgresRequest, SyncFilesRequest, SyncObjectStorageRequest,
    WorkerServiceClient,
};

use crate::ops::WorkloadOps;

/// Application name carried by every worker pod
pub const WORKER_APP_NAME: &str = "kubedr-worker";

/// Default worker readiness deadline
pub const DEFAULT_WORKER_READY_TIMEOUT: Duration = Duration::from_secs(300);

const WORKER_CONTAINER: &str = "worker";
const GRPC_PORT_NAME: &str = "grpc";
const NAME_SUFFIX_LEN: usize = 5;
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
/// Pod volume names are DNS labels
const MAX_VOLUME_NAME_LEN: usize = 63;
const VOLUME_HASH_BYTES: usize = 4;

/// `<prefix>-<5 random lowercase alphanumerics>`
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Pod volume name `<prefix>-<source>` made into a valid DNS label.
///
/// Sources that are too long, or that had to be rewritten (claim and secret
/// names may contain dots), are cut and suffixed with a SHA-256 prefix of
/// the original source so distinct sources keep distinct names.
pub fn volume_name(prefix: &str, source: &str) -> String {
    let label: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let name = format!("{}-{}", prefix, label.trim_matches('-'));
    if name.len() <= MAX_VOLUME_NAME_LEN && label == source {
        return name;
    }

    let digest = Sha256::digest(source.as_bytes());
    let hash: String = digest[..VOLUME_HASH_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    let keep = MAX_VOLUME_NAME_LEN - hash.len() - 1;
    let head = name[..name.len().min(keep)].trim_end_matches('-');
    format!("{}-{}", head, hash)
}

// =============================================================================
// Options
// =============================================================================

/// Backing store of a worker volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerVolumeSource {
    /// A persistent volume claim
    Pvc {
        /// Claim name
        claim_name: String,
    },
    /// A secret projected as files
    Secret {
        /// Secret name
        secret_name: String,
    },
}

/// A volume mounted into the worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerVolume {
    /// Pod-level volume name, unique per worker
    pub name: String,
    /// Mount path inside the worker container
    pub mount_path: String,
    /// Mount read-only
    pub read_only: bool,
    /// Where the data comes from
    pub source: WorkerVolumeSource,
}

impl WorkerVolume {
    /// Read-write claim mount
    pub fn pvc(name: impl Into<String>, claim: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: path.into(),
            read_only: false,
            source: WorkerVolumeSource::Pvc {
                claim_name: claim.into(),
            },
        }
    }

    /// Read-only secret mount
    pub fn secret(
        name: impl Into<String>,
        secret: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mount_path: path.into(),
            read_only: true,
            source: WorkerVolumeSource::Secret {
                secret_name: secret.into(),
            },
        }
    }

    /// Same mount, read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Everything needed to build one worker, accumulated across action setups
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Prefix of the generated pod and service name
    pub name_prefix: String,
    /// Namespace the worker runs in
    pub namespace: String,
    /// Worker container image
    pub image: String,
    /// gRPC port
    pub port: u16,
    /// Volumes to mount
    pub volumes: Vec<WorkerVolume>,
    /// Extra labels on the pod and service
    pub labels: BTreeMap<String, String>,
    /// Deadline for pod readiness and for endpoint readiness, each
    pub ready_timeout: Duration,
    /// Service type (ClusterIP, NodePort or LoadBalancer)
    pub service_type: String,
    /// DNS suffixes tried while looking for a reachable address
    pub search_domains: Vec<String>,
    /// Deadline for tearing the worker down after a failed creation
    pub cleanup_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name_prefix: WORKER_APP_NAME.to_string(),
            namespace: String::new(),
            image: String::new(),
            port: DEFAULT_WORKER_GRPC_PORT,
            volumes: Vec::new(),
            labels: BTreeMap::new(),
            ready_timeout: DEFAULT_WORKER_READY_TIMEOUT,
            service_type: "ClusterIP".to_string(),
            search_domains: Vec::new(),
            cleanup_timeout: kubedr_common::DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

impl WorkerOptions {
    /// Options for a worker in `namespace` running `image`
    pub fn new(namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Request a volume.
    ///
    /// Requesting the same volume twice is a no-op, so several actions can
    /// share one mount. A different request under an existing name, or a
    /// second volume at an occupied mount path, is rejected.
    pub fn add_volume(&mut self, volume: WorkerVolume) -> Result<()> {
        if let Some(existing) = self.volumes.iter().find(|v| v.name == volume.name) {
            if *existing == volume {
                return Ok(());
            }
            return Err(Error::validation(
                format!("worker volume {}", volume.name),
                format!(
                    "conflicting requests: {:?} vs {:?}",
                    existing.source, volume.source
                ),
            ));
        }
        if let Some(existing) = self.volumes.iter().find(|v| v.mount_path == volume.mount_path) {
            return Err(Error::validation(
                format!("worker volume {}", volume.name),
                format!("mount path {} already used by {}", volume.mount_path, existing.name),
            ));
        }
        self.volumes.push(volume);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation("WorkerOptions", "namespace is required"));
        }
        if self.image.is_empty() {
            return Err(Error::validation("WorkerOptions", "image is required"));
        }
        if self.port == 0 {
            return Err(Error::validation("WorkerOptions", "port must be non-zero"));
        }
        Ok(())
    }

    fn labels_for(&self, name: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_NAME.to_string(), WORKER_APP_NAME.to_string());
        labels.insert(LABEL_WORKER.to_string(), name.to_string());
        labels
    }
}

// =============================================================================
// Resource builders
// =============================================================================

/// Worker pod: one container serving gRPC with the requested mounts
pub fn build_worker_pod(name: &str, options: &WorkerOptions) -> Pod {
    let volumes = options
        .volumes
        .iter()
        .map(|v| match &v.source {
            WorkerVolumeSource::Pvc { claim_name } => Volume {
                name: v.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: Some(v.read_only),
                }),
                ..Default::default()
            },
            WorkerVolumeSource::Secret { secret_name } => Volume {
                name: v.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
        .collect();
    let mounts = options
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            mount_path: v.mount_path.clone(),
            read_only: Some(v.read_only),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: managed_metadata(name, &options.namespace, options.labels_for(name)),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: WORKER_CONTAINER.to_string(),
                image: Some(options.image.clone()),
                ports: Some(vec![ContainerPort {
                    name: Some(GRPC_PORT_NAME.to_string()),
                    container_port: i32::from(options.port),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(i32::from(options.port)),
                        ..Default::default()
                    }),
                    period_seconds: Some(2),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service selecting exactly one worker pod
pub fn build_worker_service(name: &str, options: &WorkerOptions) -> Service {
    Service {
        metadata: managed_metadata(name, &options.namespace, options.labels_for(name)),
        spec: Some(ServiceSpec {
            type_: Some(options.service_type.clone()),
            selector: Some(BTreeMap::from([(
                LABEL_WORKER.to_string(),
                name.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(GRPC_PORT_NAME.to_string()),
                port: i32::from(options.port),
                target_port: Some(IntOrString::Int(i32::from(options.port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Address discovery
// =============================================================================

/// Name resolution and TCP reachability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Resolve `host` (a DNS name or an IP literal) to socket addresses
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;

    /// Whether a TCP connection to `addr` succeeds
    async fn connect(&self, addr: SocketAddr) -> bool;
}

/// [`NetworkProbe`] over the tokio resolver and TCP stack
#[derive(Clone, Debug)]
pub struct TokioNetworkProbe {
    timeout: Duration,
}

impl Default for TokioNetworkProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl TokioNetworkProbe {
    /// Probe with a custom per-attempt timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NetworkProbe for TokioNetworkProbe {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let lookup = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, port)))
            .await
            .map_err(|_| Error::timeout(format!("dns {}", host), "lookup timed out"))?;
        let addrs = lookup.map_err(|e| Error::not_found(format!("dns {}", host), e.to_string()))?;
        Ok(addrs.collect())
    }

    async fn connect(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// DNS names to try for a service, most specific in-cluster forms first.
///
/// Outer loop over `["", ".<search domain>"...]`, inner loop over
/// `["", ".<ns>", ".<ns>.svc", ".<ns>.svc.cluster.local"]`.
pub fn candidate_names(service: &str, namespace: &str, search_domains: &[String]) -> Vec<String> {
    let parents = [
        String::new(),
        format!(".{}", namespace),
        format!(".{}.svc", namespace),
        format!(".{}.svc.cluster.local", namespace),
    ];
    let searches = std::iter::once(String::new())
        .chain(search_domains.iter().map(|d| format!(".{}", d.trim_start_matches('.'))));

    searches
        .flat_map(|search| {
            parents
                .iter()
                .map(move |parent| format!("{}{}{}", service, parent, search))
        })
        .collect()
}

fn fallback_hosts(service: &Service) -> Vec<String> {
    let mut hosts = Vec::new();
    if let Some(spec) = &service.spec {
        match &spec.cluster_ips {
            Some(ips) if !ips.is_empty() => hosts.extend(ips.iter().cloned()),
            _ => hosts.extend(spec.cluster_ip.iter().cloned()),
        }
    }
    hosts.retain(|ip| !ip.is_empty() && ip != "None");

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    if let Some(ingress) = ingress {
        hosts.extend(ingress.iter().filter_map(|i| i.ip.clone()));
        hosts.extend(ingress.iter().filter_map(|i| i.hostname.clone()));
    }
    hosts
}

async fn reachable<P: NetworkProbe + ?Sized>(probe: &P, host: &str, port: u16) -> bool {
    let addrs = match probe.resolve(host, port).await {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(host = %host, error = %e, "not resolvable");
            return false;
        }
    };
    for addr in addrs {
        if probe.connect(addr).await {
            return true;
        }
        debug!(host = %host, addr = %addr, "connect failed");
    }
    false
}

/// Find a host name or address of `service` that accepts TCP on `port`.
///
/// DNS candidates come first and the matching *name* is returned, since TLS
/// is verified against it. Then cluster IPs, then load-balancer IPs and
/// host names.
pub async fn find_reachable_service_address<P: NetworkProbe + ?Sized>(
    probe: &P,
    service: &Service,
    search_domains: &[String],
    port: u16,
) -> Result<String> {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();

    let candidates = candidate_names(&name, &namespace, search_domains)
        .into_iter()
        .chain(fallback_hosts(service));
    for host in candidates {
        if reachable(probe, &host, port).await {
            info!(service = %name, host = %host, "worker address found");
            return Ok(host);
        }
    }
    Err(Error::not_found(
        format!("service {}/{}", namespace, name),
        format!("no address reachable on port {}", port),
    ))
}

// =============================================================================
// RPC client
// =============================================================================

/// Worker RPCs as seen by actions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Dump databases into a worker directory
    async fn dump_postgres(&self, request: DumpPostgresRequest) -> Result<()>;

    /// Restore databases from a worker directory
    async fn restore_postgres(&self, request: RestorePostgresRequest) -> Result<()>;

    /// Copy between a worker directory and object storage
    async fn sync_object_storage(&self, request: SyncObjectStorageRequest) -> Result<()>;

    /// Copy between worker directories
    async fn sync_files(&self, request: SyncFilesRequest) -> Result<()>;

    /// Stop using the connection; later calls fail
    async fn close(&self) -> Result<()>;
}

/// [`WorkerClient`] over tonic
pub struct GrpcWorkerClient {
    inner: WorkerServiceClient,
    closed: AtomicBool,
}

impl GrpcWorkerClient {
    /// Wrap a connected service client
    pub fn new(inner: WorkerServiceClient) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    fn client(&self, operation: &str) -> Result<WorkerServiceClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::rpc(operation, "client is closed"));
        }
        Ok(self.inner.clone())
    }
}

fn status_error(operation: &str, status: tonic::Status) -> Error {
    Error::rpc(
        operation,
        format!("{:?}: {}", status.code(), status.message()),
    )
}

#[async_trait]
impl WorkerClient for GrpcWorkerClient {
    async fn dump_postgres(&self, request: DumpPostgresRequest) -> Result<()> {
        self.client("DumpPostgres")?
            .dump_postgres(request)
            .await
            .map_err(|s| status_error("DumpPostgres", s))?;
        Ok(())
    }

    async fn restore_postgres(&self, request: RestorePostgresRequest) -> Result<()> {
        self.client("RestorePostgres")?
            .restore_postgres(request)
            .await
            .map_err(|s| status_error("RestorePostgres", s))?;
        Ok(())
    }

    async fn sync_object_storage(&self, request: SyncObjectStorageRequest) -> Result<()> {
        self.client("SyncObjectStorage")?
            .sync_object_storage(request)
            .await
            .map_err(|s| status_error("SyncObjectStorage", s))?;
        Ok(())
    }

    async fn sync_files(&self, request: SyncFilesRequest) -> Result<()> {
        self.client("SyncFiles")?
            .sync_files(request)
            .await
            .map_err(|s| status_error("SyncFiles", s))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// PEM material for mutual TLS with the worker
#[derive(Clone)]
pub struct WorkerTls {
    /// CA that signed the worker's server certificate
    pub ca_pem: String,
    /// Client certificate presented to the worker
    pub cert_pem: String,
    /// Client private key
    pub key_pem: String,
}

impl std::fmt::Debug for WorkerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTls").finish_non_exhaustive()
    }
}

impl WorkerTls {
    /// tonic client config verifying the worker as `domain`
    pub fn to_tonic_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
            .domain_name(domain)
    }
}

/// Opens an RPC client to a discovered worker address
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    /// Connect to the worker at `host:port`
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn WorkerClient>>;
}

/// [`WorkerConnector`] producing [`GrpcWorkerClient`]s
#[derive(Clone, Debug)]
pub struct GrpcWorkerConnector {
    tls: Option<WorkerTls>,
    connect_timeout: Duration,
}

impl GrpcWorkerConnector {
    /// Plaintext when `tls` is `None`
    pub fn new(tls: Option<WorkerTls>) -> Self {
        Self {
            tls,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl WorkerConnector for GrpcWorkerConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn WorkerClient>> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let uri = format!("{}://{}:{}", scheme, host, port);
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::rpc("connect", format!("invalid uri {}: {}", uri, e)))?
            .connect_timeout(self.connect_timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.to_tonic_config(host))
                .map_err(|e| Error::rpc("connect", format!("tls config: {}", e)))?;
        }
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::rpc("connect", format!("{}: {}", uri, e)))?;
        debug!(uri = %uri, "connected to worker");
        Ok(Arc::new(GrpcWorkerClient::new(WorkerServiceClient::new(channel))))
    }
}

// =============================================================================
// Instances
// =============================================================================

/// What a pipeline needs from a provisioned worker
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Worker name
    fn name(&self) -> &str;

    /// RPC client, once connected and until closed
    fn client(&self) -> Option<Arc<dyn WorkerClient>>;

    /// Close and drop the RPC client
    async fn close_client(&mut self) -> Result<()>;

    /// Delete everything the worker owns
    async fn delete(&mut self, scope: &Scope) -> Result<()>;
}

/// Creates workers
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    /// Create a worker and wait until its RPC endpoint is reachable
    async fn provision(&self, scope: &Scope, options: &WorkerOptions)
        -> Result<Box<dyn WorkerHandle>>;
}

/// One worker pod, its service and its RPC client
pub struct WorkerInstance {
    name: String,
    namespace: String,
    pod: Option<String>,
    service: Option<String>,
    address: Option<String>,
    client: Option<Arc<dyn WorkerClient>>,
    workloads: Arc<dyn WorkloadOps>,
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("pod", &self.pod)
            .field("service", &self.service)
            .field("address", &self.address)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl WorkerInstance {
    fn new(name: String, namespace: String, workloads: Arc<dyn WorkloadOps>) -> Self {
        Self {
            name,
            namespace,
            pod: None,
            service: None,
            address: None,
            client: None,
            workloads,
        }
    }

    /// Reachable host the client is connected to
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Whether nothing recorded remains to be deleted
    pub fn is_empty(&self) -> bool {
        self.pod.is_none() && self.service.is_none() && self.client.is_none()
    }
}

#[async_trait]
impl WorkerHandle for WorkerInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> Option<Arc<dyn WorkerClient>> {
        self.client.clone()
    }

    async fn close_client(&mut self) -> Result<()> {
        if let Some(client) = &self.client {
            client.close().await?;
        }
        self.client = None;
        Ok(())
    }

    /// Close the client and delete the pod and service independently.
    ///
    /// Failures are aggregated; whatever failed stays recorded.
    #[instrument(skip(self, scope), fields(namespace = %self.namespace, name = %self.name))]
    async fn delete(&mut self, scope: &Scope) -> Result<()> {
        let ns = self.namespace.clone();
        let mut errors = Vec::new();

        if let Err(e) = self.close_client().await {
            errors.push(e.context(format!("close client of worker {}", self.name)));
        }
        if let Some(name) = self.pod.clone() {
            match scope
                .run("delete pod", self.workloads.delete_pod(&ns, &name))
                .await
                .with_context(|| format!("delete pod {}/{}", ns, name))
            {
                Ok(()) => self.pod = None,
                Err(e) => errors.push(e),
            }
        }
        if let Some(name) = self.service.clone() {
            match scope
                .run("delete service", self.workloads.delete_service(&ns, &name))
                .await
                .with_context(|| format!("delete service {}/{}", ns, name))
            {
                Ok(()) => self.service = None,
                Err(e) => errors.push(e),
            }
        }

        match Error::aggregate(errors) {
            Some(err) => {
                warn!(error = %err, "worker teardown incomplete");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Creates [`WorkerInstance`]s
pub struct WorkerManager {
    workloads: Arc<dyn WorkloadOps>,
    probe: Arc<dyn NetworkProbe>,
    connector: Arc<dyn WorkerConnector>,
}

impl WorkerManager {
    /// Create a manager over the given seams
    pub fn new(
        workloads: Arc<dyn WorkloadOps>,
        probe: Arc<dyn NetworkProbe>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        Self {
            workloads,
            probe,
            connector,
        }
    }

    /// Create a worker and connect to it.
    ///
    /// Any failure deletes whatever was created before the error is returned.
    #[instrument(skip(self, scope, options), fields(namespace = %options.namespace))]
    pub async fn create_worker_instance(
        &self,
        scope: &Scope,
        options: &WorkerOptions,
    ) -> Result<WorkerInstance> {
        options.validate()?;
        let name = generate_name(&options.name_prefix);
        let mut instance =
            WorkerInstance::new(name.clone(), options.namespace.clone(), self.workloads.clone());

        let mut result = self.start(scope, options, &mut instance).await;
        if result.is_err() {
            let target = &mut instance;
            Cleanup::with_scope(move |s| async move { target.delete(&s).await })
                .context(format!("delete worker {}/{}", options.namespace, name))
                .timeout(options.cleanup_timeout)
                .fold_into(scope, &mut result)
                .await;
        }
        result.map(|()| {
            info!(worker = %instance.name, address = ?instance.address, "worker ready");
            instance
        })
    }

    async fn start(
        &self,
        scope: &Scope,
        options: &WorkerOptions,
        instance: &mut WorkerInstance,
    ) -> Result<()> {
        let ns = options.namespace.as_str();
        let name = instance.name.clone();

        self.workloads
            .create_pod(ns, &build_worker_pod(&name, options))
            .await
            .with_context(|| format!("create pod {}/{}", ns, name))?;
        instance.pod = Some(name.clone());
        self.workloads
            .wait_pod_ready(scope, ns, &name, options.ready_timeout)
            .await
            .with_context(|| format!("wait for pod {}/{}", ns, name))?;

        self.workloads
            .create_service(ns, &build_worker_service(&name, options))
            .await
            .with_context(|| format!("create service {}/{}", ns, name))?;
        instance.service = Some(name.clone());
        self.workloads
            .wait_endpoints_ready(scope, ns, &name, options.ready_timeout)
            .await
            .with_context(|| format!("wait for endpoints {}/{}", ns, name))?;

        let service = self.workloads.get_service(ns, &name).await?;
        let host = scope
            .run(
                "find worker address",
                find_reachable_service_address(
                    self.probe.as_ref(),
                    &service,
                    &options.search_domains,
                    options.port,
                ),
            )
            .await?;
        let client = scope
            .run("connect to worker", self.connector.connect(&host, options.port))
            .await?;
        instance.address = Some(host);
        instance.client = Some(client);
        Ok(())
    }
}

#[async_trait]
impl WorkerProvisioner for WorkerManager {
    async fn provision(
        &self,
        scope: &Scope,
        options: &WorkerOptions,
    ) -> Result<Box<dyn WorkerHandle>> {
        let instance = self.create_worker_instance(scope, options).await?;
        Ok(Box::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::*;

    use super::*;
    use crate::ops::MockWorkloadOps;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 50051)
    }

    fn service(cluster_ip: Option<&str>, lb: Option<LoadBalancerIngress>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(str::to_string),
                ..Default::default()
            }),
            status: lb.map(|ingress| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![ingress]),
                }),
                ..Default::default()
            }),
        }
    }

    /// Probe where only `host` resolves, and it accepts connections
    fn probe_reaching(host: &'static str) -> MockNetworkProbe {
        let mut probe = MockNetworkProbe::new();
        probe.expect_resolve().returning(move |h, _| {
            if h == host {
                Ok(vec![addr(7)])
            } else {
                Err(Error::not_found(format!("dns {}", h), "NXDOMAIN"))
            }
        });
        probe.expect_connect().returning(|_| true);
        probe
    }

    // ==========================================================================
    // Story: Address discovery
    // ==========================================================================

    #[test]
    fn candidates_try_in_cluster_forms_before_search_domains() {
        let names = candidate_names("svc", "ns", &["example.com".to_string()]);
        assert_eq!(
            names,
            vec![
                "svc",
                "svc.ns",
                "svc.ns.svc",
                "svc.ns.svc.cluster.local",
                "svc.example.com",
                "svc.ns.example.com",
                "svc.ns.svc.example.com",
                "svc.ns.svc.cluster.local.example.com",
            ]
        );
    }

    #[tokio::test]
    async fn story_first_reachable_dns_name_is_returned() {
        let probe = probe_reaching("svc.ns.svc");
        let host = find_reachable_service_address(
            &probe,
            &service(Some("10.96.0.12"), None),
            &["example.com".to_string()],
            50051,
        )
        .await
        .unwrap();
        assert_eq!(host, "svc.ns.svc");
    }

    #[tokio::test]
    async fn resolvable_but_closed_names_are_skipped() {
        let mut probe = MockNetworkProbe::new();
        probe.expect_resolve().returning(|h, _| match h {
            "svc" => Ok(vec![addr(1)]),
            "svc.ns" => Ok(vec![addr(2)]),
            _ => Err(Error::not_found(h, "NXDOMAIN")),
        });
        probe
            .expect_connect()
            .returning(|a| a == SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 50051));

        let host = find_reachable_service_address(&probe, &service(None, None), &[], 50051)
            .await
            .unwrap();
        assert_eq!(host, "svc.ns");
    }

    #[tokio::test]
    async fn story_cluster_ip_is_the_first_fallback() {
        let probe = probe_reaching("10.96.0.12");
        let lb = LoadBalancerIngress {
            ip: Some("203.0.113.9".to_string()),
            ..Default::default()
        };
        let host =
            find_reachable_service_address(&probe, &service(Some("10.96.0.12"), Some(lb)), &[], 50051)
                .await
                .unwrap();
        assert_eq!(host, "10.96.0.12");
    }

    #[tokio::test]
    async fn load_balancer_hostname_is_the_last_fallback() {
        let probe = probe_reaching("lb.example.net");
        let lb = LoadBalancerIngress {
            hostname: Some("lb.example.net".to_string()),
            ..Default::default()
        };
        let host =
            find_reachable_service_address(&probe, &service(Some("None"), Some(lb)), &[], 50051)
                .await
                .unwrap();
        assert_eq!(host, "lb.example.net");
    }

    #[tokio::test]
    async fn nothing_reachable_is_not_found() {
        let mut probe = MockNetworkProbe::new();
        probe
            .expect_resolve()
            .returning(|h, _| Err(Error::not_found(h, "NXDOMAIN")));
        probe.expect_connect().times(0);

        let err = find_reachable_service_address(&probe, &service(None, None), &[], 50051)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // ==========================================================================
    // Story: Volume requests
    // ==========================================================================

    #[test]
    fn story_identical_volume_requests_are_merged() {
        let mut options = WorkerOptions::new("ns", "kubedr/worker:1");
        options.add_volume(WorkerVolume::pvc("dr", "dr-claim", "/dr")).unwrap();
        options.add_volume(WorkerVolume::pvc("dr", "dr-claim", "/dr")).unwrap();
        assert_eq!(options.volumes.len(), 1);
    }

    #[test]
    fn conflicting_volume_requests_are_rejected() {
        let mut options = WorkerOptions::new("ns", "kubedr/worker:1");
        options.add_volume(WorkerVolume::pvc("dr", "dr-claim", "/dr")).unwrap();

        let err = options
            .add_volume(WorkerVolume::pvc("dr", "other-claim", "/dr"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = options
            .add_volume(WorkerVolume::secret("tls", "db-tls", "/dr"))
            .unwrap_err();
        assert!(err.to_string().contains("mount path /dr"));
        assert_eq!(options.volumes.len(), 1);
    }

    // ==========================================================================
    // Story: Worker resources
    // ==========================================================================

    #[test]
    fn worker_pod_never_restarts_and_mounts_requested_volumes() {
        let mut options = WorkerOptions::new("ns", "kubedr/worker:1");
        options.add_volume(WorkerVolume::pvc("dr", "dr-claim", "/dr")).unwrap();
        options
            .add_volume(WorkerVolume::secret("tls", "db-tls", "/tls/db"))
            .unwrap();

        let pod = build_worker_pod("kubedr-worker-ab12c", &options);
        let labels = pod.metadata.labels.clone().unwrap();
        assert_eq!(labels.get(LABEL_WORKER).unwrap(), "kubedr-worker-ab12c");
        assert_eq!(labels.get(LABEL_NAME).unwrap(), WORKER_APP_NAME);

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
        let container = &spec.containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 50051);
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[1].mount_path, "/tls/db");
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[test]
    fn worker_service_selects_only_its_pod() {
        let options = WorkerOptions::new("ns", "kubedr/worker:1");
        let svc = build_worker_service("kubedr-worker-ab12c", &options);
        let spec = svc.spec.unwrap();
        assert_eq!(
            spec.selector.unwrap(),
            BTreeMap::from([(LABEL_WORKER.to_string(), "kubedr-worker-ab12c".to_string())])
        );
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn volume_names_stay_valid_dns_labels() {
        assert_eq!(volume_name("tls", "db-postgres-tls"), "tls-db-postgres-tls");

        let long = format!("billing-{}-client-tls", "x".repeat(70));
        let name = volume_name("tls", &long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("tls-billing-xxx"));
        assert!(name.rsplit('-').next().unwrap().len() == 8);

        let other = format!("billing-{}-server-tls", "x".repeat(70));
        assert_ne!(volume_name("tls", &other), name);

        let dotted = volume_name("src", "data.v1");
        assert!(dotted.starts_with("src-data-v1-"));
        assert_ne!(dotted, volume_name("src", "data-v1"));
        assert!(!dotted.contains('.'));
    }

    #[test]
    fn generated_names_have_a_lowercase_suffix() {
        let name = generate_name("kubedr-worker");
        let suffix = name.strip_prefix("kubedr-worker-").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    // ==========================================================================
    // Story: Worker lifecycle
    // ==========================================================================

    fn workloads_until_endpoints(endpoints: Result<()>) -> MockWorkloadOps {
        let mut workloads = MockWorkloadOps::new();
        workloads
            .expect_create_pod()
            .times(1)
            .returning(|_, p| Ok(p.clone()));
        workloads
            .expect_wait_pod_ready()
            .returning(|_, _, _, _| Ok(()));
        workloads
            .expect_create_service()
            .times(1)
            .returning(|_, s| Ok(s.clone()));
        workloads
            .expect_wait_endpoints_ready()
            .return_once(move |_, _, _, _| endpoints);
        workloads
    }

    #[tokio::test]
    async fn story_worker_is_created_connected_and_deleted_once() {
        let mut workloads = workloads_until_endpoints(Ok(()));
        workloads.expect_get_service().returning(|ns, name| {
            let mut svc = service(None, None);
            svc.metadata.name = Some(name.to_string());
            svc.metadata.namespace = Some(ns.to_string());
            Ok(svc)
        });
        workloads
            .expect_delete_pod()
            .times(1)
            .returning(|_, _| Ok(()));
        workloads
            .expect_delete_service()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut probe = MockNetworkProbe::new();
        probe
            .expect_resolve()
            .returning(|h, _| {
                if h.ends_with(".ns.svc") {
                    Ok(vec![addr(3)])
                } else {
                    Err(Error::not_found(h, "NXDOMAIN"))
                }
            });
        probe.expect_connect().returning(|_| true);

        let mut client = MockWorkerClient::new();
        client.expect_close().times(1).returning(|| Ok(()));
        let mut connector = MockWorkerConnector::new();
        connector
            .expect_connect()
            .withf(|host, port| host.ends_with(".ns.svc") && *port == 50051)
            .times(1)
            .return_once(move |_, _| Ok(Arc::new(client) as Arc<dyn WorkerClient>));

        let manager = WorkerManager::new(Arc::new(workloads), Arc::new(probe), Arc::new(connector));
        let mut instance = manager
            .create_worker_instance(&Scope::background(), &WorkerOptions::new("ns", "kubedr/worker:1"))
            .await
            .unwrap();

        assert!(instance.name().starts_with("kubedr-worker-"));
        assert!(instance.client().is_some());
        assert!(instance.address().unwrap().ends_with(".ns.svc"));

        instance.delete(&Scope::background()).await.unwrap();
        instance.delete(&Scope::background()).await.unwrap();
        assert!(instance.is_empty());
    }

    #[tokio::test]
    async fn story_endpoint_timeout_deletes_pod_and_service() {
        let mut workloads = workloads_until_endpoints(Err(Error::timeout(
            "Endpoints/kubedr-worker",
            "deadline exceeded",
        )));
        workloads
            .expect_delete_pod()
            .with(eq("ns"), always())
            .times(1)
            .returning(|_, _| Ok(()));
        workloads
            .expect_delete_service()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut connector = MockWorkerConnector::new();
        connector.expect_connect().times(0);

        let manager = WorkerManager::new(
            Arc::new(workloads),
            Arc::new(MockNetworkProbe::new()),
            Arc::new(connector),
        );
        let err = manager
            .create_worker_instance(&Scope::background(), &WorkerOptions::new("ns", "kubedr/worker:1"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.errors().len(), 1);
    }

    #[tokio::test]
    async fn teardown_failures_are_aggregated_with_the_original() {
        let mut workloads = workloads_until_endpoints(Err(Error::internal("endpoints gone")));
        workloads
            .expect_delete_pod()
            .returning(|_, _| Err(Error::internal("pod delete refused")));
        workloads
            .expect_delete_service()
            .returning(|_, _| Err(Error::internal("service delete refused")));

        let manager = WorkerManager::new(
            Arc::new(workloads),
            Arc::new(MockNetworkProbe::new()),
            Arc::new(MockWorkerConnector::new()),
        );
        let err = manager
            .create_worker_instance(&Scope::background(), &WorkerOptions::new("ns", "kubedr/worker:1"))
            .await
            .unwrap_err();

        assert_eq!(err.errors().len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("endpoints gone"));
        assert!(msg.contains("pod delete refused"));
        assert!(msg.contains("service delete refused"));
    }

    #[tokio::test]
    async fn missing_image_is_rejected_before_anything_is_created() {
        let mut workloads = MockWorkloadOps::new();
        workloads.expect_create_pod().times(0);
        let manager = WorkerManager::new(
            Arc::new(workloads),
            Arc::new(MockNetworkProbe::new()),
            Arc::new(MockWorkerConnector::new()),
        );
        let err = manager
            .create_worker_instance(&Scope::background(), &WorkerOptions::new("ns", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn closed_grpc_client_rejects_calls() {
        let channel = tonic::transport::Channel::from_static("http://127.0.0.1:1").connect_lazy();
        let client = GrpcWorkerClient::new(WorkerServiceClient::new(channel));
        client.close().await.unwrap();

        let err = client
            .sync_files(SyncFilesRequest::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
