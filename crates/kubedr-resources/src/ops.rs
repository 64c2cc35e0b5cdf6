//! Cluster API seams
//!
//! Every lifecycle manager reaches the API server through these traits so the
//! orchestration logic can be tested against mocks. [`KubeOps`] is the real
//! implementation backed by kube-rs; its waits go through
//! [`kubedr_common::wait_for`], and its deletes treat "already gone" as
//! success.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use kubedr_common::kube_utils::{delete_if_exists, has_condition, CONDITION_READY};
use kubedr_common::{wait_for, Error, Result, Scope};

use crate::crd::{
    backup_completed, certificate_ready, cluster_healthy, cluster_issuer_ready, issuer_ready,
    snapshot_ready, Backup, Certificate, Cluster, ClusterIssuer, Issuer, IssuerRef,
    VolumeSnapshot,
};

/// Pod phases after which a restart-never pod can no longer become ready
const TERMINAL_POD_PHASES: [&str; 2] = ["Failed", "Succeeded"];

/// CNPG clusters and backups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseClusterOps: Send + Sync {
    /// Read a cluster, `None` when it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Create a cluster
    async fn create_cluster(&self, namespace: &str, cluster: &Cluster) -> Result<Cluster>;

    /// Wait until the cluster is healthy
    async fn wait_cluster_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Delete a cluster (absent is success)
    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a one-off backup
    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<Backup>;

    /// Wait until the backup completed; a failed backup is an error
    async fn wait_backup_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Delete a backup (absent is success)
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()>;
}

/// cert-manager certificates and issuers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateOps: Send + Sync {
    /// Wait until the referenced Issuer or ClusterIssuer is ready
    async fn wait_issuer_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        issuer: &IssuerRef,
        timeout: Duration,
    ) -> Result<()>;

    /// Create a certificate
    async fn create_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<Certificate>;

    /// Wait until the certificate has been issued
    async fn wait_certificate_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Delete a certificate (absent is success)
    async fn delete_certificate(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Persistent volume claims and CSI snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeOps: Send + Sync {
    /// Read a claim, `None` when it does not exist
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Delete a claim (absent is success)
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a snapshot
    async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot>;

    /// Wait until the snapshot is ready to use and return it
    async fn wait_snapshot_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<VolumeSnapshot>;

    /// Delete a snapshot (absent is success)
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Worker pods and services
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadOps: Send + Sync {
    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Wait until the pod is Ready; a terminated pod is an error
    async fn wait_pod_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Delete a pod (absent is success)
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    /// Read a service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Wait until the service's endpoints have at least one ready address
    async fn wait_endpoints_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Delete a service (absent is success)
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Ready once the pod reports the Ready condition
pub fn pod_ready(pod: &Pod) -> Result<Option<()>> {
    let Some(status) = &pod.status else {
        return Ok(None);
    };
    if let Some(phase) = status.phase.as_deref() {
        if TERMINAL_POD_PHASES.contains(&phase) {
            return Err(Error::precondition(
                format!(
                    "pod {}",
                    pod.metadata.name.as_deref().unwrap_or_default()
                ),
                format!("pod terminated with phase {}", phase),
            ));
        }
    }
    Ok(has_condition(status.conditions.as_deref(), CONDITION_READY).then_some(()))
}

/// Ready once at least one subset has a ready address
pub fn endpoints_ready(endpoints: &Endpoints) -> Result<Option<()>> {
    let ready = endpoints
        .subsets
        .iter()
        .flatten()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()));
    Ok(ready.then_some(()))
}

/// [`DatabaseClusterOps`], [`CertificateOps`], [`VolumeOps`] and [`WorkloadOps`]
/// against a live API server
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create<K>(&self, namespace: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let created = self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?;
        info!(
            kind = %K::kind(&()),
            namespace = %namespace,
            name = %created.meta().name.as_deref().unwrap_or_default(),
            "created"
        );
        Ok(created)
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        delete_if_exists(&self.api::<K>(namespace), name).await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseClusterOps for KubeOps {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        Ok(self.api::<Cluster>(namespace).get_opt(name).await?)
    }

    async fn create_cluster(&self, namespace: &str, cluster: &Cluster) -> Result<Cluster> {
        self.create(namespace, cluster).await
    }

    async fn wait_cluster_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api::<Cluster>(namespace);
        wait_for(scope, &api, name, timeout, cluster_healthy).await
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Cluster>(namespace, name).await
    }

    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<Backup> {
        self.create(namespace, backup).await
    }

    async fn wait_backup_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api::<Backup>(namespace);
        wait_for(scope, &api, name, timeout, backup_completed).await
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Backup>(namespace, name).await
    }
}

#[async_trait]
impl CertificateOps for KubeOps {
    async fn wait_issuer_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        issuer: &IssuerRef,
        timeout: Duration,
    ) -> Result<()> {
        if issuer.is_cluster_scoped() {
            let api: Api<ClusterIssuer> = Api::all(self.client.clone());
            wait_for(scope, &api, &issuer.name, timeout, cluster_issuer_ready).await
        } else {
            let api = self.api::<Issuer>(namespace);
            wait_for(scope, &api, &issuer.name, timeout, issuer_ready).await
        }
    }

    async fn create_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<Certificate> {
        self.create(namespace, certificate).await
    }

    async fn wait_certificate_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api::<Certificate>(namespace);
        wait_for(scope, &api, name, timeout, certificate_ready).await
    }

    async fn delete_certificate(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Certificate>(namespace, name).await
    }
}

#[async_trait]
impl VolumeOps for KubeOps {
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .api::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.create(namespace, pvc).await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<PersistentVolumeClaim>(namespace, name).await
    }

    async fn create_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot> {
        self.create(namespace, snapshot).await
    }

    async fn wait_snapshot_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<VolumeSnapshot> {
        let api = self.api::<VolumeSnapshot>(namespace);
        wait_for(scope, &api, name, timeout, snapshot_ready).await
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<VolumeSnapshot>(namespace, name).await
    }
}

#[async_trait]
impl WorkloadOps for KubeOps {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.create(namespace, pod).await
    }

    async fn wait_pod_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api::<Pod>(namespace);
        wait_for(scope, &api, name, timeout, pod_ready).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Pod>(namespace, name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        self.create(namespace, service).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        Ok(self.api::<Service>(namespace).get(name).await?)
    }

    async fn wait_endpoints_ready(
        &self,
        scope: &Scope,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api::<Endpoints>(namespace);
        wait_for(scope, &api, name, timeout, endpoints_ready).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Service>(namespace, name).await
    }
}
