//! Small helpers over kube-rs shared by the resource managers

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::is_kube_not_found;
use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBEDR};

/// Condition type reported by CloudNativePG, cert-manager and pods alike
pub const CONDITION_READY: &str = "Ready";
/// Condition status meaning the condition holds
pub const STATUS_TRUE: &str = "True";

/// TCP connect limit for API server connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-request read limit. Watches ask the server to close them sooner.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A `{type, status}` status condition, whatever API group it comes from
pub trait StatusCondition {
    /// The condition's `type`
    fn condition_type(&self) -> &str;
    /// The condition's `status`, `"True"`, `"False"` or `"Unknown"`
    fn condition_status(&self) -> &str;
}

impl StatusCondition for PodCondition {
    fn condition_type(&self) -> &str {
        &self.type_
    }
    fn condition_status(&self) -> &str {
        &self.status
    }
}

/// Whether `conditions` holds a `condition_type` condition with status `True`
pub fn has_condition<T: StatusCondition>(conditions: Option<&[T]>, condition_type: &str) -> bool {
    conditions.unwrap_or_default().iter().any(|c| {
        c.condition_type() == condition_type && c.condition_status() == STATUS_TRUE
    })
}

/// Metadata for a resource created by kubedr, carrying the managed-by label
pub fn managed_metadata(
    name: impl Into<String>,
    namespace: impl Into<String>,
    extra_labels: BTreeMap<String, String>,
) -> ObjectMeta {
    let mut labels = extra_labels;
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_KUBEDR.to_string(),
    );
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Delete a resource, treating "already gone" as success.
///
/// Returns whether anything was deleted.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool, Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(kind = %K::kind(&()), name = %name, "deleted");
            Ok(true)
        }
        Err(e) if is_kube_not_found(&e) => {
            debug!(name = %name, "already deleted");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Client for the cluster named by `kubeconfig`, or the in-cluster / default
/// kubeconfig when `None`
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = load_config(kubeconfig).await?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::internal_with_context("kube client", e.to_string()))
}

async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    let Some(path) = kubeconfig else {
        return Config::infer()
            .await
            .map_err(|e| Error::internal_with_context("kube config", e.to_string()));
    };
    let context = format!("kubeconfig {}", path.display());
    let raw = Kubeconfig::read_from(path)
        .map_err(|e| Error::internal_with_context(context.clone(), e.to_string()))?;
    Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::internal_with_context(context, e.to_string()))
}
