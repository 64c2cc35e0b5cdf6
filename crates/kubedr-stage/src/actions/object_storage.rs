//! Transfer between the DR volume and an S3-compatible bucket

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kubedr_common::{Error, Result, Scope};
use kubedr_proto::{SyncDirection, SyncObjectStorageRequest};
use kubedr_resources::worker::{WorkerClient, WorkerOptions, WorkerVolume};

use super::{dr_volume, parse_s3_url, require, DR_MOUNT_PATH};
use crate::stage::Action;

const CREDENTIALS_VOLUME: &str = "object-storage-credentials";
const CREDENTIALS_PATH: &str = "/credentials/object-storage";

/// Where to copy, and which way
#[derive(Clone, Debug)]
pub struct ObjectStorageSyncConfig {
    /// Upload or download
    pub direction: SyncDirection,
    /// DR volume claim
    pub dr_claim: String,
    /// Directory relative to the DR volume root; empty means the whole volume
    pub local_subdir: String,
    /// `s3://bucket/prefix`
    pub remote_url: String,
    /// Secret holding the access key files
    pub credentials_secret: String,
    /// Custom endpoint for non-AWS stores
    pub endpoint: Option<String>,
    /// Bucket region
    pub region: Option<String>,
}

impl ObjectStorageSyncConfig {
    fn local_path(&self) -> String {
        let sub = self.local_subdir.trim_matches('/');
        if sub.is_empty() {
            DR_MOUNT_PATH.to_string()
        } else {
            format!("{}/{}", DR_MOUNT_PATH, sub)
        }
    }
}

/// Syncs the DR volume with object storage; creates nothing in the cluster
pub struct ObjectStorageSyncAction {
    config: ObjectStorageSyncConfig,
}

impl ObjectStorageSyncAction {
    /// Create the action
    pub fn new(config: ObjectStorageSyncConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Action for ObjectStorageSyncAction {
    async fn validate(&self, _scope: &Scope) -> Result<()> {
        let c = &self.config;
        require(
            "ObjectStorageSyncConfig",
            &[
                ("DR claim", &c.dr_claim),
                ("credentials secret", &c.credentials_secret),
            ],
        )?;
        if c.direction == SyncDirection::Unspecified {
            return Err(Error::validation(
                "ObjectStorageSyncConfig",
                "direction must be upload or download",
            ));
        }
        if c.local_subdir.split('/').any(|part| part == "..") {
            return Err(Error::validation(
                "ObjectStorageSyncConfig",
                "local path must stay inside the DR volume",
            ));
        }
        parse_s3_url(&c.remote_url)?;
        Ok(())
    }

    async fn setup(&mut self, _scope: &Scope, worker: &mut WorkerOptions) -> Result<()> {
        worker.add_volume(dr_volume(&self.config.dr_claim))?;
        worker.add_volume(WorkerVolume::secret(
            CREDENTIALS_VOLUME,
            &self.config.credentials_secret,
            CREDENTIALS_PATH,
        ))?;
        Ok(())
    }

    async fn execute(&mut self, _scope: &Scope, client: Arc<dyn WorkerClient>) -> Result<()> {
        let c = &self.config;
        let local_path = c.local_path();
        info!(
            direction = c.direction.as_str_name(),
            local_path = %local_path,
            remote_url = %c.remote_url,
            "syncing object storage"
        );
        client
            .sync_object_storage(SyncObjectStorageRequest {
                direction: c.direction as i32,
                local_path,
                remote_url: c.remote_url.clone(),
                credentials_dir: CREDENTIALS_PATH.to_string(),
                endpoint: c.endpoint.clone().unwrap_or_default(),
                region: c.region.clone().unwrap_or_default(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::mocks::MockWorker;

    fn config(direction: SyncDirection) -> ObjectStorageSyncConfig {
        ObjectStorageSyncConfig {
            direction,
            dr_claim: "dr-claim".to_string(),
            local_subdir: String::new(),
            remote_url: "s3://dr-bucket/billing".to_string(),
            credentials_secret: "s3-creds".to_string(),
            endpoint: Some("https://minio.storage:9000".to_string()),
            region: None,
        }
    }

    #[tokio::test]
    async fn unspecified_direction_and_bad_urls_fail_validation() {
        let action = ObjectStorageSyncAction::new(config(SyncDirection::Unspecified));
        assert!(action.validate(&Scope::background()).await.is_err());

        let mut bad = config(SyncDirection::Upload);
        bad.remote_url = "dr-bucket/billing".to_string();
        let action = ObjectStorageSyncAction::new(bad);
        assert!(action.validate(&Scope::background()).await.is_err());

        let mut escaping = config(SyncDirection::Upload);
        escaping.local_subdir = "../etc".to_string();
        let action = ObjectStorageSyncAction::new(escaping);
        assert!(action.validate(&Scope::background()).await.is_err());
    }

    #[tokio::test]
    async fn story_upload_sends_the_whole_dr_volume() {
        let mut action = ObjectStorageSyncAction::new(config(SyncDirection::Upload));
        let scope = Scope::background();
        action.validate(&scope).await.unwrap();

        let mut worker = WorkerOptions::new("dr", "kubedr/worker:1");
        action.setup(&scope, &mut worker).await.unwrap();
        assert_eq!(worker.volumes.len(), 2);
        assert!(action.as_cleanup().is_none());

        let mut client = MockWorker::new();
        client
            .expect_sync_object_storage()
            .withf(|req| {
                req.direction == SyncDirection::Upload as i32
                    && req.local_path == "/dr"
                    && req.remote_url == "s3://dr-bucket/billing"
                    && req.credentials_dir == "/credentials/object-storage"
                    && req.endpoint == "https://minio.storage:9000"
                    && req.region.is_empty()
            })
            .times(1)
            .returning(|_| Ok(()));
        action.execute(&scope, Arc::new(client)).await.unwrap();
    }

    #[test]
    fn local_subdir_is_joined_under_the_mount() {
        let mut c = config(SyncDirection::Download);
        c.local_subdir = "/clusters/db/".to_string();
        assert_eq!(c.local_path(), "/dr/clusters/db");
    }
}
