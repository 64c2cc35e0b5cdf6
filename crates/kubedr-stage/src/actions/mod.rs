//! Recipe actions
//!
//! Every action writes to or reads from the DR volume, mounted at
//! [`DR_MOUNT_PATH`] on the shared worker. Layout on the volume:
//!
//! ```text
//! /dr/clusters/<cluster>/   one dump file per database
//! /dr/volumes/<pvc>/        file-level copy of a claim
//! ```

mod cluster_backup;
mod cluster_restore;
mod object_storage;
mod volume_backup;

pub use cluster_backup::{ClusterBackupAction, ClusterBackupConfig};
pub use cluster_restore::{ClusterRestoreAction, ClusterRestoreConfig};
pub use object_storage::{ObjectStorageSyncAction, ObjectStorageSyncConfig};
pub use volume_backup::{VolumeBackupAction, VolumeBackupConfig};

use kubedr_common::{Error, Result};
use kubedr_proto::PostgresTls;
use kubedr_resources::worker::{volume_name, WorkerVolume};

/// Worker volume name of the DR volume
pub const DR_VOLUME: &str = "dr";

/// Where the DR volume is mounted on the worker
pub const DR_MOUNT_PATH: &str = "/dr";

/// The DR volume mount shared by every action
pub fn dr_volume(claim: &str) -> WorkerVolume {
    WorkerVolume::pvc(DR_VOLUME, claim, DR_MOUNT_PATH)
}

/// Dump directory of a database cluster on the worker
pub fn cluster_dump_dir(cluster: &str) -> String {
    format!("{}/clusters/{}", DR_MOUNT_PATH, cluster)
}

/// Copy directory of a volume on the worker
pub fn volume_copy_dir(pvc: &str) -> String {
    format!("{}/volumes/{}", DR_MOUNT_PATH, pvc)
}

/// Bucket and key prefix of an `s3://bucket/prefix` URL
pub fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::validation(format!("url {}", url), "expected s3://bucket/prefix"))?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::validation(format!("url {}", url), "bucket is empty"));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// Secret mount for a cert-manager client certificate
fn tls_volume(secret: &str) -> (WorkerVolume, PostgresTls) {
    let path = format!("/tls/{}", secret);
    let tls = PostgresTls {
        client_cert_path: format!("{}/tls.crt", path),
        client_key_path: format!("{}/tls.key", path),
        ca_cert_path: format!("{}/ca.crt", path),
    };
    (WorkerVolume::secret(volume_name("tls", secret), secret, path), tls)
}

fn require(resource: &str, fields: &[(&str, &str)]) -> Result<()> {
    for (field, value) in fields {
        if value.is_empty() {
            return Err(Error::validation(resource, format!("{} is required", field)));
        }
    }
    Ok(())
}
