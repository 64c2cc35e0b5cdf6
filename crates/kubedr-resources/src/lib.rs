//! Lifecycle managers for the short-lived resources of a kubedr workflow
//!
//! Everything created here is torn down by the caller through the returned
//! handle, and every multi-step creation deletes its own partial work when a
//! later step fails.

#![deny(missing_docs)]

pub mod cluster_clone;
pub mod crd;
pub mod ops;
pub mod volume;
pub mod worker;

pub use cluster_clone::{CloneClusterOptions, ClonedCluster, ClusterCloneManager};
pub use ops::{CertificateOps, DatabaseClusterOps, KubeOps, VolumeOps, WorkloadOps};
pub use volume::{
    calculate_dr_volume_size, clone_pvc, ClonePvcOptions, ClonedVolume, DrVolume, DrVolumeOptions,
};
pub use worker::{
    find_reachable_service_address, GrpcWorkerConnector, NetworkProbe, TokioNetworkProbe,
    WorkerClient, WorkerConnector, WorkerHandle, WorkerInstance, WorkerManager, WorkerOptions,
    WorkerProvisioner, WorkerTls, WorkerVolume,
};
