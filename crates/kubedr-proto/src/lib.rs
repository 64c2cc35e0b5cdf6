//! Wire types and client for the kubedr worker gRPC service.
//!
//! The worker is a short-lived pod that runs the data-moving half of a
//! disaster-recovery workflow (logical database dumps and restores, file
//! sync between volumes, object storage sync). The orchestrator only
//! consumes its contract:
//!
//! ```text
//! service kubedr.worker.v1.WorkerService {
//!   rpc DumpPostgres(DumpPostgresRequest)           returns (DumpPostgresResponse);
//!   rpc RestorePostgres(RestorePostgresRequest)     returns (RestorePostgresResponse);
//!   rpc SyncObjectStorage(SyncObjectStorageRequest) returns (SyncObjectStorageResponse);
//!   rpc SyncFiles(SyncFilesRequest)                 returns (SyncFilesResponse);
//! }
//! ```
//!
//! Every call reports success or failure only; failure detail travels in the
//! gRPC status.

// Message fields mirror the protobuf schema
#![allow(missing_docs)]

/// Version 1 of the worker protocol
pub mod worker {
    /// Messages and client for `kubedr.worker.v1`
    pub mod v1 {
        mod client;
        mod messages;

        pub use client::WorkerServiceClient;
        pub use messages::*;
    }
}

pub use worker::v1::*;
