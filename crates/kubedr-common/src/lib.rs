//! Common primitives for kubedr: errors, scopes, readiness waiting and
//! guaranteed cleanup

#![deny(missing_docs)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod event;
pub mod kube_utils;
pub mod quantity;
pub mod scope;
pub mod telemetry;
pub mod wait;

pub use cleanup::{Cleanup, CleanupStack, DEFAULT_CLEANUP_TIMEOUT};
pub use error::{Error, Phase, ResultExt};
pub use event::DrEvent;
pub use scope::Scope;
pub use wait::{wait_for, ListWatch};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port the worker's gRPC server listens on
pub const DEFAULT_WORKER_GRPC_PORT: u16 = 50051;

/// Per-attempt TCP connect timeout when probing worker addresses
pub const DEFAULT_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Label key identifying the tool that manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources created by kubedr
pub const LABEL_MANAGED_BY_KUBEDR: &str = "kubedr";

/// Label key carrying a worker instance's name (used as the Service selector)
pub const LABEL_WORKER: &str = "kubedr.io/worker";

/// Label key carrying the application name of worker pods
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
