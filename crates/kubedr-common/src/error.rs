//! Error types for kubedr
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant names the resource or operation it concerns, and wrapping variants
//! (`Phase`, `Context`, `Aggregate`) keep the full causal chain visible so a
//! cleanup failure never hides the failure it was unwinding, or vice versa.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Workflow phase of a Stage run, used to annotate errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Per-action validation, before anything is created
    Validate,
    /// Per-action setup, accumulating worker requirements
    Setup,
    /// Worker provisioning and per-action execution
    Execute,
    /// Per-action cleanup, always attempted
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Validate => "validate",
            Phase::Setup => "setup",
            Phase::Execute => "execute",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Main error type for kubedr operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or input
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource or option that is invalid
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// A dependency is missing or not ready
    #[error("precondition failed for {resource}: {message}")]
    Precondition {
        /// Resource whose precondition failed
        resource: String,
        /// Description of the unmet precondition
        message: String,
    },

    /// A deadline elapsed while waiting
    #[error("timed out waiting for {resource}: {message}")]
    Timeout {
        /// Resource being waited on
        resource: String,
        /// What was being waited for
        message: String,
    },

    /// The enclosing scope was cancelled
    #[error("cancelled: {context}")]
    Cancelled {
        /// Operation that observed the cancellation
        context: String,
    },

    /// Something required could not be found
    #[error("not found: {resource}: {message}")]
    NotFound {
        /// Resource that could not be found
        resource: String,
        /// Description of what was searched
        message: String,
    },

    /// A resource source returned a different type than declared
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// Declared resource kind
        expected: String,
        /// Kind actually returned
        found: String,
    },

    /// Worker RPC failure
    #[error("worker rpc {operation} failed: {message}")]
    Rpc {
        /// RPC operation name
        operation: String,
        /// Status message returned by the worker or transport
        message: String,
    },

    /// A Stage phase failed on a named action
    #[error("{phase} failed for action {action}: {source}")]
    Phase {
        /// Phase that failed
        phase: Phase,
        /// Name of the action (or "worker" for provisioning)
        action: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Annotation added while an error crosses a layer
    #[error("{context}: {source}")]
    Context {
        /// Operation and resource the error passed through
        context: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Two or more independent failures
    #[error("{} errors occurred: {}", .errors.len(), join_messages(.errors))]
    Aggregate {
        /// Every constituent failure, in the order they happened
        errors: Vec<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| format!("[{}]", e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error for a resource or option
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a precondition error for a resource
    pub fn precondition(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Precondition {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a resource
    pub fn timeout(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a worker RPC error
    pub fn rpc(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rpc {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the phase and action it failed in
    pub fn phase(phase: Phase, action: impl Into<String>, source: Error) -> Self {
        Self::Phase {
            phase,
            action: action.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Prefix this error with the operation it passed through
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build an aggregate from a list of errors, flattening nested aggregates.
    ///
    /// Returns `None` for an empty list and the error itself for a single one.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Self> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate { errors: flat }),
        }
    }

    /// Combine an original failure with a later one; neither masks the other.
    pub fn join(original: Error, later: Error) -> Self {
        match Self::aggregate([original, later]) {
            Some(err) => err,
            None => Error::internal("empty aggregate"),
        }
    }

    /// Constituent errors: the members of an aggregate, or just `self`
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Aggregate { errors } => errors.iter().collect(),
            other => vec![other],
        }
    }

    /// Check whether this is (or wraps) a not-found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => is_kube_not_found(source),
            Error::Context { source, .. } | Error::Phase { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Check whether this is (or wraps) a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Context { source, .. } | Error::Phase { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// The phase this error was annotated with, if any
    pub fn failed_phase(&self) -> Option<(Phase, &str)> {
        match self {
            Error::Phase { phase, action, .. } => Some((*phase, action)),
            Error::Aggregate { errors } => errors.iter().find_map(|e| e.failed_phase()),
            Error::Context { source, .. } => source.failed_phase(),
            _ => None,
        }
    }
}

/// Check whether a kube error is an API 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Extension for annotating results as they cross a layer
pub trait ResultExt<T> {
    /// Prefix the error with a fixed context message
    fn context(self, context: impl Into<String>) -> Result<T, Error>;

    /// Prefix the error with a lazily built context message
    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
