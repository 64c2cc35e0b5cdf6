//! Cancellable, deadline-bound execution scopes
//!
//! A [`Scope`] pairs a cancellation token with an optional deadline. Every
//! wait and every cleanup runs inside one. Child scopes inherit cancellation
//! and can only tighten the deadline. Cleanup scopes are derived from
//! [`Scope::background`] instead of the caller so that unwinding still runs to
//! completion after the operation being unwound was cancelled or timed out.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Cancellation token plus optional deadline
#[derive(Clone, Debug)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::background()
    }
}

impl Scope {
    /// Root scope: never cancelled on its own, no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Fresh root scope with its own deadline, independent of any caller
    pub fn detached(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    /// Child scope cancelled with this one, with deadline `min(parent, now + timeout)`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child scope sharing this one's deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this scope and every scope derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Deadline of this scope, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` when unbounded)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Run a future inside this scope.
    ///
    /// Returns `Error::Cancelled` if the scope is cancelled first and
    /// `Error::Timeout` (naming `what`) if the deadline elapses first.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.token.is_cancelled() {
            return Err(Error::cancelled(what));
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Error::cancelled(what)),
                    res = tokio::time::timeout_at(deadline, fut) => match res {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::timeout(what, "deadline exceeded")),
                    },
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Error::cancelled(what)),
                    res = fut => res,
                }
            }
        }
    }
}
