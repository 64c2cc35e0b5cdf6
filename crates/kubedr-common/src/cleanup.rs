//! Guaranteed cleanup and rollback
//!
//! A [`Cleanup`] is built inline right after a resource is created and is run
//! on every exit path of the enclosing operation. Timeout-scoped cleanups run
//! in a fresh scope rooted at [`Scope::background`], so they still complete
//! when the operation being unwound was cancelled or ran out of time.
//!
//! ```ignore
//! let backup = ops.create_backup(&scope, &spec).await?;
//! let mut result = wait_and_continue(&scope).await;
//! Cleanup::new(|| ops.delete_backup(&ns, &name))
//!     .context(format!("delete backup {name}"))
//!     .detached()
//!     .fold_into(&scope, &mut result)
//!     .await;
//! ```

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::{Error, Scope};

/// Default deadline for timeout-scoped cleanups
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

type CleanupFn<'a> = Box<dyn FnOnce(Scope) -> BoxFuture<'a, Result<(), Error>> + Send + 'a>;
type ErrorMap<'a> = Box<dyn FnOnce(Error) -> Error + Send + 'a>;

/// A deferred cleanup action
pub struct Cleanup<'a> {
    action: Option<CleanupFn<'a>>,
    context: Option<String>,
    timeout: Option<Duration>,
    map_err: Option<ErrorMap<'a>>,
}

impl<'a> Cleanup<'a> {
    /// Cleanup from an operation that takes no scope
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Error>> + Send + 'a,
    {
        Self {
            action: Some(Box::new(move |_scope| f().boxed())),
            context: None,
            timeout: None,
            map_err: None,
        }
    }

    /// Cleanup from an operation that receives the scope it runs in
    pub fn with_scope<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Scope) -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Error>> + Send + 'a,
    {
        Self {
            action: Some(Box::new(move |scope| f(scope).boxed())),
            context: None,
            timeout: None,
            map_err: None,
        }
    }

    /// The nil cleanup: running it always succeeds
    pub fn none() -> Self {
        Self {
            action: None,
            context: None,
            timeout: None,
            map_err: None,
        }
    }

    /// Prefix any failure with a human-readable message
    pub fn context(mut self, msg: impl Into<String>) -> Self {
        self.context = Some(msg.into());
        self
    }

    /// Run in a fresh scope with its own deadline instead of the caller's
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rewrite any failure, deadline and cancellation included, after
    /// [`Cleanup::context`] has been applied
    pub fn map_err<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Error) -> Error + Send + 'a,
    {
        self.map_err = Some(Box::new(f));
        self
    }

    /// Run in a fresh scope with [`DEFAULT_CLEANUP_TIMEOUT`]
    pub fn detached(self) -> Self {
        self.timeout(DEFAULT_CLEANUP_TIMEOUT)
    }

    /// Whether this cleanup has an operation to run
    pub fn is_none(&self) -> bool {
        self.action.is_none()
    }

    /// Run the cleanup.
    ///
    /// Immediate cleanups run inside `caller`; timeout-scoped ones ignore the
    /// caller's cancellation and deadline entirely.
    pub async fn run(self, caller: &Scope) -> Result<(), Error> {
        let Some(action) = self.action else {
            return Ok(());
        };

        let scope = match self.timeout {
            Some(timeout) => Scope::detached(timeout),
            None => caller.child(),
        };
        let what = self.context.as_deref().unwrap_or("cleanup");
        let result = scope.run(what, action(scope.clone())).await;

        let err = match (result, self.context) {
            (Ok(()), _) => return Ok(()),
            (Err(e), Some(ctx)) => {
                warn!(cleanup = %ctx, error = %e, "cleanup failed");
                e.context(ctx)
            }
            (Err(e), None) => {
                warn!(error = %e, "cleanup failed");
                e
            }
        };
        Err(match self.map_err {
            Some(map) => map(err),
            None => err,
        })
    }

    /// Run the cleanup and fold its outcome into `slot`.
    ///
    /// A failing cleanup turns an `Ok` slot into that failure and an `Err`
    /// slot into an aggregate of the original plus the cleanup failure.
    pub async fn fold_into<T>(self, caller: &Scope, slot: &mut Result<T, Error>) {
        if let Err(cleanup_err) = self.run(caller).await {
            fold_error(slot, cleanup_err);
        }
    }
}

/// Fold a later failure into a result slot without masking either side
pub fn fold_error<T>(slot: &mut Result<T, Error>, err: Error) {
    let previous = std::mem::replace(slot, Err(Error::internal("fold placeholder")));
    *slot = match previous {
        Ok(_) => Err(err),
        Err(original) => Err(Error::join(original, err)),
    };
}

/// Ordered set of compensating actions for a multi-step creation
///
/// Cleanups are pushed as resources come into existence and unwound in
/// reverse order. Every registered cleanup is attempted even when earlier
/// ones fail.
#[derive(Default)]
pub struct CleanupStack<'a> {
    entries: Vec<Cleanup<'a>>,
}

impl<'a> CleanupStack<'a> {
    /// Create an empty stack
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a compensating action
    pub fn push(&mut self, cleanup: Cleanup<'a>) {
        self.entries.push(cleanup);
    }

    /// Number of registered cleanups
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every cleanup in reverse order, folding failures into `slot`
    pub async fn unwind<T>(mut self, caller: &Scope, slot: &mut Result<T, Error>) {
        while let Some(cleanup) = self.entries.pop() {
            cleanup.fold_into(caller, slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn nil_cleanup_returns_ok() {
        let scope = Scope::background();
        assert!(Cleanup::none().is_none());
        assert!(Cleanup::none().run(&scope).await.is_ok());

        let mut slot: Result<(), Error> = Err(Error::internal("original"));
        Cleanup::none().fold_into(&scope, &mut slot).await;
        assert!(matches!(slot, Err(Error::Internal { .. })));
    }

    /// Story: the original failure and the cleanup failure are both reported
    #[tokio::test]
    async fn story_failing_cleanup_aggregates_with_original() {
        let scope = Scope::background();
        let mut slot: Result<(), Error> = Err(Error::timeout("cluster/clone", "not healthy"));

        Cleanup::new(|| async { Err(Error::internal("delete refused")) })
            .context("delete backup b1")
            .fold_into(&scope, &mut slot)
            .await;

        let err = slot.unwrap_err();
        let parts = err.errors();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_timeout());
        assert!(parts[1].to_string().starts_with("delete backup b1:"));
    }

    #[tokio::test]
    async fn failing_cleanup_turns_success_into_failure() {
        let scope = Scope::background();
        let mut slot: Result<u32, Error> = Ok(1);
        Cleanup::new(|| async { Err(Error::internal("boom")) })
            .fold_into(&scope, &mut slot)
            .await;
        assert!(matches!(slot, Err(Error::Internal { .. })));
    }

    #[tokio::test]
    async fn successful_cleanup_leaves_slot_untouched() {
        let scope = Scope::background();
        let mut slot: Result<u32, Error> = Ok(1);
        Cleanup::new(|| async { Ok(()) })
            .fold_into(&scope, &mut slot)
            .await;
        assert_eq!(slot.unwrap(), 1);
    }

    /// Story: rollback runs even though the operation's own scope was cancelled
    #[tokio::test]
    async fn story_timeout_scoped_cleanup_runs_after_caller_cancelled() {
        let caller = Scope::background();
        caller.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        Cleanup::with_scope(move |scope| async move {
            assert!(!scope.is_cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .timeout(Duration::from_secs(5))
        .run(&caller)
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let err = Cleanup::new(|| async { Ok(()) })
            .run(&caller)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_scoped_cleanup_has_its_own_deadline() {
        let caller = Scope::background();
        let err = Cleanup::new(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .context("delete pod w")
        .timeout(Duration::from_secs(1))
        .run(&caller)
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn stack_unwinds_in_reverse_and_attempts_all() {
        let scope = Scope::background();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(Cleanup::new(move || async move {
                order.lock().unwrap().push(i);
                if i == 1 {
                    Err(Error::internal(format!("cleanup {i} failed")))
                } else {
                    Ok(())
                }
            }));
        }
        assert_eq!(stack.len(), 3);

        let mut slot: Result<(), Error> = Err(Error::internal("step 4 failed"));
        stack.unwind(&scope, &mut slot).await;

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(slot.unwrap_err().errors().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mapped_error_covers_deadline_failures() {
        let err = Cleanup::new(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .timeout(Duration::from_secs(1))
        .map_err(|e| Error::phase(crate::Phase::Cleanup, "volume-backup/data", e))
        .run(&Scope::background())
        .await
        .unwrap_err();
        assert_eq!(err.failed_phase(), Some((crate::Phase::Cleanup, "volume-backup/data")));
        assert!(err.is_timeout());
    }
}
