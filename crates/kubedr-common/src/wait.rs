//! Watch-based readiness waiting
//!
//! [`wait_for`] blocks until a predicate matches a single named resource.
//! It lists first and returns straight away when the resource already
//! satisfies the predicate; only otherwise does it open a watch. Every read
//! runs inside one deadline-bound [`Scope`], so an elapsed deadline is an
//! error rather than an empty result.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::kube_utils::READ_TIMEOUT;
use crate::{Error, Scope};

/// Server-side watch timeout. The server must close an idle watch before
/// the client's read timeout fires.
const WATCH_TIMEOUT_SECS: u64 = 25;
const _: () = assert!(WATCH_TIMEOUT_SECS < READ_TIMEOUT.as_secs());

/// Pause before reopening a watch that ended without a match
const WATCH_REOPEN_DELAY: Duration = Duration::from_millis(500);

/// HTTP status the API server uses for a compacted resourceVersion
const STATUS_GONE: u16 = 410;

/// Result of listing a single named resource
#[derive(Debug)]
pub struct Listed<K> {
    /// Items returned by the name-filtered list
    pub items: Vec<K>,
    /// Resource version to start a watch from
    pub resource_version: String,
}

/// Minimal list + watch capability over one resource type
#[async_trait]
pub trait ListWatch<K>: Send + Sync {
    /// List resources whose name is exactly `name`
    async fn list_named(&self, name: &str) -> Result<Listed<K>, Error>;

    /// Watch resources whose name is exactly `name`, starting at `resource_version`
    async fn watch_named<'a>(
        &'a self,
        name: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'a, Result<WatchEvent<K>, Error>>, Error>;
}

fn name_selector(name: &str) -> String {
    format!("metadata.name={}", name)
}

fn watch_timeout_secs(timeout: Duration) -> u32 {
    timeout.as_secs().clamp(1, WATCH_TIMEOUT_SECS) as u32
}

/// Map a kube error, turning an object that does not decode as `K` into
/// [`Error::TypeMismatch`]. Typed decoding checks `apiVersion` and `kind`,
/// so a source serving another type fails here instead of being skipped.
fn decode_error<K: Resource<DynamicType = ()>>(err: kube::Error) -> Error {
    match err {
        kube::Error::SerdeError(e) => Error::TypeMismatch {
            expected: K::kind(&()).to_string(),
            found: format!("undecodable object ({})", e),
        },
        other => other.into(),
    }
}

#[async_trait]
impl<K> ListWatch<K> for Api<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list_named(&self, name: &str) -> Result<Listed<K>, Error> {
        let lp = ListParams::default().fields(&name_selector(name));
        let list = self.list(&lp).await.map_err(decode_error::<K>)?;
        Ok(Listed {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch_named<'a>(
        &'a self,
        name: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'a, Result<WatchEvent<K>, Error>>, Error> {
        let wp = WatchParams::default()
            .fields(&name_selector(name))
            .timeout(watch_timeout_secs(timeout));
        let stream = self
            .watch(&wp, resource_version)
            .await
            .map_err(decode_error::<K>)?;
        Ok(stream.map_err(decode_error::<K>).boxed())
    }
}

/// Whether the server refused a watch because its resourceVersion is gone
fn is_expired(err: &Error) -> bool {
    matches!(err, Error::Kube { source: kube::Error::Api(ae) } if ae.code == STATUS_GONE)
}

/// Whether a watch body read broke off, as opposed to the server failing it
fn is_interrupted(err: &Error) -> bool {
    matches!(err, Error::Kube { source: kube::Error::ReadEvents(_) })
}

/// Wait until `predicate` matches the resource called `name`.
///
/// `predicate` returns `Ok(Some(value))` on match, `Ok(None)` to keep
/// waiting and `Err` to abort. The whole wait, list and watch included, is
/// bounded by `timeout` within `scope`.
pub async fn wait_for<K, S, T, P>(
    scope: &Scope,
    source: &S,
    name: &str,
    timeout: Duration,
    mut predicate: P,
) -> Result<T, Error>
where
    K: Resource<DynamicType = ()> + Send,
    S: ListWatch<K> + ?Sized,
    P: FnMut(&K) -> Result<Option<T>, Error> + Send,
    T: Send,
{
    let what = format!("{}/{}", K::kind(&()), name);
    let scope = scope.with_timeout(timeout);
    scope
        .run(
            &what,
            list_then_watch(&scope, source, name, timeout, &mut predicate, &what),
        )
        .await
}

async fn list_then_watch<K, S, T, P>(
    scope: &Scope,
    source: &S,
    name: &str,
    timeout: Duration,
    predicate: &mut P,
    what: &str,
) -> Result<T, Error>
where
    K: Resource<DynamicType = ()> + Send,
    S: ListWatch<K> + ?Sized,
    P: FnMut(&K) -> Result<Option<T>, Error> + Send,
    T: Send,
{
    'relist: loop {
        let listed = source.list_named(name).await?;
        let mut resource_version = listed.resource_version;

        match listed.items.as_slice() {
            [] => debug!(resource = %what, "not found yet, watching"),
            [item] => {
                if let Some(out) = predicate(item)? {
                    debug!(resource = %what, "condition already satisfied");
                    return Ok(out);
                }
            }
            items => {
                return Err(Error::internal_with_context(
                    "wait_for",
                    format!(
                        "name filter for {} matched {} objects, expected at most one",
                        what,
                        items.len()
                    ),
                ));
            }
        }

        loop {
            let remaining = scope.remaining().unwrap_or(timeout);
            let mut stream = match source.watch_named(name, &resource_version, remaining).await {
                Ok(stream) => stream,
                Err(e) if is_expired(&e) => {
                    debug!(resource = %what, %resource_version, "resource version expired, relisting");
                    continue 'relist;
                }
                Err(e) => return Err(e),
            };

            loop {
                let event = match stream.try_next().await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) if is_interrupted(&e) => {
                        debug!(resource = %what, error = %e, "watch interrupted");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                match event {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                        if let Some(rv) = obj.resource_version() {
                            resource_version = rv;
                        }
                        trace!(resource = %what, "watch event");
                        if let Some(out) = predicate(&obj)? {
                            return Ok(out);
                        }
                    }
                    WatchEvent::Deleted(_) => {
                        debug!(resource = %what, "deleted while waiting");
                    }
                    WatchEvent::Bookmark(bookmark) => {
                        resource_version = bookmark.metadata.resource_version;
                    }
                    WatchEvent::Error(status) if status.code == STATUS_GONE => {
                        debug!(resource = %what, %resource_version, "resource version expired, relisting");
                        continue 'relist;
                    }
                    WatchEvent::Error(status) => {
                        return Err(Error::internal_with_context(
                            "wait_for",
                            format!(
                                "watch on {} failed: {} ({})",
                                what, status.message, status.code
                            ),
                        ));
                    }
                }
            }

            debug!(resource = %what, %resource_version, "watch ended without a match, reopening");
            tokio::time::sleep(WATCH_REOPEN_DELAY).await;
        }
    }
}
