//! The public instance type.
//!
//! A [`RaveDb`] is one process's handle to a store location. Whether it
//! leads or follows is decided in the background; the API is the same
//! either way. Every call is issued when the method is called, not when
//! the returned future is first polled, so calls made back to back keep
//! their order even while the instance is still opening.

mod builder;
mod iterator;
pub(crate) mod state;

pub use builder::RaveDbBuilder;
pub use iterator::RaveIterator;
pub use state::{RaveEvent, Role, Status};

use crate::error::{RaveError, Result};
use crate::platform::Endpoint;
use crate::store::{BatchOp, Blob, KeyRange, Operation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use state::{InstanceState, Readiness};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a store location shared with other local processes.
///
/// Dropping without [`close`](Self::close) cancels the race and releases
/// resources best effort once background tasks wind down.
pub struct RaveDb {
    state: Arc<InstanceState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RaveDb {
    /// Create a builder for a RaveDb.
    ///
    /// Use the builder to change retry timing, the socket path or the
    /// iterator page size.
    pub fn builder(location: impl Into<PathBuf>) -> RaveDbBuilder {
        RaveDbBuilder::new(location)
    }

    /// Create an instance for `location` and start racing for it.
    ///
    /// Returns immediately with status [`Status::Opening`].
    pub fn new(location: impl Into<PathBuf>) -> Result<Self> {
        RaveDbBuilder::new(location).build()
    }

    /// Create an instance and wait until it is open.
    pub async fn open(location: impl Into<PathBuf>) -> Result<Self> {
        RaveDbBuilder::new(location).open().await
    }

    /// Wait until this instance leads or follows.
    ///
    /// Fails with [`RaveError::OpenFailed`] carrying the fatal error that
    /// ended the race, or [`RaveError::Closed`] if closed first.
    pub async fn opened(&self) -> Result<()> {
        let mut rx = self.state.readiness();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(err) => {
                    if matches!(*err, RaveError::Closed) {
                        return Err(RaveError::Closed);
                    }
                    return Err(RaveError::OpenFailed(err));
                }
                Readiness::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(RaveError::Closed);
            }
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    /// True once this instance has won the location.
    pub fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    /// Absolute location of the store.
    pub fn location(&self) -> &Path {
        &self.state.location
    }

    /// Address shared by every instance of the location.
    pub fn endpoint(&self) -> &Endpoint {
        &self.state.endpoint
    }

    /// Receive role changes, fatal errors and the close notification.
    pub fn subscribe(&self) -> broadcast::Receiver<RaveEvent> {
        self.state.subscribe()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.state.guest.pending()
    }

    pub fn get(
        &self,
        key: impl Into<Blob>,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send + 'static {
        let call = self.state.guest.call(Operation::Get { key: key.into() });
        async move { call.await?.into_value() }
    }

    /// Read several keys in one call. Missing keys yield `None`.
    pub fn get_many<K: Into<Blob>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send + 'static {
        let keys = keys.into_iter().map(Into::into).collect();
        let call = self.state.guest.call(Operation::GetMany { keys });
        async move { call.await?.into_values() }
    }

    pub fn put(
        &self,
        key: impl Into<Blob>,
        value: impl Into<Blob>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let call = self.state.guest.call(Operation::Put {
            key: key.into(),
            value: value.into(),
        });
        async move { call.await?.into_done() }
    }

    pub fn del(&self, key: impl Into<Blob>) -> impl Future<Output = Result<()>> + Send + 'static {
        let call = self.state.guest.call(Operation::Del { key: key.into() });
        async move { call.await?.into_done() }
    }

    /// Apply `ops` atomically, in order.
    pub fn batch(&self, ops: Vec<BatchOp>) -> impl Future<Output = Result<()>> + Send + 'static {
        let call = self.state.guest.call(Operation::Batch { ops });
        async move { call.await?.into_done() }
    }

    /// Delete every entry in `range`.
    pub fn clear(&self, range: KeyRange) -> impl Future<Output = Result<()>> + Send + 'static {
        let call = self.state.guest.call(Operation::Clear { range });
        async move { call.await?.into_done() }
    }

    /// Iterate over `range`, fetching pages on demand.
    pub fn iterator(&self, range: KeyRange) -> RaveIterator {
        RaveIterator::new(
            self.state.guest.clone(),
            range,
            self.state.options.iterator_batch_size,
        )
    }

    /// Store `value` as JSON.
    pub fn put_json<T: Serialize + ?Sized>(
        &self,
        key: impl Into<Blob>,
        value: &T,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let key: Blob = key.into();
        let call = serde_json::to_vec(value).map(|bytes| self.put(key, bytes));
        async move { call?.await }
    }

    /// Read a JSON value stored with [`put_json`](Self::put_json).
    pub fn get_json<T: DeserializeOwned + Send + 'static>(
        &self,
        key: impl Into<Blob>,
    ) -> impl Future<Output = Result<Option<T>>> + Send + 'static {
        let key: Blob = key.into();
        let call = self.get(key);
        async move {
            match call.await? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        }
    }

    /// Close the instance.
    ///
    /// Cancels the race, fails queued calls with [`RaveError::Closed`] and
    /// releases owned resources, last acquired first. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let first = self.state.begin_closing();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("Supervisor for {} panicked: {}", self.state.location.display(), e);
                }
            }
        }

        if first {
            self.state.finish_closing().await
        } else {
            self.state.closed().await;
            Ok(())
        }
    }
}

impl std::fmt::Debug for RaveDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaveDb")
            .field("location", &self.state.location)
            .field("status", &self.status())
            .field("role", &self.role())
            .finish()
    }
}

impl Drop for RaveDb {
    fn drop(&mut self) {
        // Best effort: stop racing. Owned resources are released when the
        // last task holding the state finishes.
        self.state.begin_closing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_single_instance_leads() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::open(dir.path()).await.unwrap();

        assert!(db.is_leader());
        assert_eq!(db.status(), Status::Open);

        db.put("a", "1").await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), Some(b"1".to_vec()));

        db.close().await.unwrap();
        assert_eq!(db.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_calls_before_open_are_applied_in_order() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::new(dir.path()).unwrap();

        let first = db.put("k", "1");
        let second = db.put("k", "2");
        let read = db.get("k");

        db.opened().await.unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(read.await.unwrap(), Some(b"2".to_vec()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::open(dir.path()).await.unwrap();

        db.put_json("n", &42u32).await.unwrap();
        assert_eq!(db.get_json::<u32>("n").await.unwrap(), Some(42));
        assert_eq!(db.get_json::<u32>("missing").await.unwrap(), None);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_get_many_and_clear() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::open(dir.path()).await.unwrap();

        db.batch(vec![
            BatchOp::put("a", "1"),
            BatchOp::put("b", "2"),
            BatchOp::put("c", "3"),
            BatchOp::del("b"),
        ])
        .await
        .unwrap();
        assert_eq!(
            db.get_many(["a", "b", "c"]).await.unwrap(),
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
        );

        db.clear(KeyRange::all().lt("c")).await.unwrap();
        let rest = db.iterator(KeyRange::all()).all().await.unwrap();
        assert_eq!(rest, vec![(b"c".to_vec(), b"3".to_vec())]);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::open(dir.path()).await.unwrap();
        db.close().await.unwrap();

        assert!(matches!(db.get("a").await, Err(RaveError::Closed)));
        // Closing twice is fine.
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_open_resolves_opened() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::new(dir.path()).unwrap();
        db.close().await.unwrap();

        assert!(matches!(db.opened().await, Err(RaveError::Closed)));
    }

    #[tokio::test]
    async fn test_events_announce_leader_and_close() {
        let dir = TempDir::new().unwrap();
        let db = RaveDb::new(dir.path()).unwrap();
        let mut events = db.subscribe();

        let leader = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(leader, RaveEvent::Leader));

        db.close().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), RaveEvent::Closed));
    }
}
