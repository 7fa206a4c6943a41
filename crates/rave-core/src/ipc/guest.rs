//! Guest side of the local channel.
//!
//! The guest turns store operations into JSON-RPC requests. Calls are
//! registered the moment they are issued and stay queued, in issuance order,
//! until a reply arrives. Whenever a transport is bridged, every unanswered
//! call is (re)sent in order before any newer call, so nothing issued while
//! disconnected is lost or reordered.
//!
//! Once [`Guest::forward`] installs a local target, later calls skip the
//! wire entirely. Calls queued before that still need a transport to drain.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::error::{RaveError, Result};
use crate::store::{Dispatch, Operation, Reply};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

type Forwarded = (Operation, oneshot::Sender<Result<Reply>>);

/// Queueing RPC client shared by an instance and its supervisor.
pub struct Guest {
    state: Mutex<GuestState>,
    flushed_tx: watch::Sender<bool>,
    /// Replies received over any transport. Also bumped on close to wake waiters.
    answered_tx: watch::Sender<u64>,
}

struct GuestState {
    next_id: u64,
    unanswered: BTreeMap<u64, PendingCall>,
    link: Option<Link>,
    next_link: u64,
    forward: Option<mpsc::UnboundedSender<Forwarded>>,
    closed: bool,
}

struct PendingCall {
    frame: Vec<u8>,
    reply: oneshot::Sender<Result<Reply>>,
}

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Detaches the transport it was created for when dropped.
struct LinkGuard<'a> {
    guest: &'a Guest,
    generation: u64,
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.guest.lock();
        if state.link.as_ref().map(|l| l.generation) == Some(self.generation) {
            state.link = None;
        }
    }
}

impl Default for Guest {
    fn default() -> Self {
        Self::new()
    }
}

impl Guest {
    pub fn new() -> Self {
        let (flushed_tx, _) = watch::channel(true);
        let (answered_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(GuestState {
                next_id: 1,
                unanswered: BTreeMap::new(),
                link: None,
                next_link: 0,
                forward: None,
                closed: false,
            }),
            flushed_tx,
            answered_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue an operation.
    ///
    /// The call is queued (or sent, if a transport is bridged) before this
    /// returns; the future only waits for the reply.
    pub fn call(&self, op: Operation) -> BoxFuture<'static, Result<Reply>> {
        let mut state = self.lock();
        if state.closed {
            return future::ready(Err(RaveError::Closed)).boxed();
        }

        if let Some(forward) = &state.forward {
            let (reply_tx, reply_rx) = oneshot::channel();
            if forward.send((op, reply_tx)).is_err() {
                return future::ready(Err(RaveError::Closed)).boxed();
            }
            return async move { reply_rx.await.unwrap_or(Err(RaveError::Closed)) }.boxed();
        }

        let id = state.next_id;
        state.next_id += 1;

        let frame = match IpcRequest::from_operation(op, id)
            .and_then(|req| serde_json::to_vec(&req).map_err(RaveError::from))
        {
            Ok(frame) => frame,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        if let Some(link) = &state.link {
            let _ = link.tx.send(frame.clone());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        state.unanswered.insert(
            id,
            PendingCall {
                frame,
                reply: reply_tx,
            },
        );
        self.flushed_tx.send_replace(false);
        drop(state);

        async move { reply_rx.await.unwrap_or(Err(RaveError::Closed)) }.boxed()
    }

    /// Route every later call straight to `target`.
    ///
    /// Forwarded calls run one at a time in issuance order on a task of the
    /// current runtime.
    pub fn forward(&self, target: Arc<dyn Dispatch>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Forwarded>();
        tokio::spawn(async move {
            while let Some((op, reply)) = rx.recv().await {
                let _ = reply.send(target.dispatch(op).await);
            }
        });
        self.lock().forward = Some(tx);
    }

    /// True when no call is waiting for a reply.
    pub fn is_flushed(&self) -> bool {
        self.lock().unanswered.is_empty()
    }

    /// Number of calls waiting for a reply.
    pub fn pending(&self) -> usize {
        self.lock().unanswered.len()
    }

    /// Total replies received over any transport so far.
    pub fn answered(&self) -> u64 {
        *self.answered_tx.borrow()
    }

    /// Wait until no call is waiting for a reply.
    pub async fn flushed(&self) {
        let mut rx = self.flushed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until every call issued before this was called has been
    /// answered or the guest is closed. Later calls are not waited for.
    pub async fn settled(&self) {
        let mut rx = self.answered_tx.subscribe();
        let horizon = self.lock().next_id;
        loop {
            rx.borrow_and_update();
            {
                let state = self.lock();
                if state.closed || state.unanswered.range(..horizon).next().is_none() {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fail every unanswered call and refuse new ones.
    pub fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.link = None;
            state.forward = None;
            std::mem::take(&mut state.unanswered)
        };
        if !drained.is_empty() {
            debug!("Guest closed with {} unanswered call(s)", drained.len());
        }
        for (_, call) in drained {
            let _ = call.reply.send(Err(RaveError::Closed));
        }
        self.flushed_tx.send_replace(true);
        self.answered_tx.send_modify(|_| {});
    }

    /// Relay calls over `stream` until either side closes it.
    ///
    /// Unanswered calls are replayed first, in issuance order. They remain
    /// queued when the stream ends, ready for the next bridge.
    pub async fn bridge<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let _link = self.attach(tx)?;

        let outbound = async {
            while let Some(frame) = rx.recv().await {
                write_frame(&mut writer, &frame).await?;
            }
            Ok::<(), RaveError>(())
        };

        let inbound = async {
            loop {
                match read_frame(&mut reader).await? {
                    Some(bytes) => self.on_response(&bytes)?,
                    None => return Ok::<(), RaveError>(()),
                }
            }
        };

        tokio::select! {
            result = outbound => result,
            result = inbound => result,
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<LinkGuard<'_>> {
        let mut state = self.lock();
        if state.closed {
            return Err(RaveError::Closed);
        }
        if state.link.is_some() {
            warn!("Guest bridged twice; replacing the previous transport");
        }

        for call in state.unanswered.values() {
            let _ = tx.send(call.frame.clone());
        }
        if !state.unanswered.is_empty() {
            debug!("Replaying {} queued call(s)", state.unanswered.len());
        }

        state.next_link += 1;
        let generation = state.next_link;
        state.link = Some(Link { generation, tx });

        Ok(LinkGuard {
            guest: self,
            generation,
        })
    }

    fn on_response(&self, bytes: &[u8]) -> Result<()> {
        let response: IpcResponse = serde_json::from_slice(bytes)?;
        let id = response.call_id().ok_or_else(|| RaveError::Validation {
            field: "id".to_string(),
            message: "IPC response without a numeric id".to_string(),
        })?;
        let outcome = response.into_reply();

        let mut state = self.lock();
        match state.unanswered.remove(&id) {
            Some(call) => {
                let _ = call.reply.send(outcome);
            }
            None => debug!("Ignoring reply for unknown call {}", id),
        }
        if state.unanswered.is_empty() {
            self.flushed_tx.send_replace(true);
        }
        drop(state);
        self.answered_tx.send_modify(|n| *n += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::host::Host;
    use crate::store::{Blob, LocalStore};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serve `guest` from a fresh store over an in-memory duplex pipe.
    fn pipe_to_host(store: Arc<LocalStore>) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
        let (guest_side, host_side) = tokio::io::duplex(64 * 1024);
        let host = Host::new(store);
        let handle = tokio::spawn(async move {
            let (_tx, mut rx) = watch::channel(false);
            let _ = host.serve(host_side, &mut rx).await;
        });
        (guest_side, handle)
    }

    #[tokio::test]
    async fn test_calls_queue_until_bridged() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Arc::new(Guest::new());

        let put = guest.call(Operation::Put {
            key: "a".into(),
            value: "1".into(),
        });
        let get = guest.call(Operation::Get { key: "a".into() });
        assert_eq!(guest.pending(), 2);
        assert!(!guest.is_flushed());

        let (stream, _host) = pipe_to_host(store);
        let bridge = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.bridge(stream).await })
        };

        put.await.unwrap().into_done().unwrap();
        assert_eq!(get.await.unwrap().into_value().unwrap(), Some(b"1".to_vec()));

        tokio::time::timeout(Duration::from_secs(1), guest.flushed())
            .await
            .unwrap();
        assert!(guest.is_flushed());
        bridge.abort();
    }

    #[tokio::test]
    async fn test_unanswered_calls_survive_dropped_transport() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Guest::new();

        let put = guest.call(Operation::Put {
            key: "k".into(),
            value: "v".into(),
        });

        // A peer that hangs up without answering.
        let (stream, peer) = tokio::io::duplex(1024);
        drop(peer);
        let _ = guest.bridge(stream).await;
        assert_eq!(guest.pending(), 1);

        let (stream, _host) = pipe_to_host(store.clone());
        tokio::select! {
            _ = guest.bridge(stream) => panic!("bridge ended early"),
            reply = put => reply.unwrap().into_done().unwrap(),
        }
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_forward_bypasses_wire() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Guest::new();
        guest.forward(store.clone());

        guest
            .call(Operation::Put {
                key: "x".into(),
                value: "y".into(),
            })
            .await
            .unwrap();

        assert!(guest.is_flushed());
        assert_eq!(store.get(b"x").unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_new_calls() {
        let guest = Guest::new();
        let pending = guest.call(Operation::Get {
            key: Blob::from("a"),
        });

        guest.close();

        assert!(matches!(pending.await, Err(RaveError::Closed)));
        assert!(matches!(
            guest.call(Operation::Get { key: "a".into() }).await,
            Err(RaveError::Closed)
        ));
        assert!(guest.is_flushed());

        let (stream, _peer) = tokio::io::duplex(1024);
        assert!(matches!(guest.bridge(stream).await, Err(RaveError::Closed)));
    }

    #[tokio::test]
    async fn test_replay_preserves_issuance_order() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Arc::new(Guest::new());

        let calls: Vec<_> = (0..20)
            .map(|i| {
                guest.call(Operation::Put {
                    key: "counter".into(),
                    value: i.to_string().into(),
                })
            })
            .collect();

        let (stream, _host) = pipe_to_host(store.clone());
        let bridge = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.bridge(stream).await })
        };

        for call in calls {
            call.await.unwrap();
        }
        assert_eq!(store.get(b"counter").unwrap(), Some(b"19".to_vec()));
        bridge.abort();
    }

    #[tokio::test]
    async fn test_forwarded_calls_apply_in_issuance_order() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Guest::new();
        guest.forward(store.clone());

        let calls: Vec<_> = (0..20)
            .map(|i| {
                guest.call(Operation::Put {
                    key: "counter".into(),
                    value: i.to_string().into(),
                })
            })
            .collect();

        // Awaiting in reverse must not change the order they were applied in.
        for call in calls.into_iter().rev() {
            call.await.unwrap();
        }
        assert_eq!(store.get(b"counter").unwrap(), Some(b"19".to_vec()));
    }

    #[tokio::test]
    async fn test_settled_waits_for_earlier_calls() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let guest = Arc::new(Guest::new());

        let early = guest.call(Operation::Put {
            key: "a".into(),
            value: "1".into(),
        });
        let settled = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.settled().await })
        };
        tokio::task::yield_now().await;
        // Issued after the wait started.
        let _late = guest.call(Operation::Get { key: "a".into() });

        let (stream, _host) = pipe_to_host(store);
        let bridge = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.bridge(stream).await })
        };

        early.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), settled)
            .await
            .unwrap()
            .unwrap();
        assert!(guest.answered() >= 1);
        bridge.abort();
    }

    #[tokio::test]
    async fn test_settled_returns_on_close() {
        let guest = Arc::new(Guest::new());
        let _pending = guest.call(Operation::Get { key: "a".into() });
        let settled = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.settled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!settled.is_finished());
        guest.close();

        tokio::time::timeout(Duration::from_secs(1), settled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guest.answered(), 0);
    }
}
