//! Shared state of one instance.
//!
//! [`InstanceState`] is shared between the public [`RaveDb`](crate::RaveDb)
//! handle and the supervisor task racing for leadership. It owns the guest,
//! the resource ledger, the cancellation token and the lifecycle watches.

use crate::cancel::CancellationToken;
use crate::error::{RaveError, Result};
use crate::ipc::Guest;
use crate::platform::Endpoint;
use crate::resources::ResourceLedger;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Outcome of the leadership race for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Undetermined,
    Follower,
    Leader,
}

/// Notifications emitted by an instance.
#[derive(Debug, Clone)]
pub enum RaveEvent {
    /// Following a leader; calls issued before connecting have been applied.
    Follower,
    /// Won the race; listening and flushed.
    Leader,
    /// A fatal error ended the race. The instance closes afterwards.
    Error(Arc<RaveError>),
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    Failed(Arc<RaveError>),
}

/// Per-instance settings chosen through the builder.
#[derive(Debug, Clone)]
pub(crate) struct RaveOptions {
    pub(crate) retry_ceiling: Duration,
    pub(crate) retry_delay: Duration,
    pub(crate) create_if_missing: bool,
    pub(crate) iterator_batch_size: usize,
}

pub(crate) struct InstanceState {
    pub(crate) location: PathBuf,
    pub(crate) endpoint: Endpoint,
    pub(crate) options: RaveOptions,
    pub(crate) guest: Arc<Guest>,
    pub(crate) ledger: ResourceLedger,
    pub(crate) cancel: CancellationToken,
    status: watch::Sender<Status>,
    role: watch::Sender<Role>,
    readiness: watch::Sender<Readiness>,
    events: broadcast::Sender<RaveEvent>,
}

impl InstanceState {
    pub(crate) fn new(
        location: PathBuf,
        endpoint: Endpoint,
        options: RaveOptions,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            location,
            endpoint,
            options,
            guest: Arc::new(Guest::new()),
            ledger: ResourceLedger::new(),
            cancel: CancellationToken::new(),
            status: watch::channel(Status::Opening).0,
            role: watch::channel(Role::Undetermined).0,
            readiness: watch::channel(Readiness::Pending).0,
            events,
        }
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub(crate) fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RaveEvent> {
        self.events.subscribe()
    }

    pub(crate) fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    fn emit(&self, event: RaveEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Record the outcome of a race and announce it.
    pub(crate) fn set_role(&self, role: Role) {
        let previous = self.role.send_replace(role);
        match role {
            Role::Leader => {
                info!("Instance at {} is the leader", self.location.display());
                self.emit(RaveEvent::Leader);
            }
            Role::Follower => {
                if previous == Role::Undetermined {
                    info!("Instance at {} is a follower", self.location.display());
                } else {
                    debug!("Instance at {} reconnected to a leader", self.location.display());
                }
                self.emit(RaveEvent::Follower);
            }
            Role::Undetermined => {}
        }
    }

    /// Resolve a pending open and move the status to `Open`.
    pub(crate) fn mark_ready(&self) {
        let resolved = self.readiness.send_if_modified(|r| {
            if matches!(r, Readiness::Pending) {
                *r = Readiness::Ready;
                true
            } else {
                false
            }
        });
        if resolved {
            self.status.send_if_modified(|s| {
                if *s == Status::Opening {
                    *s = Status::Open;
                    true
                } else {
                    false
                }
            });
            debug!("Instance at {} is open", self.location.display());
        }
    }

    /// Report a fatal error and close the instance.
    ///
    /// Swallowed when the instance is already closing; shutdown makes the
    /// failure moot.
    pub(crate) async fn fail(&self, err: RaveError) {
        if self.cancel.is_cancelled() {
            debug!("Ignoring error during shutdown: {}", err);
            return;
        }

        error!("Instance at {} failed: {}", self.location.display(), err);
        let err = Arc::new(err);
        self.readiness.send_if_modified(|r| {
            if matches!(r, Readiness::Pending) {
                *r = Readiness::Failed(err.clone());
                true
            } else {
                false
            }
        });
        self.emit(RaveEvent::Error(err));

        if self.begin_closing() {
            if let Err(e) = self.finish_closing().await {
                debug!("Error while closing after failure: {}", e);
            }
        }
    }

    /// Move to `Closing`, cancel in-flight work and fail queued calls.
    ///
    /// Returns false when another caller already started closing.
    pub(crate) fn begin_closing(&self) -> bool {
        let first = self.status.send_if_modified(|s| {
            if matches!(s, Status::Opening | Status::Open) {
                *s = Status::Closing;
                true
            } else {
                false
            }
        });
        if first {
            debug!("Closing instance at {}", self.location.display());
            self.cancel.cancel();
            self.guest.close();
        }
        first
    }

    /// Release owned resources and move to `Closed`.
    pub(crate) async fn finish_closing(&self) -> Result<()> {
        let result = self.ledger.close_all().await;

        self.readiness.send_if_modified(|r| {
            if matches!(r, Readiness::Pending) {
                *r = Readiness::Failed(Arc::new(RaveError::Closed));
                true
            } else {
                false
            }
        });
        self.status.send_replace(Status::Closed);
        self.emit(RaveEvent::Closed);
        info!("Instance at {} closed", self.location.display());
        result
    }

    /// Wait until another caller has finished closing.
    pub(crate) async fn closed(&self) {
        let mut rx = self.status.subscribe();
        while *rx.borrow_and_update() != Status::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InstanceState {
        let location = std::env::temp_dir().join("rave-state-test");
        let endpoint = Endpoint::resolve(&location, None).unwrap();
        InstanceState::new(
            location,
            endpoint,
            RaveOptions {
                retry_ceiling: Duration::from_secs(10),
                retry_delay: Duration::from_millis(100),
                create_if_missing: true,
                iterator_batch_size: 16,
            },
            8,
        )
    }

    #[tokio::test]
    async fn test_mark_ready_opens_once() {
        let state = state();
        assert_eq!(state.status(), Status::Opening);

        state.mark_ready();
        assert_eq!(state.status(), Status::Open);
        assert!(matches!(*state.readiness().borrow(), Readiness::Ready));

        // A later role change does not reopen a closing instance.
        assert!(state.begin_closing());
        state.mark_ready();
        assert_eq!(state.status(), Status::Closing);
    }

    #[tokio::test]
    async fn test_fail_while_opening_rejects_and_closes() {
        let state = state();
        let mut events = state.subscribe();

        state.fail(RaveError::DidNotFlush { cause: None }).await;

        assert!(matches!(
            &*state.readiness().borrow(),
            Readiness::Failed(e) if matches!(**e, RaveError::DidNotFlush { .. })
        ));
        assert_eq!(state.status(), Status::Closed);
        assert!(state.cancel.is_cancelled());
        assert!(matches!(events.recv().await.unwrap(), RaveEvent::Error(_)));
        assert!(matches!(events.recv().await.unwrap(), RaveEvent::Closed));
    }

    #[tokio::test]
    async fn test_fail_after_close_is_swallowed() {
        let state = state();
        assert!(state.begin_closing());
        let mut events = state.subscribe();

        state.fail(RaveError::Other("late".into())).await;

        assert_eq!(state.status(), Status::Closing);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_resolves_pending_open() {
        let state = state();
        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        state.finish_closing().await.unwrap();

        assert!(matches!(
            &*state.readiness().borrow(),
            Readiness::Failed(e) if matches!(**e, RaveError::Closed)
        ));
        state.closed().await;
        assert_eq!(state.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_role_events() {
        let state = state();
        let mut events = state.subscribe();

        state.set_role(Role::Follower);
        state.set_role(Role::Leader);

        assert_eq!(state.role(), Role::Leader);
        assert!(matches!(events.recv().await.unwrap(), RaveEvent::Follower));
        assert!(matches!(events.recv().await.unwrap(), RaveEvent::Leader));
    }
}
