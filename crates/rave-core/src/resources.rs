//! Ordered close handlers owned by an instance.
//!
//! Resources acquired while an instance opens (the store handle, the leader
//! server) are attached here so that closing the instance tears them down
//! in reverse order of attachment. One failing handler never skips the
//! rest.

use crate::error::{RaveError, Result};
use futures::future::BoxFuture;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Async close handler for one resource.
pub type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Identifies an attached resource for [`ResourceLedger::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

struct Attached {
    id: ResourceId,
    name: &'static str,
    close: CloseFn,
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    entries: Vec<Attached>,
    closed: bool,
}

/// Close handlers in attachment order.
#[derive(Default)]
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `close` to run when the ledger closes.
    ///
    /// If the ledger is already closed the handler runs right away and
    /// [`RaveError::Closed`] is returned, so a resource acquired during
    /// shutdown is never leaked.
    pub async fn attach<F, Fut>(&self, name: &'static str, close: F) -> Result<ResourceId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let close: CloseFn = Box::new(move || Box::pin(close()));
        let late = {
            let mut state = self.lock();
            if !state.closed {
                state.next_id += 1;
                let id = ResourceId(state.next_id);
                state.entries.push(Attached { id, name, close });
                debug!("Attached resource {}", name);
                return Ok(id);
            }
            close
        };

        debug!("Ledger already closed; closing {} immediately", name);
        if let Err(e) = late().await {
            warn!("Failed to close {}: {}", name, e);
        }
        Err(RaveError::Closed)
    }

    /// Take a handler back without running it.
    pub fn detach(&self, id: ResourceId) -> Option<CloseFn> {
        let mut state = self.lock();
        let pos = state.entries.iter().position(|a| a.id == id)?;
        let attached = state.entries.remove(pos);
        debug!("Detached resource {}", attached.name);
        Some(attached.close)
    }

    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Run every handler, last attached first.
    ///
    /// Returns the first failure after all handlers have run. Later calls
    /// are no-ops.
    pub async fn close_all(&self) -> Result<()> {
        let entries = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };

        let mut first_err = None;
        for attached in entries.into_iter().rev() {
            match (attached.close)().await {
                Ok(()) => debug!("Closed resource {}", attached.name),
                Err(e) => {
                    warn!("Failed to close {}: {}", attached.name, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResourceLedger")
            .field(
                "entries",
                &state.entries.iter().map(|a| a.name).collect::<Vec<_>>(),
            )
            .field("closed", &state.closed)
            .finish()
    }
}
