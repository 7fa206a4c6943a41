//! Taking over a location once its store lock is won.

use crate::db::state::{InstanceState, Role};
use crate::error::{RaveError, Result};
use crate::ipc::{Host, LeaderServer};
use crate::platform;
use crate::store::LocalStore;
use std::sync::Arc;
use tracing::debug;

/// Try to become the leader.
///
/// Fails with [`RaveError::Locked`] when another process holds the store.
/// Returns `Ok` once leading, or as soon as the instance is closed; in the
/// latter case anything acquired so far is released by the ledger.
pub(super) async fn lead(state: &InstanceState) -> Result<()> {
    let Some(store) = open_store(state).await? else {
        return Ok(());
    };
    let store = Arc::new(store);

    {
        let store = store.clone();
        if state
            .ledger
            .attach("store", move || async move { store.close() })
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    let removed = tokio::select! {
        _ = state.cancel.cancelled() => return Ok(()),
        result = platform::remove_stale(&state.endpoint) => result,
    };
    if let Err(source) = removed {
        if state.cancel.is_cancelled() {
            return Ok(());
        }
        return Err(RaveError::EndpointCleanup {
            path: state.endpoint.as_path().to_path_buf(),
            source,
        });
    }

    if state.cancel.is_cancelled() {
        return Ok(());
    }

    let host = Arc::new(Host::new(store.clone()));
    let server = LeaderServer::start(host, &state.endpoint)?;
    if state
        .ledger
        .attach("leader server", move || server.close())
        .await
        .is_err()
    {
        return Ok(());
    }

    // Later calls skip the wire. Calls queued before this still need draining.
    state.guest.forward(store);

    self_flush(state).await?;
    if state.cancel.is_cancelled() {
        return Ok(());
    }

    state.set_role(Role::Leader);
    state.mark_ready();
    Ok(())
}

/// Open the store off the runtime threads. `None` when closed meanwhile.
async fn open_store(state: &InstanceState) -> Result<Option<LocalStore>> {
    let location = state.location.clone();
    let create_if_missing = state.options.create_if_missing;
    let mut task =
        tokio::task::spawn_blocking(move || LocalStore::open_with(&location, create_if_missing));

    tokio::select! {
        _ = state.cancel.cancelled() => {
            // A blocking open cannot be interrupted. Wait for it so the lock
            // is released before close returns.
            if let Ok(Ok(store)) = task.await {
                if let Err(e) = store.close() {
                    debug!("Failed to release store opened during close: {}", e);
                }
            }
            Ok(None)
        }
        joined = &mut task => match joined {
            Ok(result) => result.map(Some),
            Err(e) => Err(RaveError::Other(format!("Store open task failed: {}", e))),
        },
    }
}

/// Drain calls queued before leadership through our own endpoint.
///
/// The self-connection goes through the host like any follower, so queued
/// calls are applied in issuance order.
async fn self_flush(state: &InstanceState) -> Result<()> {
    if state.guest.is_flushed() {
        return Ok(());
    }
    debug!(
        "Flushing {} queued call(s) through {}",
        state.guest.pending(),
        state.endpoint
    );

    let cause = tokio::select! {
        _ = state.cancel.cancelled() => return Ok(()),
        result = platform::connect(&state.endpoint) => match result {
            Ok(stream) => {
                tokio::select! {
                    _ = state.cancel.cancelled() => return Ok(()),
                    // Dropping the bridge destroys the self-connection.
                    _ = state.guest.flushed() => return Ok(()),
                    result = state.guest.bridge(stream) => result.err(),
                }
            }
            Err(source) => Some(RaveError::Connect {
                address: state.endpoint.to_string(),
                source,
            }),
        },
    };

    if state.guest.is_flushed() || state.cancel.is_cancelled() {
        return Ok(());
    }
    Err(RaveError::DidNotFlush {
        cause: cause.map(Box::new),
    })
}
