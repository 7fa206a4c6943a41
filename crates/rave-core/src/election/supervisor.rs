//! The connect-or-lead loop.

use super::leader;
use crate::db::state::{InstanceState, Role};
use crate::error::{RaveError, Result};
use crate::platform;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How a follow attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followed {
    /// Nothing accepted the connection.
    NoLeader,
    /// A leader accepted the connection and lost it before serving anything.
    Dropped,
    /// A leader answered calls, or held the connection for a whole retry ceiling.
    Served,
}

/// Race for the location until this instance leads, fails or is closed.
///
/// A follower stays inside this loop for as long as it follows; when its
/// leader goes away it races again.
pub(crate) async fn run(state: Arc<InstanceState>) {
    if let Err(e) = race(&state).await {
        state.fail(e).await;
    }
    debug!("Supervisor for {} finished", state.location.display());
}

async fn race(state: &InstanceState) -> Result<()> {
    // Start of the current contention episode. Only a leader that actually
    // served us ends an episode; one that merely accepts and drops does not.
    let mut started: Option<Instant> = None;

    loop {
        if state.cancel.is_cancelled() {
            return Ok(());
        }

        let followed = follow(state).await;
        if state.cancel.is_cancelled() {
            return Ok(());
        }
        if followed == Followed::Served {
            started = None;
        }
        let since = *started.get_or_insert_with(Instant::now);

        match leader::lead(state).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_lock_contention() => {
                let elapsed = since.elapsed();
                if elapsed > state.options.retry_ceiling {
                    return Err(RaveError::RetryCeilingExceeded {
                        elapsed,
                        source: Box::new(e),
                    });
                }
                if followed != Followed::NoLeader {
                    debug!("Lost the race to a new leader; reconnecting");
                    continue;
                }
                debug!(
                    "Store at {} is locked and no leader answered; retrying in {:?}",
                    state.location.display(),
                    state.options.retry_delay
                );
                tokio::select! {
                    _ = state.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(state.options.retry_delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Follow a leader for as long as the connection lasts.
///
/// The instance is reported as a follower once every call issued before the
/// connection has been answered through it.
async fn follow(state: &InstanceState) -> Followed {
    let stream = tokio::select! {
        _ = state.cancel.cancelled() => return Followed::NoLeader,
        result = platform::connect(&state.endpoint) => match result {
            Ok(stream) => stream,
            Err(e) => {
                debug!("No leader at {}: {}", state.endpoint, e);
                return Followed::NoLeader;
            }
        },
    };

    let connected_at = Instant::now();
    let answered = state.guest.answered();

    let bridge = state.guest.bridge(stream);
    tokio::pin!(bridge);
    let settled = state.guest.settled();
    tokio::pin!(settled);
    let mut ready = false;

    let result = loop {
        tokio::select! {
            _ = state.cancel.cancelled() => return Followed::Dropped,
            _ = &mut settled, if !ready => {
                ready = true;
                state.set_role(Role::Follower);
                state.mark_ready();
            }
            result = &mut bridge => break result,
        }
    };
    match result {
        Ok(()) => info!("Leader at {} disconnected", state.endpoint),
        Err(e) => warn!("Connection to leader at {} ended: {}", state.endpoint, e),
    }

    if state.guest.answered() > answered
        || connected_at.elapsed() >= state.options.retry_ceiling
    {
        Followed::Served
    } else {
        Followed::Dropped
    }
}
