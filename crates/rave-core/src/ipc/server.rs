//! Leader server for the local channel.
//!
//! Listens on the instance endpoint, hands every accepted connection to the
//! [`Host`] in its own task, and tracks live connections so they can be
//! destroyed when the leader closes.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. The host and the store behind it are
//! shared via `Arc`; the store serializes access internally.

use super::host::Host;
use crate::config::RaveConfig;
use crate::error::{RaveError, Result};
use crate::platform::{self, Endpoint, Listener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Handle to a running leader server. Dropping shuts down the server.
pub struct LeaderServerHandle {
    endpoint: Endpoint,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LeaderServerHandle {
    /// The address the server is listening on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of followers currently bridged.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Signal the server to stop.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Destroy every live connection, stop listening and remove the socket file.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Leader server task panicked: {}", e);
                }
            }
        }

        platform::remove_stale(&self.endpoint)
            .await
            .map_err(|source| RaveError::EndpointCleanup {
                path: self.endpoint.as_path().to_path_buf(),
                source,
            })?;

        info!("Leader server on {} closed", self.endpoint);
        Ok(())
    }
}

impl Drop for LeaderServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Accepts followers and serves them from the leader's store.
pub struct LeaderServer;

impl LeaderServer {
    /// Start listening on `endpoint`.
    ///
    /// Must be called from within a tokio runtime. A failure to bind is
    /// returned as [`RaveError::Listen`].
    pub fn start(host: Arc<Host>, endpoint: &Endpoint) -> Result<LeaderServerHandle> {
        let listener = platform::bind(endpoint).map_err(|source| RaveError::Listen {
            address: endpoint.to_string(),
            source,
        })?;

        info!("Leader server listening on {}", endpoint);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            host,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(LeaderServerHandle {
            endpoint: endpoint.clone(),
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        mut listener: Listener,
        host: Arc<Host>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut connections = JoinSet::new();
        let mut next_conn: u64 = 0;
        let mut accept_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Leader server shutting down");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            accept_errors = 0;
                            next_conn += 1;
                            let conn_id = next_conn;
                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let host = host.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            connections.spawn(async move {
                                debug!("Follower connection {} opened", conn_id);
                                match host.serve(stream, &mut conn_shutdown).await {
                                    Ok(()) => debug!("Follower connection {} closed", conn_id),
                                    Err(e) => debug!("Follower connection {} ended: {}", conn_id, e),
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            // Errors like EMFILE persist; pause instead of spinning.
                            accept_errors = accept_errors.saturating_add(1);
                            let pause = accept_backoff(accept_errors);
                            error!("Leader server accept error: {} (retrying in {:?})", e, pause);
                            tokio::select! {
                                _ = &mut shutdown_rx => {
                                    debug!("Leader server shutting down");
                                    break;
                                }
                                _ = tokio::time::sleep(pause) => {}
                            }
                        }
                    }
                }
            }
        }

        // Destroy live connections before the listener goes away.
        connections.shutdown().await;
        active_connections.store(0, Ordering::Relaxed);
        drop(listener);
    }
}

/// Pause after the `consecutive`-th failed accept in a row.
fn accept_backoff(consecutive: u32) -> Duration {
    let exp = consecutive.saturating_sub(1).min(16);
    RaveConfig::ACCEPT_ERROR_BACKOFF
        .saturating_mul(1 << exp)
        .min(RaveConfig::MAX_ACCEPT_ERROR_BACKOFF)
}
