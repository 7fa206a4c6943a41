//! Centralized configuration for rave-core.
//!
//! Fixed names and limits live on [`RaveConfig`]. Per-instance choices
//! (retry timing, socket override) go through [`crate::RaveDbBuilder`].

use std::time::Duration;

/// Names, timeouts and limits shared by every instance.
pub struct RaveConfig;

impl RaveConfig {
    /// File name of the Unix domain socket inside the store location.
    pub const SOCKET_FILE_NAME: &'static str = "rave.sock";
    /// Named pipe namespace used on Windows; the location is appended.
    pub const PIPE_NAMESPACE: &'static str = r"\\.\pipe\rave\";
    /// Advisory lock file held by the leader.
    pub const LOCK_FILE_NAME: &'static str = "LOCK";
    /// SQLite database file holding the entries.
    pub const DATA_FILE_NAME: &'static str = "data.sqlite";

    /// Total time an instance keeps racing for leadership under contention.
    pub const MAX_CONNECT_RETRY_TIME: Duration = Duration::from_secs(10);
    /// Pause before re-racing when no leader was ever reachable.
    pub const LEADER_RETRY_DELAY: Duration = Duration::from_millis(100);

    pub const MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
    /// First pause after a failed accept; doubles per consecutive failure.
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
    pub const MAX_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
    pub const ITERATOR_BATCH_SIZE: usize = 256;
    /// Capacity of the per-instance event channel.
    pub const EVENT_CAPACITY: usize = 64;
}
