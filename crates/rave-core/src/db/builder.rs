//! Builder for configuring a RaveDb instance.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RaveConfig;
use crate::db::state::{InstanceState, RaveOptions};
use crate::db::RaveDb;
use crate::election;
use crate::error::{RaveError, Result};
use crate::platform::Endpoint;

/// Builder for configuring a [`RaveDb`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn demo() -> rave_core::Result<()> {
/// use rave_core::RaveDb;
/// use std::time::Duration;
///
/// let db = RaveDb::builder("/var/lib/myapp/store")
///     .retry_ceiling(Duration::from_secs(30))
///     .open()
///     .await?;
/// # db.close().await
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RaveDbBuilder {
    location: PathBuf,
    socket_path: Option<PathBuf>,
    retry_ceiling: Duration,
    retry_delay: Duration,
    create_if_missing: bool,
    iterator_batch_size: usize,
}

impl RaveDbBuilder {
    /// Create a new builder for the store at `location`.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            socket_path: None,
            retry_ceiling: RaveConfig::MAX_CONNECT_RETRY_TIME,
            retry_delay: RaveConfig::LEADER_RETRY_DELAY,
            create_if_missing: true,
            iterator_batch_size: RaveConfig::ITERATOR_BATCH_SIZE,
        }
    }

    /// Rendezvous on `path` instead of the address derived from the location.
    ///
    /// Every instance of the location must use the same override.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// How long lock contention may last before opening fails.
    ///
    /// Default: 10 seconds
    pub fn retry_ceiling(mut self, ceiling: Duration) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Pause between leadership attempts when no leader is reachable.
    ///
    /// Default: 100 ms
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Create the location directory if it does not exist.
    ///
    /// Default: `true`
    pub fn create_if_missing(mut self, enable: bool) -> Self {
        self.create_if_missing = enable;
        self
    }

    /// Entries fetched per round trip by [`RaveDb::iterator`].
    ///
    /// Default: 256
    pub fn iterator_batch_size(mut self, size: usize) -> Self {
        self.iterator_batch_size = size;
        self
    }

    /// Create the instance and start racing for the location.
    ///
    /// Returns immediately; calls made before the race resolves are queued.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<RaveDb> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RaveError::Config {
            message: "RaveDb must be created inside a tokio runtime".to_string(),
        })?;

        if self.iterator_batch_size == 0 {
            return Err(RaveError::Config {
                message: "iterator_batch_size must be at least 1".to_string(),
            });
        }

        let location = std::path::absolute(&self.location)
            .map_err(|e| RaveError::io_with_path(e, &self.location))?;
        let endpoint = Endpoint::resolve(&location, self.socket_path.as_deref())?;

        let state = Arc::new(InstanceState::new(
            location,
            endpoint,
            RaveOptions {
                retry_ceiling: self.retry_ceiling,
                retry_delay: self.retry_delay,
                create_if_missing: self.create_if_missing,
                iterator_batch_size: self.iterator_batch_size,
            },
            RaveConfig::EVENT_CAPACITY,
        ));

        let supervisor = runtime.spawn(election::run(state.clone()));

        Ok(RaveDb {
            state,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Build the instance and wait until it is open.
    pub async fn open(self) -> Result<RaveDb> {
        let db = self.build()?;
        match db.opened().await {
            Ok(()) => Ok(db),
            Err(e) => {
                let _ = db.close().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let builder = RaveDbBuilder::new("/tmp/db");
        assert_eq!(builder.retry_ceiling, Duration::from_secs(10));
        assert_eq!(builder.retry_delay, Duration::from_millis(100));
        assert!(builder.create_if_missing);
        assert_eq!(builder.iterator_batch_size, 256);
        assert!(builder.socket_path.is_none());
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = RaveDbBuilder::new("/tmp/db").build().err().unwrap();
        assert!(matches!(err, RaveError::Config { .. }));
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let err = RaveDbBuilder::new("/tmp/db")
            .iterator_batch_size(0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RaveError::Config { .. }));
    }
}
