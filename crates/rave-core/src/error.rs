//! Error types for rave-core.
//!
//! A single error enum covers the local store, the IPC channel and the
//! leader election. Errors that cross the wire are reduced to a JSON-RPC
//! error code plus message and rebuilt on the guest side.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for rave-core.
#[derive(Debug, Error)]
pub enum RaveError {
    // Store errors
    #[error("Store at {location:?} is locked by another process")]
    Locked { location: PathBuf },

    #[error("Store is not open")]
    NotOpen,

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Election errors
    #[error("Gave up racing for leadership after {elapsed:?}")]
    RetryCeilingExceeded {
        elapsed: Duration,
        #[source]
        source: Box<RaveError>,
    },

    #[error("Failed to remove stale endpoint {path:?}: {source}")]
    EndpointCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Did not flush")]
    DidNotFlush {
        #[source]
        cause: Option<Box<RaveError>>,
    },

    #[error("Instance is closed")]
    Closed,

    #[error("Failed to open: {0}")]
    OpenFailed(#[source] std::sync::Arc<RaveError>),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Wire errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for rave-core operations.
pub type Result<T> = std::result::Result<T, RaveError>;

impl From<std::io::Error> for RaveError {
    fn from(err: std::io::Error) -> Self {
        RaveError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RaveError {
    fn from(err: serde_json::Error) -> Self {
        RaveError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for RaveError {
    fn from(err: rusqlite::Error) -> Self {
        RaveError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RaveError {
    /// Application error code for a store held by another process.
    pub const LOCKED_CODE: i32 = -32010;
    /// Application error code for a store that is not open.
    pub const NOT_OPEN_CODE: i32 = -32011;

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RaveError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32010: Store locked
    /// - -32011: Store not open
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RaveError::Json { .. } => -32700,
            RaveError::UnknownMethod { .. } => -32601,
            RaveError::Validation { .. } => -32602,
            RaveError::Locked { .. } => Self::LOCKED_CODE,
            RaveError::NotOpen | RaveError::Closed => Self::NOT_OPEN_CODE,
            RaveError::Remote { code, .. } => *code,
            _ => -32603,
        }
    }

    /// Rebuild an error received in a JSON-RPC error object.
    pub fn from_rpc_error(code: i32, message: String) -> Self {
        match code {
            Self::NOT_OPEN_CODE => RaveError::NotOpen,
            _ => RaveError::Remote { code, message },
        }
    }

    /// The error that made an open fail, or `self` for any other error.
    pub fn open_cause(&self) -> &RaveError {
        match self {
            RaveError::OpenFailed(cause) => cause,
            other => other,
        }
    }

    /// True when the store could not be opened because another process holds it.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, RaveError::Locked { .. })
    }

    /// The IO error kind behind this error, if any.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            RaveError::Io {
                source: Some(source),
                ..
            } => Some(source.kind()),
            RaveError::EndpointCleanup { source, .. }
            | RaveError::Listen { source, .. }
            | RaveError::Connect { source, .. } => Some(source.kind()),
            RaveError::RetryCeilingExceeded { source, .. } => source.io_kind(),
            RaveError::OpenFailed(cause) => cause.io_kind(),
            _ => None,
        }
    }
}
