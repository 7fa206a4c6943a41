//! Rave Core - one embedded key-value store shared by many local processes.
//!
//! Any number of processes may open the same location. Exactly one of them
//! becomes the leader and holds the store; the others become followers and
//! reach the store through the leader over a Unix domain socket (or a named
//! pipe on Windows). When the leader goes away a new one is elected
//! automatically. The API is the same in both roles.
//!
//! # Example
//!
//! ```rust,no_run
//! use rave_core::RaveDb;
//!
//! #[tokio::main]
//! async fn main() -> rave_core::Result<()> {
//!     let db = RaveDb::open("/tmp/my-store").await?;
//!
//!     db.put("greeting", "hello").await?;
//!     let value = db.get("greeting").await?;
//!     assert_eq!(value.as_deref(), Some(&b"hello"[..]));
//!
//!     println!("leader: {}", db.is_leader());
//!     db.close().await
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod resources;
pub mod store;

mod db;
mod election;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::RaveConfig;
pub use db::{RaveDb, RaveDbBuilder, RaveEvent, RaveIterator, Role, Status};
pub use error::{RaveError, Result};
pub use platform::Endpoint;
pub use store::{BatchOp, Blob, Entry, KeyRange, LocalStore};
