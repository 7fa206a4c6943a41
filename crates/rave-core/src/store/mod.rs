//! Embedded key-value store and the operation vocabulary spoken over IPC.
//!
//! - [`LocalStore`] owns the on-disk data and enforces one open handle per location.
//! - [`Operation`] / [`Reply`] describe every call a guest can make.
//! - [`Dispatch`] is what a host serves: anything that can execute an operation.

pub mod local;
pub mod ops;

pub use local::LocalStore;
pub use ops::{BatchOp, Blob, Entry, KeyRange, Operation, Reply};

use crate::error::Result;

/// Executes store operations on behalf of a host or a bypassed guest.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, op: Operation) -> Result<Reply>;
}
