//! Platform abstraction layer for the local channel.
//!
//! All `#[cfg]` blocks for OS-specific IPC live here:
//! - `endpoint` - derives the rendezvous address from a store location
//! - `transport` - connects, binds and accepts on that address
//!
//! # Supported Platforms
//!
//! - **Linux / macOS**: Unix domain socket inside the store location
//! - **Windows**: named pipe keyed by the store location

pub mod endpoint;
pub mod transport;

pub use endpoint::Endpoint;
pub use transport::{bind, connect, remove_stale, ClientStream, Listener, ServerStream};

