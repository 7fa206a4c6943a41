//! Local channel between instances of one location.
//!
//! Length-prefixed JSON-RPC 2.0 over a Unix domain socket or named pipe.
//!
//! # Architecture
//!
//! - **Guest**: queues an instance's calls and relays them over whatever transport is bridged
//! - **Host**: serves a store's operations to one connected guest
//! - **Server**: runs on the leader, accepts followers and hands each one to the host
//! - **Protocol**: shared framing and JSON-RPC types used by both

pub mod guest;
pub mod host;
pub mod protocol;
pub mod server;

pub use guest::Guest;
pub use host::Host;
pub use protocol::{IpcRequest, IpcResponse};
pub use server::{LeaderServer, LeaderServerHandle};
