//! Memory Portal Protocol
//!
//! Cross-process IPC over named OS shared memory, in three layers:
//!
//! - [`SharedRegion`]: a named, fixed-size block of memory mapped into two
//!   or more processes, with a self-describing header and a one-way
//!   `shutdown` flag.
//! - [`Ring`]: a lock-free multi-producer / multi-consumer FIFO of
//!   fixed-size nodes over a shared region, with futex-backed wakeups on
//!   its slow paths.
//! - [`RpcChannel`]: a bidirectional request/response channel built from
//!   two rings, a 64-byte packet framing protocol, a pool of receive
//!   workers, and a user handler for inbound requests.
//!
//! Two processes that agree on a string name interoperate with no broker in
//! between:
//!
//! ```no_run
//! use mem_portal::{ChannelConfig, RpcChannel, RpcHandler};
//!
//! # fn main() -> mem_portal::Result<()> {
//! // Whichever endpoint constructs first becomes the owner.
//! let handler = RpcHandler::sync_bytes(|_id, payload| Ok(payload.to_vec()));
//! let server = RpcChannel::new(ChannelConfig::new("demo"), Some(handler))?;
//!
//! let client = RpcChannel::new(ChannelConfig::new("demo"), None)?;
//! let reply = client.remote_request(b"ping", 1_000, None)?;
//! assert!(reply.success);
//! assert_eq!(reply.data, b"ping");
//! # drop(server);
//! # Ok(())
//! # }
//! ```
//!
//! Channels whose handler issues nested requests on the same channel must
//! be constructed with `receive_threads >= 2`, or the worker running the
//! handler has nobody left to deliver the nested reply.

#![cfg(unix)]

pub mod error;
pub mod event;
pub mod frame;
pub mod handler;
mod platform;
pub mod region;
pub mod ring;
pub mod rpc;
pub mod stats;

pub use error::{IpcError, Result};
pub use event::ShmEvent;
pub use handler::{BoxedHandlerFuture, HandlerError, HandlerResult, RpcHandler};
pub use region::SharedRegion;
pub use ring::Ring;
pub use rpc::{CancelToken, ChannelConfig, ProtocolVersion, Role, RpcChannel, RpcResponse};
pub use stats::{ChannelStats, StatsSnapshot};

/// Re-export of the commonly used surface
pub mod prelude {
    pub use crate::error::{IpcError, Result};
    pub use crate::handler::{HandlerResult, RpcHandler};
    pub use crate::ring::Ring;
    pub use crate::rpc::{CancelToken, ChannelConfig, Role, RpcChannel, RpcResponse};
}

/// Current crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
