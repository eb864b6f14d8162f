//! # gracht
//!
//! A lightweight, transport-agnostic RPC runtime for exchanging framed
//! messages between a server and many clients over local UNIX-domain
//! sockets: stream, datagram, or both at once.

pub mod arena;
pub mod cli;
pub mod error;
pub mod link;
pub mod logging;
pub mod readiness;
pub mod registry;
pub mod server;
pub mod wire;
pub mod worker;

pub use cli::Args;
pub use error::{GrachtError, Result};
pub use link::{ClientLinkState, Link, ListenKind, RecvFlags, UnixSocketLink};
pub use registry::{ActionDescriptor, ClientRegistry, ConnectionHandle, ProtocolRegistry, SubscriptionBitmap};
pub use server::{ActionContext, ActionHandler, GrachtServer, GrachtServerConfig, ResponseTarget, ServerCallbacks, ServerHandle};
pub use wire::{Message, MessageHeader, ParamKind, ParamValue, ALL_PROTOCOLS, CONTROL_PROTOCOL};

/// The current version of the gracht runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values for servers and the demo binary.
pub mod defaults {
    /// Default maximum framed message size, in bytes.
    pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024;

    /// Default worker count; below this the server runs single-threaded.
    pub const MULTI_THREADED_THRESHOLD: usize = 2;

    /// Default socket path for the demo binary's stream link.
    pub const STREAM_SOCKET_PATH: &str = "/tmp/gracht.sock";

    /// Default socket path for the demo binary's datagram link.
    pub const DATAGRAM_SOCKET_PATH: &str = "/tmp/gracht.dgram.sock";
}
