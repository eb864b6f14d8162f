//! Link abstraction: unifies stream-oriented and datagram-oriented
//! UNIX-domain sockets into a single capability set.

mod unix;

pub use unix::UnixSocketLink;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::os::unix::io::RawFd;
use std::os::unix::net::SocketAddr;

use crate::error::Result;
use crate::registry::ConnectionHandle;

/// Deterministic, stable-per-peer handle derived from a datagram peer's
/// bound pathname, kept negative so it can never collide with a real
/// (non-negative) stream file descriptor. Used both by `create_client` and
/// by the server core to recognize a peer it has already registered.
pub fn datagram_peer_handle(peer: &SocketAddr) -> ConnectionHandle {
    let mut hasher = DefaultHasher::new();
    peer.as_pathname().map(|p| p.as_os_str()).hash(&mut hasher);
    let h = hasher.finish() as i64;
    -((h.unsigned_abs() as i64 % i32::MAX as i64) + 1) as RawFd
}

/// Which socket family a `listen` call should bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKind {
    Stream,
    Datagram,
}

/// Read-side blocking behavior for `recv_client`/`recv_packet`.
///
/// The event-loop-driven read path always uses non-blocking reads (it is
/// only called once the readiness facility has reported `IN`); `BLOCK` is
/// exposed for direct/manual use of a link outside the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvFlags(u8);

impl RecvFlags {
    pub const NONE: RecvFlags = RecvFlags(0);
    pub const BLOCK: RecvFlags = RecvFlags(1);

    pub fn blocking(self) -> bool {
        self.0 & 1 != 0
    }
}

/// Per-client state owned by a `ClientRecord`. A stream client owns its
/// accepted socket; a datagram "client" is just the peer address it was
/// promoted from, since all datagram peers share one underlying socket.
pub enum ClientLinkState {
    Stream(std::os::unix::net::UnixStream),
    Datagram { peer: SocketAddr },
}

impl ClientLinkState {
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            ClientLinkState::Stream(s) => Some(std::os::unix::io::AsRawFd::as_raw_fd(s)),
            ClientLinkState::Datagram { .. } => None,
        }
    }
}

/// The transport abstraction between the server core and the kernel
/// sockets. One link instance may support stream, datagram, or both kinds
/// simultaneously.
pub trait Link: Send + Sync {
    /// Creates and binds one endpoint of `kind`. Returns the endpoint's
    /// raw handle for registration with the readiness facility, or
    /// `NotSupported` if this link doesn't offer that kind.
    fn listen(&mut self, kind: ListenKind) -> Result<RawFd>;

    /// Accepts one pending connection on the stream listener.
    fn accept(&self) -> Result<(ConnectionHandle, ClientLinkState)>;

    /// Reads one datagram into `buf`. Atomic: either the whole packet
    /// arrives or `NoData`/`Pipe` is returned; never a partial datagram.
    fn recv_packet(&self, buf: &mut [u8], flags: RecvFlags) -> Result<(usize, SocketAddr)>;

    /// Reads one framed message from a stream client: header first, then
    /// the full payload with all-or-nothing semantics.
    fn recv_client(&self, state: &mut ClientLinkState, buf: &mut [u8], flags: RecvFlags) -> Result<usize>;

    /// Sends a complete framed message to a registered client.
    fn send_client(&self, state: &ClientLinkState, message: &[u8]) -> Result<()>;

    /// Replies to an unregistered datagram peer using the address embedded
    /// in the receive context.
    fn respond(&self, peer: &SocketAddr, message: &[u8]) -> Result<()>;

    /// Promotes a datagram peer into a registered client.
    fn create_client(&self, peer: SocketAddr) -> (ConnectionHandle, ClientLinkState);

    /// Tears down one client's link state (closes the stream socket; a
    /// no-op for datagram peers, which own no dedicated socket).
    fn destroy_client(&self, state: ClientLinkState);

    /// Tears down the link itself (listeners, datagram socket, bound paths).
    fn destroy(&mut self);
}
