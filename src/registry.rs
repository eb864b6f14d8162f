//! Client registry and protocol registry, the server's two hash-table-backed
//! data structures, plus the 256-bit subscription bitmap.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::{GrachtError, Result};
use crate::link::ClientLinkState;
use crate::server::ActionHandler;
use crate::wire::ALL_PROTOCOLS;

/// Opaque per-client connection handle, unique within a running server.
/// Concretely the raw file descriptor of the client's stream socket, or a
/// synthetic handle derived from a datagram peer's address hash.
pub type ConnectionHandle = RawFd;

/// 256-bit mask, one bit per protocol id, selecting which protocols a
/// client receives broadcasts for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionBitmap([u32; 8]);

impl SubscriptionBitmap {
    pub fn new() -> Self {
        Self([0u32; 8])
    }

    /// Sets the bit for `protocol_id`. `0xFF` sets every bit.
    pub fn subscribe(&mut self, protocol_id: u8) {
        if protocol_id == ALL_PROTOCOLS {
            self.0 = [u32::MAX; 8];
            return;
        }
        let block = (protocol_id / 32) as usize;
        let offset = protocol_id % 32;
        self.0[block] |= 1 << offset;
    }

    /// Clears the bit for `protocol_id`. `0xFF` clears every bit and
    /// returns `true` to signal the caller should fully destroy the client.
    pub fn unsubscribe(&mut self, protocol_id: u8) -> bool {
        if protocol_id == ALL_PROTOCOLS {
            self.0 = [0u32; 8];
            return true;
        }
        let block = (protocol_id / 32) as usize;
        let offset = protocol_id % 32;
        self.0[block] &= !(1 << offset);
        false
    }

    pub fn is_subscribed(&self, protocol_id: u8) -> bool {
        if protocol_id == ALL_PROTOCOLS {
            return false;
        }
        let block = (protocol_id / 32) as usize;
        let offset = protocol_id % 32;
        self.0[block] & (1 << offset) != 0
    }
}

/// One registered client: its handle, link-specific state, and which
/// protocols it is subscribed to.
pub struct ClientRecord {
    pub handle: ConnectionHandle,
    pub link_state: ClientLinkState,
    pub subscriptions: SubscriptionBitmap,
}

/// Keyed by connection handle. Created on accept (stream) or first
/// subscribe (datagram); destroyed on disconnect, full-unsubscribe, or
/// shutdown.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ConnectionHandle, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ClientRecord) {
        self.clients.insert(record.handle, record);
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&ClientRecord> {
        self.clients.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&handle)
    }

    pub fn contains(&self, handle: ConnectionHandle) -> bool {
        self.clients.contains_key(&handle)
    }

    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<ClientRecord> {
        self.clients.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.clients.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionHandle, &ClientRecord)> {
        self.clients.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionHandle, ClientRecord)> + '_ {
        self.clients.drain()
    }
}

/// One callable entry within a protocol, identified by an 8-bit action
/// index.
pub struct ActionDescriptor {
    pub action_id: u8,
    pub handler: ActionHandler,
}

/// `{protocol id, ordered table of action descriptors}`. Built-in protocol
/// id 0 is the control protocol.
pub struct ProtocolRecord {
    pub protocol_id: u8,
    pub actions: Vec<ActionDescriptor>,
}

impl ProtocolRecord {
    pub fn action(&self, action_id: u8) -> Option<&ActionHandler> {
        self.actions.iter().find(|a| a.action_id == action_id).map(|a| &a.handler)
    }
}

/// Keyed by protocol id.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<u8, ProtocolRecord>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol_id: u8, actions: Vec<ActionDescriptor>) -> Result<()> {
        if self.protocols.contains_key(&protocol_id) {
            return Err(GrachtError::AlreadyInitialized);
        }
        self.protocols.insert(protocol_id, ProtocolRecord { protocol_id, actions });
        Ok(())
    }

    pub fn unregister(&mut self, protocol_id: u8) -> Result<()> {
        self.protocols.remove(&protocol_id).map(|_| ()).ok_or(GrachtError::NotFound)
    }

    pub fn lookup(&self, protocol_id: u8, action_id: u8) -> Option<&ActionHandler> {
        self.protocols.get(&protocol_id).and_then(|p| p.action(action_id))
    }
}
