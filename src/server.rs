//! Server core: event loop, client/protocol registries, the built-in
//! control protocol, and dispatch to either inline or worker-pool execution.

use std::os::unix::io::RawFd;
use std::os::unix::net::SocketAddr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaBlock, StaticPair, CONTEXT_RESERVE};
use crate::error::{GrachtError, Result};
use crate::link::{datagram_peer_handle, Link, ListenKind, RecvFlags};
use crate::readiness::{EventMask, Readiness};
use crate::registry::{ActionDescriptor, ClientRecord, ClientRegistry, ConnectionHandle, ProtocolRegistry, SubscriptionBitmap};
use crate::wire::{Message, ParamValue, CONTROL_PROTOCOL};
use crate::worker::{DispatchedMessage, WorkerPool};

/// The callback invoked for one protocol action. Cheap to clone (an `Arc`),
/// so the protocol registry can hand a copy to a worker thread without
/// holding the registry lock for the duration of the call.
pub type ActionHandler = Arc<dyn Fn(&ActionContext) + Send + Sync>;

const CONTROL_ACTION_SUBSCRIBE: u8 = 0;
const CONTROL_ACTION_UNSUBSCRIBE: u8 = 1;
const CONTROL_ACTION_ERROR: u8 = 2;

/// Default number of pending events read from the readiness facility per
/// `wait` call.
const MAX_EVENTS_PER_WAIT: usize = 32;

/// How a response should be addressed: either at a client already present
/// in the registry, or at a datagram peer that has never subscribed and so
/// was never promoted into one. Unregistered senders can still receive a
/// direct response.
#[derive(Debug, Clone)]
pub enum ResponseTarget {
    Client(ConnectionHandle),
    DatagramPeer(SocketAddr),
}

/// Everything protected by the server's single coarse mutex: the link, the
/// client registry, and the protocol registry. The arena has its own
/// internal lock since it is also reached from worker threads independent
/// of this one.
struct SharedState {
    link: Box<dyn Link>,
    clients: ClientRegistry,
    protocols: ProtocolRegistry,
}

/// A cheap, cloneable capability granted to action handlers: lets a handler
/// (running inline or on a worker thread) respond to its caller, push a
/// targeted event, or broadcast one to every subscribed client.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Mutex<SharedState>>,
    max_message_size: u32,
}

impl ServerHandle {
    fn respond_raw(&self, origin: &ResponseTarget, id: u32, protocol: u8, action: u8, out_params: Vec<ParamValue>) -> Result<()> {
        let message = Message::new(id, protocol, action, vec![], out_params);
        let bytes = message.encode();
        let shared = self.shared.lock();
        match origin {
            ResponseTarget::Client(handle) => {
                let client = shared.clients.get(*handle).ok_or(GrachtError::NotFound)?;
                shared.link.send_client(&client.link_state, &bytes)
            }
            ResponseTarget::DatagramPeer(peer) => shared.link.respond(peer, &bytes),
        }
    }

    /// Sends a reply carrying `id` (copied from the originating request) to
    /// whichever peer that request came from.
    pub fn respond(&self, origin: &ResponseTarget, id: u32, protocol: u8, action: u8, out_params: Vec<ParamValue>) -> Result<()> {
        self.respond_raw(origin, id, protocol, action, out_params)
    }

    fn send_control_error(&self, origin: &ResponseTarget, request_id: u32, error: &GrachtError) {
        let out = vec![ParamValue::Scalar32(request_id), ParamValue::Scalar32(error.errno() as u32)];
        if let Err(e) = self.respond_raw(origin, request_id, CONTROL_PROTOCOL, CONTROL_ACTION_ERROR, out) {
            tracing::warn!(error = %e, "failed to deliver control error notification");
        }
    }

    /// Sends an unsolicited event to one already-registered client.
    pub fn send_event(&self, handle: ConnectionHandle, protocol: u8, action: u8, out_params: Vec<ParamValue>) -> Result<()> {
        let message = Message::new(0, protocol, action, out_params, vec![]);
        let bytes = message.encode();
        let shared = self.shared.lock();
        let client = shared.clients.get(handle).ok_or(GrachtError::NotFound)?;
        shared.link.send_client(&client.link_state, &bytes)
    }

    /// Sends an unsolicited event to every client subscribed to `protocol`.
    /// A send failure on one client is logged and does not abort delivery
    /// to the rest.
    pub fn broadcast_event(&self, protocol: u8, action: u8, out_params: Vec<ParamValue>) {
        let message = Message::new(0, protocol, action, out_params, vec![]);
        let bytes = message.encode();
        let shared = self.shared.lock();
        for (_, client) in shared.clients.iter() {
            if !client.subscriptions.is_subscribed(protocol) {
                continue;
            }
            if let Err(e) = shared.link.send_client(&client.link_state, &bytes) {
                tracing::warn!(error = %e, handle = client.handle, "broadcast delivery to one client failed");
            }
        }
    }

    fn subscribe(&self, origin: &ResponseTarget, protocol_id: u8) -> Result<()> {
        let mut shared = self.shared.lock();
        match origin {
            ResponseTarget::Client(handle) => {
                let client = shared.clients.get_mut(*handle).ok_or(GrachtError::NotFound)?;
                client.subscriptions.subscribe(protocol_id);
                Ok(())
            }
            ResponseTarget::DatagramPeer(peer) => {
                let (handle, link_state) = shared.link.create_client(peer.clone());
                let mut subscriptions = SubscriptionBitmap::new();
                subscriptions.subscribe(protocol_id);
                shared.clients.insert(ClientRecord { handle, link_state, subscriptions });
                Ok(())
            }
        }
    }

    fn unsubscribe(&self, origin: &ResponseTarget, protocol_id: u8) -> Result<()> {
        let handle = match origin {
            ResponseTarget::Client(handle) => *handle,
            // A peer that never subscribed has nothing to unsubscribe from.
            ResponseTarget::DatagramPeer(_) => return Ok(()),
        };
        let mut shared = self.shared.lock();
        let destroy = {
            let client = shared.clients.get_mut(handle).ok_or(GrachtError::NotFound)?;
            client.subscriptions.unsubscribe(protocol_id)
        };
        if destroy {
            if let Some(record) = shared.clients.remove(handle) {
                shared.link.destroy_client(record.link_state);
            }
        }
        Ok(())
    }
}

/// Everything an action handler needs: the decoded request and a handle
/// back into the server to reply or publish events.
pub struct ActionContext {
    pub id: u32,
    pub protocol: u8,
    pub action: u8,
    pub origin: ResponseTarget,
    pub params: Vec<ParamValue>,
    pub server: ServerHandle,
}

impl ActionContext {
    /// Replies to this request's originator, copying its `id` into the
    /// response header.
    pub fn respond(&self, out_params: Vec<ParamValue>) -> Result<()> {
        self.server.respond(&self.origin, self.id, self.protocol, self.action, out_params)
    }
}

fn extract_u8(param: Option<&ParamValue>) -> Option<u8> {
    match param {
        Some(ParamValue::Scalar8(v)) => Some(*v),
        Some(ParamValue::Scalar32(v)) => Some(*v as u8),
        Some(ParamValue::Scalar16(v)) => Some(*v as u8),
        Some(ParamValue::Scalar64(v)) => Some(*v as u8),
        _ => None,
    }
}

fn control_protocol_actions() -> Vec<ActionDescriptor> {
    vec![
        ActionDescriptor {
            action_id: CONTROL_ACTION_SUBSCRIBE,
            handler: Arc::new(|ctx: &ActionContext| {
                let Some(protocol_id) = extract_u8(ctx.params.first()) else {
                    tracing::warn!("subscribe control message missing protocol id parameter");
                    return;
                };
                if let Err(e) = ctx.server.subscribe(&ctx.origin, protocol_id) {
                    tracing::warn!(error = %e, protocol_id, "subscribe failed");
                }
            }),
        },
        ActionDescriptor {
            action_id: CONTROL_ACTION_UNSUBSCRIBE,
            handler: Arc::new(|ctx: &ActionContext| {
                let Some(protocol_id) = extract_u8(ctx.params.first()) else {
                    tracing::warn!("unsubscribe control message missing protocol id parameter");
                    return;
                };
                if let Err(e) = ctx.server.unsubscribe(&ctx.origin, protocol_id) {
                    tracing::warn!(error = %e, protocol_id, "unsubscribe failed");
                }
            }),
        },
    ]
}

/// Invokes the action named by a decoded message, or replies with a
/// control-protocol error if no handler is registered for it. Shared
/// between the inline and worker-pool dispatch paths so both execution
/// modes run identical lookup semantics.
fn invoke_action(shared: &Arc<Mutex<SharedState>>, max_message_size: u32, origin: ResponseTarget, data: &[u8]) {
    // Acquire fence between a worker picking a queued message off the
    // shared buffer and reading its contents.
    fence(Ordering::Acquire);

    let message = match Message::decode(data, max_message_size) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "dropping undecodable message");
            return;
        }
    };

    let server = ServerHandle { shared: Arc::clone(shared), max_message_size };
    let handler = shared.lock().protocols.lookup(message.header.protocol, message.header.action).cloned();

    match handler {
        Some(handler) => {
            let ctx = ActionContext {
                id: message.header.id,
                protocol: message.header.protocol,
                action: message.header.action,
                origin,
                params: message.params,
                server,
            };
            handler(&ctx);
        }
        None => server.send_control_error(&origin, message.header.id, &GrachtError::NotFound),
    }
}

/// Optional hooks fired as clients connect and disconnect.
#[derive(Default)]
pub struct ServerCallbacks {
    pub on_client_connected: Option<Box<dyn Fn(ConnectionHandle) + Send + Sync>>,
    pub on_client_disconnected: Option<Box<dyn Fn(ConnectionHandle) + Send + Sync>>,
}

/// Configuration consumed by `GrachtServer::initialize`.
pub struct GrachtServerConfig {
    pub link: Box<dyn Link>,
    /// `0` or `1` selects the single-threaded cooperative mode; `>= 2`
    /// spins up a worker pool of that size.
    pub workers: usize,
    pub max_message_size: u32,
    pub callbacks: ServerCallbacks,
}

impl GrachtServerConfig {
    pub fn new(link: Box<dyn Link>) -> Self {
        GrachtServerConfig { link, workers: 0, max_message_size: 16 * 1024, callbacks: ServerCallbacks::default() }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_message_size(mut self, max_message_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn on_client_connected(mut self, f: impl Fn(ConnectionHandle) + Send + Sync + 'static) -> Self {
        self.callbacks.on_client_connected = Some(Box::new(f));
        self
    }

    pub fn on_client_disconnected(mut self, f: impl Fn(ConnectionHandle) + Send + Sync + 'static) -> Self {
        self.callbacks.on_client_disconnected = Some(Box::new(f));
        self
    }
}

enum ExecutionMode {
    SingleThreaded { buffers: StaticPair },
    MultiThreaded { arena: Arc<Arena>, pool: WorkerPool },
}

/// Outcome of attempting to drain one readable handle once. Built without
/// touching anything outside `ExecutionMode` and the link, so it can be
/// returned before the caller runs any `&mut self` dispatch.
enum DrainOutcome {
    Inline(ResponseTarget, Vec<u8>),
    Enqueue(DispatchedMessage),
    /// A message was rejected for exceeding `max_message_size`; a
    /// control-protocol error carrying this id is owed to `origin`, but the
    /// connection itself stays up.
    TooLarge(ResponseTarget, u32),
    Disconnect,
    Empty,
    Error,
}

/// The runtime server: owns the link, the readiness facility, both
/// registries (behind `SharedState`'s mutex), and the buffer provider
/// appropriate to its execution mode.
pub struct GrachtServer {
    shared: Arc<Mutex<SharedState>>,
    readiness: Readiness,
    stream_handle: Option<RawFd>,
    datagram_handle: Option<RawFd>,
    mode: ExecutionMode,
    max_message_size: u32,
    callbacks: ServerCallbacks,
    running: bool,
}

impl GrachtServer {
    /// Brings up the link's listening endpoints, the readiness facility,
    /// the buffer provider, and (in multi-threaded mode) the worker pool,
    /// then registers the built-in control protocol.
    pub fn initialize(mut config: GrachtServerConfig) -> Result<Self> {
        let mut readiness = Readiness::create(MAX_EVENTS_PER_WAIT)?;

        let stream_handle = match config.link.listen(ListenKind::Stream) {
            Ok(fd) => {
                readiness.add(fd)?;
                Some(fd)
            }
            Err(GrachtError::NotSupported) => None,
            Err(e) => return Err(e),
        };
        let datagram_handle = match config.link.listen(ListenKind::Datagram) {
            Ok(fd) => {
                readiness.add(fd)?;
                Some(fd)
            }
            Err(GrachtError::NotSupported) => None,
            Err(e) => return Err(e),
        };
        if stream_handle.is_none() && datagram_handle.is_none() {
            return Err(GrachtError::NotSupported);
        }

        let mut protocols = ProtocolRegistry::new();
        protocols.register(CONTROL_PROTOCOL, control_protocol_actions())?;

        let shared = Arc::new(Mutex::new(SharedState { link: config.link, clients: ClientRegistry::new(), protocols }));

        let alloc_size = config.max_message_size as usize + CONTEXT_RESERVE;
        let mode = if config.workers < 2 {
            ExecutionMode::SingleThreaded { buffers: StaticPair::new(alloc_size) }
        } else {
            let arena = Arena::new(config.workers, alloc_size);
            let pool_shared = Arc::clone(&shared);
            let max_message_size = config.max_message_size;
            let pool = WorkerPool::new(config.workers, move |msg: DispatchedMessage| {
                let len = msg.len;
                let handle = msg.handle;
                let mut buffer = msg.buffer;
                invoke_action(&pool_shared, max_message_size, ResponseTarget::Client(handle), &buffer.as_mut_slice()[..len]);
            });
            ExecutionMode::MultiThreaded { arena, pool }
        };

        Ok(GrachtServer {
            shared,
            readiness,
            stream_handle,
            datagram_handle,
            mode,
            max_message_size: config.max_message_size,
            callbacks: std::mem::take(&mut config.callbacks),
            running: false,
        })
    }

    /// Registers an application protocol. Must be called before `run` (or
    /// at least before any client can reach it); the control protocol
    /// already occupies id `0`.
    pub fn register_protocol(&mut self, protocol_id: u8, actions: Vec<ActionDescriptor>) -> Result<()> {
        if protocol_id == CONTROL_PROTOCOL {
            return Err(GrachtError::AlreadyInitialized);
        }
        self.shared.lock().protocols.register(protocol_id, actions)
    }

    pub fn unregister_protocol(&mut self, protocol_id: u8) -> Result<()> {
        self.shared.lock().protocols.unregister(protocol_id)
    }

    /// A cloneable capability for responding to clients from outside the
    /// event loop (tests, or a CLI command thread sending unsolicited
    /// events).
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { shared: Arc::clone(&self.shared), max_message_size: self.max_message_size }
    }

    pub fn broadcast_event(&self, protocol: u8, action: u8, out_params: Vec<ParamValue>) {
        self.handle().broadcast_event(protocol, action, out_params)
    }

    pub fn send_event(&self, handle: ConnectionHandle, protocol: u8, action: u8, out_params: Vec<ParamValue>) -> Result<()> {
        self.handle().send_event(handle, protocol, action, out_params)
    }

    pub fn connected_clients(&self) -> usize {
        self.shared.lock().clients.len()
    }

    /// Runs the event loop (poll, then dispatch, then repeat) until `stop`
    /// is called from another thread or handler. Wakes at least every
    /// 500ms to re-check the running flag even with no pending I/O, since
    /// there is no portable way to interrupt a blocking `mio::Poll::poll`
    /// from outside.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        while self.running {
            let events = self.readiness.wait(Some(Duration::from_millis(500)))?;
            for event in events {
                self.handle_event(event.handle, event.mask);
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Requests the event loop stop after its current `wait` returns.
    pub fn stop(&mut self) {
        self.running = false;
    }

    fn handle_event(&mut self, handle: RawFd, mask: EventMask) {
        if Some(handle) == self.stream_handle {
            self.accept_clients();
            return;
        }
        if Some(handle) == self.datagram_handle {
            self.drain_datagram();
            return;
        }
        if mask.contains(EventMask::DISCONNECT) {
            self.disconnect_client(handle);
        } else {
            self.drain_client(handle);
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let accepted = self.shared.lock().link.accept();
            match accepted {
                Ok((handle, link_state)) => {
                    if let Err(e) = self.readiness.add(handle) {
                        tracing::warn!(error = %e, handle, "failed to register new client for readiness events");
                    }
                    self.shared.lock().clients.insert(ClientRecord { handle, link_state, subscriptions: SubscriptionBitmap::new() });
                    if let Some(cb) = &self.callbacks.on_client_connected {
                        cb(handle);
                    }
                }
                Err(GrachtError::NoData) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn disconnect_client(&mut self, handle: RawFd) {
        let _ = self.readiness.remove(handle);
        if !self.shared.lock().clients.contains(handle) {
            return;
        }
        if let Some(cb) = &self.callbacks.on_client_disconnected {
            cb(handle);
        }
        let removed = self.shared.lock().clients.remove(handle);
        if let Some(record) = removed {
            self.shared.lock().link.destroy_client(record.link_state);
        }
    }

    fn invoke_inline(&self, origin: ResponseTarget, data: &[u8]) {
        invoke_action(&self.shared, self.max_message_size, origin, data);
    }

    fn try_recv_client(&mut self, handle: RawFd) -> DrainOutcome {
        match &mut self.mode {
            ExecutionMode::SingleThreaded { buffers } => {
                let mut shared = self.shared.lock();
                let SharedState { link, clients, .. } = &mut *shared;
                let Some(client) = clients.get_mut(handle) else {
                    return DrainOutcome::Empty;
                };
                match link.recv_client(&mut client.link_state, &mut buffers.recv, RecvFlags::NONE) {
                    Ok(len) => DrainOutcome::Inline(ResponseTarget::Client(handle), buffers.recv[..len].to_vec()),
                    Err(GrachtError::NoData) => DrainOutcome::Empty,
                    Err(GrachtError::TooLarge { id }) => DrainOutcome::TooLarge(ResponseTarget::Client(handle), id),
                    Err(GrachtError::Pipe) => DrainOutcome::Disconnect,
                    Err(e) => {
                        tracing::warn!(error = %e, handle, "client recv failed");
                        DrainOutcome::Error
                    }
                }
            }
            ExecutionMode::MultiThreaded { arena, .. } => {
                let mut block: ArenaBlock = match arena.acquire() {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(error = %e, handle, "dropping inbound message: arena exhausted");
                        return DrainOutcome::Error;
                    }
                };
                let mut shared = self.shared.lock();
                let SharedState { link, clients, .. } = &mut *shared;
                let Some(client) = clients.get_mut(handle) else {
                    return DrainOutcome::Empty;
                };
                match link.recv_client(&mut client.link_state, block.as_mut_slice(), RecvFlags::NONE) {
                    Ok(len) => DrainOutcome::Enqueue(DispatchedMessage { handle, buffer: block, len }),
                    Err(GrachtError::NoData) => DrainOutcome::Empty,
                    Err(GrachtError::TooLarge { id }) => DrainOutcome::TooLarge(ResponseTarget::Client(handle), id),
                    Err(GrachtError::Pipe) => DrainOutcome::Disconnect,
                    Err(e) => {
                        tracing::warn!(error = %e, handle, "client recv failed");
                        DrainOutcome::Error
                    }
                }
            }
        }
    }

    fn drain_client(&mut self, handle: RawFd) {
        loop {
            match self.try_recv_client(handle) {
                DrainOutcome::Inline(origin, data) => self.invoke_inline(origin, &data),
                DrainOutcome::Enqueue(msg) => {
                    if let ExecutionMode::MultiThreaded { pool, .. } = &self.mode {
                        pool.dispatch(msg);
                    }
                }
                DrainOutcome::TooLarge(origin, id) => {
                    self.handle().send_control_error(&origin, id, &GrachtError::TooLarge { id });
                }
                DrainOutcome::Disconnect => {
                    self.disconnect_client(handle);
                    return;
                }
                DrainOutcome::Empty | DrainOutcome::Error => return,
            }
        }
    }

    fn try_recv_datagram(&mut self) -> DrainOutcome {
        match &mut self.mode {
            ExecutionMode::SingleThreaded { buffers } => {
                let shared = self.shared.lock();
                match shared.link.recv_packet(&mut buffers.recv, RecvFlags::NONE) {
                    Ok((n, peer)) => {
                        let origin = datagram_origin(&shared.clients, peer);
                        // A datagram arrives whole, so the size bound against
                        // `max_message_size` is checked here rather than
                        // inside `recv_packet`: only here is the sender's
                        // address (needed to answer an oversized datagram
                        // with a control error) still in scope.
                        match Message::decode_header(&buffers.recv[..n], self.max_message_size) {
                            Ok(_) => DrainOutcome::Inline(origin, buffers.recv[..n].to_vec()),
                            Err(GrachtError::TooLarge { id }) => DrainOutcome::TooLarge(origin, id),
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping undecodable datagram");
                                DrainOutcome::Error
                            }
                        }
                    }
                    Err(GrachtError::NoData) => DrainOutcome::Empty,
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram recv failed");
                        DrainOutcome::Error
                    }
                }
            }
            ExecutionMode::MultiThreaded { arena, .. } => {
                let mut block: ArenaBlock = match arena.acquire() {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping inbound datagram: arena exhausted");
                        return DrainOutcome::Error;
                    }
                };
                let shared = self.shared.lock();
                match shared.link.recv_packet(block.as_mut_slice(), RecvFlags::NONE) {
                    Ok((n, peer)) => {
                        let origin = datagram_origin(&shared.clients, peer);
                        match Message::decode_header(&block.as_slice()[..n], self.max_message_size) {
                            Ok(_) => match origin {
                                ResponseTarget::Client(handle) => DrainOutcome::Enqueue(DispatchedMessage { handle, buffer: block, len: n }),
                                // An unregistered peer has no client handle to carry
                                // through the worker queue's `DispatchedMessage`, so
                                // it is processed inline even under the worker-pool
                                // execution mode; in practice this is only ever the
                                // control protocol's subscribe action.
                                origin @ ResponseTarget::DatagramPeer(_) => DrainOutcome::Inline(origin, block.as_slice()[..n].to_vec()),
                            },
                            Err(GrachtError::TooLarge { id }) => DrainOutcome::TooLarge(origin, id),
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping undecodable datagram");
                                DrainOutcome::Error
                            }
                        }
                    }
                    Err(GrachtError::NoData) => DrainOutcome::Empty,
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram recv failed");
                        DrainOutcome::Error
                    }
                }
            }
        }
    }

    fn drain_datagram(&mut self) {
        loop {
            match self.try_recv_datagram() {
                DrainOutcome::Inline(origin, data) => self.invoke_inline(origin, &data),
                DrainOutcome::Enqueue(msg) => {
                    if let ExecutionMode::MultiThreaded { pool, .. } = &self.mode {
                        pool.dispatch(msg);
                    }
                }
                DrainOutcome::TooLarge(origin, id) => {
                    self.handle().send_control_error(&origin, id, &GrachtError::TooLarge { id });
                }
                DrainOutcome::Empty | DrainOutcome::Error | DrainOutcome::Disconnect => return,
            }
        }
    }

    fn shutdown(&mut self) {
        let mut shared = self.shared.lock();
        let SharedState { link, clients, .. } = &mut *shared;
        for (_, record) in clients.drain() {
            link.destroy_client(record.link_state);
        }
        link.destroy();
        drop(shared);

        if let ExecutionMode::MultiThreaded { pool, .. } = std::mem::replace(
            &mut self.mode,
            ExecutionMode::SingleThreaded { buffers: StaticPair::new(0) },
        ) {
            pool.destroy();
        }
    }
}

/// Resolves an incoming datagram's sender to a registry entry if one
/// already exists (the peer previously subscribed), or leaves it as a bare
/// peer address otherwise.
fn datagram_origin(clients: &ClientRegistry, peer: SocketAddr) -> ResponseTarget {
    let handle = datagram_peer_handle(&peer);
    if clients.contains(handle) {
        ResponseTarget::Client(handle)
    } else {
        ResponseTarget::DatagramPeer(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::UnixSocketLink;
    use std::os::unix::net::{UnixDatagram, UnixStream};
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    fn echo_action() -> ActionDescriptor {
        ActionDescriptor {
            action_id: 1,
            handler: Arc::new(|ctx: &ActionContext| {
                let _ = ctx.respond(ctx.params.clone());
            }),
        }
    }

    #[test]
    fn single_threaded_request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
        let config = GrachtServerConfig::new(Box::new(link)).workers(0).max_message_size(4096);
        let mut server = GrachtServer::initialize(config).unwrap();
        server.register_protocol(5, vec![echo_action()]).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        // One accept + drain cycle is enough without running the full loop.
        server.accept_clients();
        use std::io::Write;
        let msg = Message::new(99, 5, 1, vec![ParamValue::Scalar32(11)], vec![]);
        (&client).write_all(&msg.encode()).unwrap();

        let handles: Vec<RawFd> = server.shared.lock().clients.handles().collect();
        assert_eq!(handles.len(), 1);
        server.drain_client(handles[0]);

        use std::io::Read;
        let mut buf = [0u8; 128];
        let n = (&client).read(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..n], 4096).unwrap();
        assert_eq!(decoded.header.id, 99);
        assert_eq!(decoded.params[0], ParamValue::Scalar32(11));
    }

    #[test]
    fn unknown_action_gets_control_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
        let config = GrachtServerConfig::new(Box::new(link)).workers(0).max_message_size(4096);
        let mut server = GrachtServer::initialize(config).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        server.accept_clients();
        use std::io::Write;
        let msg = Message::new(1, 200, 200, vec![], vec![]);
        (&client).write_all(&msg.encode()).unwrap();

        let handles: Vec<RawFd> = server.shared.lock().clients.handles().collect();
        server.drain_client(handles[0]);

        use std::io::Read;
        let mut buf = [0u8; 128];
        let n = (&client).read(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..n], 4096).unwrap();
        assert_eq!(decoded.header.protocol, CONTROL_PROTOCOL);
        assert_eq!(decoded.header.action, CONTROL_ACTION_ERROR);
    }

    #[test]
    fn subscribe_then_broadcast_reaches_subscribed_clients_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
        let config = GrachtServerConfig::new(Box::new(link)).workers(0).max_message_size(4096);
        let mut server = GrachtServer::initialize(config).unwrap();

        let client_a = UnixStream::connect(&path).unwrap();
        server.accept_clients();
        let client_b = UnixStream::connect(&path).unwrap();
        server.accept_clients();

        use std::io::Write;
        let subscribe = Message::new(1, CONTROL_PROTOCOL, CONTROL_ACTION_SUBSCRIBE, vec![ParamValue::Scalar8(7)], vec![]);
        (&client_a).write_all(&subscribe.encode()).unwrap();

        let handles: Vec<RawFd> = server.shared.lock().clients.handles().collect();
        for h in &handles {
            server.drain_client(*h);
        }

        server.broadcast_event(7, 3, vec![ParamValue::Scalar32(42)]);

        use std::io::Read;
        let mut buf = [0u8; 128];
        client_a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let n = (&client_a).read(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..n], 4096).unwrap();
        assert_eq!(decoded.header.protocol, 7);
        assert_eq!(decoded.header.action, 3);

        client_b.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let result = (&client_b).read(&mut buf);
        assert!(result.is_err() || result.unwrap() == 0, "unsubscribed client must not receive the broadcast");
    }

    #[test]
    fn disconnect_removes_client_and_fires_callback_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
        let disconnects = Arc::new(AtomicU32::new(0));
        let disconnects_clone = Arc::clone(&disconnects);
        let config = GrachtServerConfig::new(Box::new(link))
            .workers(0)
            .max_message_size(4096)
            .on_client_disconnected(move |_h| {
                disconnects_clone.fetch_add(1, AtomicOrdering::SeqCst);
            });
        let mut server = GrachtServer::initialize(config).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        server.accept_clients();
        let handle = server.shared.lock().clients.handles().next().unwrap();
        drop(client);

        server.drain_client(handle);
        assert_eq!(server.connected_clients(), 0);
        assert_eq!(disconnects.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn worker_pool_dispatches_concurrent_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let config = GrachtServerConfig::new(Box::new(link)).workers(4).max_message_size(4096);
        let mut server = GrachtServer::initialize(config).unwrap();
        server
            .register_protocol(
                9,
                vec![ActionDescriptor {
                    action_id: 1,
                    handler: Arc::new(move |ctx: &ActionContext| {
                        seen_clone.lock().unwrap().push(ctx.id);
                        let _ = ctx.respond(vec![]);
                    }),
                }],
            )
            .unwrap();

        let mut clients = Vec::new();
        for i in 0..8u32 {
            let client = UnixStream::connect(&path).unwrap();
            server.accept_clients();
            use std::io::Write;
            let msg = Message::new(i, 9, 1, vec![], vec![]);
            (&client).write_all(&msg.encode()).unwrap();
            clients.push(client);
        }
        let handles: Vec<RawFd> = server.shared.lock().clients.handles().collect();
        for h in handles {
            server.drain_client(h);
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(seen.lock().unwrap().len(), 8);
    }

    #[test]
    fn oversized_stream_message_gets_control_error_and_connection_stays_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracht.sock");
        let link = UnixSocketLink::new(Some(path.clone()), None, 64);
        let config = GrachtServerConfig::new(Box::new(link)).workers(0).max_message_size(64);
        let mut server = GrachtServer::initialize(config).unwrap();
        server.register_protocol(5, vec![echo_action()]).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        server.accept_clients();

        use std::io::Write;
        let oversized = Message::new(7, 5, 1, vec![ParamValue::Buffer(vec![0u8; 200])], vec![]);
        (&client).write_all(&oversized.encode()).unwrap();

        let handles: Vec<RawFd> = server.shared.lock().clients.handles().collect();
        server.drain_client(handles[0]);

        use std::io::Read;
        let mut buf = [0u8; 128];
        let n = (&client).read(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..n], 4096).unwrap();
        assert_eq!(decoded.header.protocol, CONTROL_PROTOCOL);
        assert_eq!(decoded.header.action, CONTROL_ACTION_ERROR);
        assert_eq!(decoded.header.id, 7);

        // The rejected payload must have been drained off the stream, not
        // left to desync the framing of whatever comes next.
        let msg = Message::new(8, 5, 1, vec![ParamValue::Scalar32(3)], vec![]);
        (&client).write_all(&msg.encode()).unwrap();
        server.drain_client(handles[0]);
        let n2 = (&client).read(&mut buf).unwrap();
        let decoded2 = Message::decode(&buf[..n2], 4096).unwrap();
        assert_eq!(decoded2.header.id, 8);
        assert_eq!(decoded2.params[0], ParamValue::Scalar32(3));
    }

    #[test]
    fn oversized_datagram_gets_control_error_and_peer_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("gracht.dgram.sock");
        let peer_path = dir.path().join("peer.sock");
        let link = UnixSocketLink::new(None, Some(server_path.clone()), 64);
        let config = GrachtServerConfig::new(Box::new(link)).workers(0).max_message_size(64);
        let mut server = GrachtServer::initialize(config).unwrap();
        server.register_protocol(5, vec![echo_action()]).unwrap();

        let peer = UnixDatagram::bind(&peer_path).unwrap();
        peer.connect(&server_path).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let oversized = Message::new(7, 5, 1, vec![ParamValue::Buffer(vec![0u8; 200])], vec![]);
        peer.send(&oversized.encode()).unwrap();
        server.drain_datagram();

        let mut buf = [0u8; 128];
        let n = peer.recv(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..n], 4096).unwrap();
        assert_eq!(decoded.header.protocol, CONTROL_PROTOCOL);
        assert_eq!(decoded.header.action, CONTROL_ACTION_ERROR);
        assert_eq!(decoded.header.id, 7);

        // Being rejected must not promote the peer into the client registry
        // or otherwise wedge it; a normal datagram right after still works.
        let msg = Message::new(8, 5, 1, vec![ParamValue::Scalar32(3)], vec![]);
        peer.send(&msg.encode()).unwrap();
        server.drain_datagram();
        let n2 = peer.recv(&mut buf).unwrap();
        let decoded2 = Message::decode(&buf[..n2], 4096).unwrap();
        assert_eq!(decoded2.header.id, 8);
        assert_eq!(decoded2.params[0], ParamValue::Scalar32(3));
    }
}
