//! Worker pool: a fixed set of threads draining a shared FIFO queue and
//! invoking protocol actions in parallel.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use crate::arena::ArenaBlock;
use crate::registry::ConnectionHandle;

/// One message handed off from the event-loop thread to a worker: the
/// originating client's handle plus the arena block holding the raw bytes.
pub struct DispatchedMessage {
    pub handle: ConnectionHandle,
    pub buffer: ArenaBlock,
    pub len: usize,
}

thread_local! {
    /// Per-worker outgoing scratchpad, never shared across threads.
    static SCRATCHPAD: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with this worker's outgoing scratchpad, sized to at least `len`
/// bytes, growing it in place rather than reallocating per call.
pub fn with_scratchpad<R>(len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    SCRATCHPAD.with(|cell| {
        let mut buf = cell.borrow_mut();
        if buf.len() < len {
            buf.resize(len, 0);
        }
        f(&mut buf[..len])
    })
}

/// A fixed set of worker threads pulling from one shared FIFO queue; there
/// is no per-client affinity.
pub struct WorkerPool {
    sender: Sender<DispatchedMessage>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads, each running `process` for every message
    /// popped off the shared queue until the pool is destroyed.
    pub fn new<F>(workers: usize, process: F) -> Self
    where
        F: Fn(DispatchedMessage) + Send + Sync + 'static,
    {
        assert!(workers >= 2, "multi-threaded mode requires at least 2 workers");
        let (sender, receiver): (Sender<DispatchedMessage>, Receiver<DispatchedMessage>) = channel::unbounded();
        let process = Arc::new(process);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let receiver = receiver.clone();
            let process = Arc::clone(&process);
            let handle = std::thread::Builder::new()
                .name(format!("gracht-worker-{id}"))
                .spawn(move || {
                    while let Ok(msg) = receiver.recv() {
                        process(msg);
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { sender, handles }
    }

    /// Non-blocking push onto the shared queue.
    pub fn dispatch(&self, message: DispatchedMessage) {
        // crossbeam's unbounded channel send never blocks; a bounded queue
        // full condition would be surfaced here if a capacity limit were
        // configured.
        let _ = self.sender.send(message);
    }

    /// Signals drain and joins every worker thread.
    pub fn destroy(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
