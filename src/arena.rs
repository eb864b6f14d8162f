//! Message buffer provider: either a single static send/receive pair
//! (single-threaded mode) or a mutex-protected pool of fixed-size blocks
//! (multi-threaded mode).

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{GrachtError, Result};

/// Extra bytes reserved per allocation for per-message context (peer
/// address, link handle, parse cursor), on top of `max_message_size`.
pub const CONTEXT_RESERVE: usize = 512;

/// One send/receive buffer pair, reused in place with no locking. Selected
/// when `server_workers <= 1`, since the event loop, dispatch, and action
/// invocation all run on a single thread and can never contend for it.
pub struct StaticPair {
    pub recv: Vec<u8>,
    pub send: Vec<u8>,
}

impl StaticPair {
    pub fn new(alloc_size: usize) -> Self {
        StaticPair { recv: vec![0u8; alloc_size], send: vec![0u8; alloc_size] }
    }
}

struct ArenaInner {
    alloc_size: usize,
    capacity: usize,
    issued: usize,
    free: Vec<Vec<u8>>,
}

/// Bump-allocated pool of fixed-size blocks, sized
/// `workers * alloc_size * 32` bytes. Implemented as a mutex-guarded
/// free-list rather than a literal bump pointer: blocks may be freed out
/// of order, and the pool only needs to reclaim memory eventually, which a
/// free-list satisfies without the added complexity of compaction.
pub struct Arena {
    inner: Mutex<ArenaInner>,
}

impl Arena {
    /// `workers` is the configured worker count; the pool holds
    /// `workers * 32` blocks of `alloc_size` bytes each.
    pub fn new(workers: usize, alloc_size: usize) -> Arc<Self> {
        let capacity = workers.max(1) * 32;
        Arc::new(Arena { inner: Mutex::new(ArenaInner { alloc_size, capacity, issued: 0, free: Vec::new() }) })
    }

    /// Allocates one block, returning `OutOfMemory` if the pool is
    /// exhausted and no freed block is available. Callers treat this as a
    /// dropped message, logged and discarded, not a connection-level
    /// failure.
    pub fn acquire(self: &Arc<Self>) -> Result<ArenaBlock> {
        let mut inner = self.inner.lock();
        let buf = if let Some(mut b) = inner.free.pop() {
            b.clear();
            b.resize(inner.alloc_size, 0);
            b
        } else if inner.issued < inner.capacity {
            inner.issued += 1;
            vec![0u8; inner.alloc_size]
        } else {
            return Err(GrachtError::OutOfMemory);
        };
        Ok(ArenaBlock { data: Some(buf), arena: Arc::clone(self) })
    }

    fn release(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.free.push(buf);
    }
}

/// A move-only handle to one arena block. Ownership transfers across the
/// worker-pool channel by value, so the type system rules out one block
/// being read and reused at the same time. Returned to the arena
/// automatically when dropped.
pub struct ArenaBlock {
    data: Option<Vec<u8>>,
    arena: Arc<Arena>,
}

impl ArenaBlock {
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap()
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.arena.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_pair_sizes_recv_and_send() {
        let pair = StaticPair::new(1024);
        assert_eq!(pair.recv.len(), 1024);
        assert_eq!(pair.send.len(), 1024);
    }

    #[test]
    fn arena_reclaims_block_on_drop() {
        let arena = Arena::new(1, 64); // capacity = 32 blocks
        let block = arena.acquire().unwrap();
        drop(block);
        // The freed block should be reusable rather than counted as a new
        // allocation against the fixed capacity.
        for _ in 0..32 {
            let b = arena.acquire().unwrap();
            drop(b);
        }
    }

    #[test]
    fn arena_exhaustion_returns_out_of_memory() {
        let arena = Arena::new(1, 16); // capacity = 32 blocks
        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(arena.acquire().unwrap());
        }
        assert!(matches!(arena.acquire(), Err(GrachtError::OutOfMemory)));
    }

    #[test]
    fn blocks_can_be_freed_out_of_order() {
        let arena = Arena::new(1, 16);
        let a = arena.acquire().unwrap();
        let b = arena.acquire().unwrap();
        let c = arena.acquire().unwrap();
        drop(b);
        drop(a);
        drop(c);
    }
}
