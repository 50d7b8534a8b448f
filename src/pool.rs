// ============================================================================
// MEMORY MANAGEMENT: BUFFER POOL
// ============================================================================
// A fixed number of fixed-capacity byte buffers shared by every pooled stream.
// Buffers are allocated lazily up to the configured maximum and then recycled
// forever. The pool is the only place in the engine that allocates stream
// memory; streams borrow buffers through `acquire` and hand them back through
// `release`.
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::error::{PoolError, PoolResult};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Byte Buffer
// ----------------------------------------------------------------------------

/// A fixed-capacity block of bytes with a position and a limit.
///
/// Writing advances `position` up to `limit`. `flip` turns a filled buffer
/// into a readable one, `clear` makes the whole capacity writable again.
#[derive(Debug)]
pub struct ByteBuffer {
    pool_id: u64,
    id: usize,
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl ByteBuffer {
    fn new(pool_id: u64, id: usize, capacity: usize) -> Self {
        Self {
            pool_id,
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Position to zero, limit to capacity
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Limit to the current position, position to zero
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Copy as much of `src` as fits, returning the bytes taken
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }

    /// Copy up to `dst.len()` readable bytes, returning the bytes copied
    pub fn get_slice(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.remaining());
        dst[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        if self.has_remaining() {
            let byte = self.data[self.position];
            self.position += 1;
            Some(byte)
        } else {
            None
        }
    }

    /// Bytes between position and limit
    pub fn readable(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Writable space between position and limit
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Move the position after writing into `writable_mut`
    pub fn advance(&mut self, n: usize) {
        self.position = (self.position + n).min(self.limit);
    }
}

// ----------------------------------------------------------------------------
// Buffer Pool
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BufferPoolStats {
    hits: AtomicU64,
    allocations: AtomicU64,
    exhausted: AtomicU64,
    releases: AtomicU64,
    rejected_releases: AtomicU64,
}

/// A bounded pool of reusable byte buffers
pub struct BufferPool {
    id: u64,
    buffer_size: usize,
    max_buffers: usize,
    acquire_attempts: u32,
    retry_interval: Duration,
    free: ArrayQueue<ByteBuffer>,
    /// Per buffer id: currently checked out of the pool
    checked_out: Box<[AtomicBool]>,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a new pool. Nothing is allocated until buffers are requested.
    pub fn new(buffer_size: usize, max_buffers: usize, acquire_attempts: u32, retry_interval: Duration) -> Self {
        let max_buffers = max_buffers.max(1);
        Self {
            id: NEXT_POOL_ID.fetch_add(1, AtomicOrdering::Relaxed),
            buffer_size: buffer_size.max(1),
            max_buffers,
            acquire_attempts: acquire_attempts.max(1),
            retry_interval,
            free: ArrayQueue::new(max_buffers),
            checked_out: (0..max_buffers).map(|_| AtomicBool::new(false)).collect(),
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            stats: BufferPoolStats::default(),
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(
            config.buffer_size,
            config.max_buffers,
            config.acquire_attempts,
            config.acquire_retry_interval(),
        )
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Buffers that can still be handed out
    pub fn available(&self) -> usize {
        self.max_buffers - self.in_use.load(AtomicOrdering::Acquire)
    }

    /// Take a buffer, retrying a bounded number of times while the pool is
    /// exhausted.
    ///
    /// The returned buffer is not cleared; callers reset it before use.
    pub fn acquire(&self) -> PoolResult<ByteBuffer> {
        for attempt in 1..=self.acquire_attempts {
            if let Some(buffer) = self.try_acquire() {
                return Ok(buffer);
            }
            if attempt < self.acquire_attempts {
                thread::sleep(self.retry_interval);
            }
        }

        self.stats.exhausted.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(
            target: "perfstore::pool",
            max_buffers = self.max_buffers,
            attempts = self.acquire_attempts,
            "Buffer pool exhausted"
        );
        Err(PoolError::exhausted("buffer", self.acquire_attempts))
    }

    /// Take a buffer without waiting
    pub fn try_acquire(&self) -> Option<ByteBuffer> {
        if let Some(buffer) = self.free.pop() {
            self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            self.check_out(&buffer);
            return Some(buffer);
        }

        let max = self.max_buffers;
        let slot = self
            .allocated
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;

        self.stats.allocations.fetch_add(1, AtomicOrdering::Relaxed);
        let buffer = ByteBuffer::new(self.id, slot, self.buffer_size);
        self.check_out(&buffer);
        Some(buffer)
    }

    fn check_out(&self, buffer: &ByteBuffer) {
        self.checked_out[buffer.id].store(true, AtomicOrdering::Release);
        self.in_use.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Return a buffer to the pool.
    ///
    /// A buffer that does not belong to this pool, or is not checked out, is
    /// dropped without touching the pool state.
    pub fn release(&self, buffer: ByteBuffer) {
        let owned = buffer.pool_id == self.id
            && buffer.id < self.max_buffers
            && self.checked_out[buffer.id].swap(false, AtomicOrdering::AcqRel);

        if !owned {
            self.stats.rejected_releases.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(
                target: "perfstore::pool",
                buffer_id = buffer.id,
                "Ignoring release of a buffer not checked out from this pool"
            );
            return;
        }

        self.stats.releases.fetch_add(1, AtomicOrdering::Relaxed);
        self.in_use.fetch_sub(1, AtomicOrdering::AcqRel);
        // Capacity equals max_buffers, so a checked-out buffer always fits.
        let _ = self.free.push(buffer);
    }

    /// Get pool statistics
    pub fn snapshot(&self) -> BufferPoolSnapshot {
        BufferPoolSnapshot {
            buffer_size: self.buffer_size,
            max_buffers: self.max_buffers,
            allocated: self.allocated.load(AtomicOrdering::Relaxed),
            in_use: self.in_use.load(AtomicOrdering::Relaxed),
            hits: self.stats.hits.load(AtomicOrdering::Relaxed),
            allocations: self.stats.allocations.load(AtomicOrdering::Relaxed),
            exhausted: self.stats.exhausted.load(AtomicOrdering::Relaxed),
            releases: self.stats.releases.load(AtomicOrdering::Relaxed),
            rejected_releases: self.stats.rejected_releases.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time statistics of a buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolSnapshot {
    pub buffer_size: usize,
    pub max_buffers: usize,
    pub allocated: usize,
    pub in_use: usize,
    pub hits: u64,
    pub allocations: u64,
    pub exhausted: u64,
    pub releases: u64,
    pub rejected_releases: u64,
}

impl BufferPoolSnapshot {
    /// Share of acquisitions served by a recycled buffer
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.hits + self.allocations;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
