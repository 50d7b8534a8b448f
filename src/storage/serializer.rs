// ----------------------------------------------------------------------------
// Serializer Pool
// ----------------------------------------------------------------------------
// A fixed set of serializers shared by all write tasks. A serializer is used
// by one task at a time; the lease hands it back on every exit path.
// ----------------------------------------------------------------------------

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bincode::Options;
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WriteError;

/// bincode encoder with a per-value size limit
#[derive(Debug, Clone)]
pub struct RecordSerializer {
    limit: u64,
    serialized: u64,
}

impl RecordSerializer {
    pub fn new(limit: u64) -> Self {
        Self { limit, serialized: 0 }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.limit)
    }

    /// Values serialized by this instance
    pub fn serialized(&self) -> u64 {
        self.serialized
    }

    pub fn serialize<T, W>(&mut self, value: &T, out: W) -> Result<(), WriteError>
    where
        T: Serialize + ?Sized,
        W: io::Write,
    {
        self.options()
            .serialize_into(out, value)
            .map_err(|e| WriteError::serialization(e.to_string()))?;
        self.serialized += 1;
        Ok(())
    }

    pub fn to_vec<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Vec<u8>, WriteError> {
        let bytes = self
            .options()
            .serialize(value)
            .map_err(|e| WriteError::serialization(e.to_string()))?;
        self.serialized += 1;
        Ok(bytes)
    }

    /// Decode exactly one value from `input`
    pub fn deserialize<T, R>(&self, input: R) -> bincode::Result<T>
    where
        T: DeserializeOwned,
        R: io::Read,
    {
        self.options().deserialize_from(input)
    }
}

#[derive(Debug, Default)]
struct SerializerStats {
    leases: AtomicU64,
    timeouts: AtomicU64,
    interrupts: AtomicU64,
}

/// Point-in-time statistics of a serializer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerPoolSnapshot {
    pub size: usize,
    pub available: usize,
    pub leases: u64,
    pub timeouts: u64,
    pub interrupts: u64,
}

pub struct SerializerPool {
    queue: ArrayQueue<RecordSerializer>,
    size: usize,
    wait: Duration,
    interrupted: AtomicBool,
    stats: SerializerStats,
}

impl SerializerPool {
    pub fn new(size: usize, record_limit: u64, wait: Duration) -> Self {
        let size = size.max(1);
        let queue = ArrayQueue::new(size);
        for _ in 0..size {
            let _ = queue.push(RecordSerializer::new(record_limit));
        }
        Self {
            queue,
            size,
            wait,
            interrupted: AtomicBool::new(false),
            stats: SerializerStats::default(),
        }
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Take a serializer, waiting at most the configured bound
    pub fn acquire(&self) -> Result<SerializerLease<'_>, WriteError> {
        let started = Instant::now();
        let deadline = started + self.wait;
        let backoff = Backoff::new();

        loop {
            if self.interrupted.load(Ordering::Acquire) {
                self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
                return Err(WriteError::SerializerInterrupted);
            }
            if let Some(serializer) = self.queue.pop() {
                self.stats.leases.fetch_add(1, Ordering::Relaxed);
                return Ok(SerializerLease {
                    pool: self,
                    serializer: Some(serializer),
                });
            }
            if Instant::now() >= deadline {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(WriteError::SerializerUnavailable {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Fail current and future waits until `resume`
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> SerializerPoolSnapshot {
        SerializerPoolSnapshot {
            size: self.size,
            available: self.available(),
            leases: self.stats.leases.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
        }
    }
}

/// A serializer checked out of its pool
pub struct SerializerLease<'a> {
    pool: &'a SerializerPool,
    serializer: Option<RecordSerializer>,
}

impl Deref for SerializerLease<'_> {
    type Target = RecordSerializer;

    fn deref(&self) -> &RecordSerializer {
        match &self.serializer {
            Some(serializer) => serializer,
            None => unreachable!("lease used after release"),
        }
    }
}

impl DerefMut for SerializerLease<'_> {
    fn deref_mut(&mut self) -> &mut RecordSerializer {
        match &mut self.serializer {
            Some(serializer) => serializer,
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for SerializerLease<'_> {
    fn drop(&mut self) {
        if let Some(serializer) = self.serializer.take() {
            let _ = self.pool.queue.push(serializer);
        }
    }
}
