// ----------------------------------------------------------------------------
// Pooled Input Stream
// ----------------------------------------------------------------------------
// Created → Prepared → Streaming → Closed
//
// `prepare` borrows between two and five buffers from the pool and starts a
// producer on the IO executor. The producer takes buffers from the empty
// queue, fills them from its `ByteSource` and pushes them to the full queue.
// The reader drains full buffers and hands them back as empty ones, so the
// producer can never run ahead by more than the stream's buffer count.
// Every wait on either side is bounded by `max_buffer_tries` polls.
// ----------------------------------------------------------------------------

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use tracing::{debug, trace, warn};

use super::{StreamContext, StreamSettings};
use crate::error::{StreamError, StreamResult};
use crate::pool::{BufferPool, ByteBuffer};

/// Where a pooled input stream gets its bytes from
pub trait ByteSource: Send + Sync + 'static {
    /// Fill `buffer` with at most `max` bytes, starting at byte `offset` of
    /// the stream. The buffer arrives cleared. Returning `Ok(0)` means the
    /// source ended before the announced size was reached.
    fn fill(&self, buffer: &mut ByteBuffer, offset: u64, max: usize) -> io::Result<usize>;

    /// Called once when the owning stream closes
    fn close(&self) {}
}

/// Lifecycle of a pooled input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Prepared,
    Streaming,
    Closed,
}

// ----------------------------------------------------------------------------
// Queues shared between reader and producer
// ----------------------------------------------------------------------------

struct QueueState {
    empty: VecDeque<ByteBuffer>,
    full: VecDeque<ByteBuffer>,
    closed: bool,
    /// Bumped on every restart; producers of older generations stop
    generation: u64,
    producers: usize,
}

struct StreamShared {
    pool: Arc<BufferPool>,
    settings: StreamSettings,
    queues: Mutex<QueueState>,
    empty_ready: Condvar,
    full_ready: Condvar,
    producer_idle: Condvar,
    read_failed: AtomicBool,
}

impl StreamShared {
    fn new(pool: Arc<BufferPool>, settings: StreamSettings) -> Self {
        Self {
            pool,
            settings,
            queues: Mutex::new(QueueState {
                empty: VecDeque::with_capacity(settings.buffer_count),
                full: VecDeque::with_capacity(settings.buffer_count),
                closed: false,
                generation: 0,
                producers: 0,
            }),
            empty_ready: Condvar::new(),
            full_ready: Condvar::new(),
            producer_idle: Condvar::new(),
            read_failed: AtomicBool::new(false),
        }
    }

    fn is_read_failed(&self) -> bool {
        self.read_failed.load(AtomicOrdering::Acquire)
    }

    fn mark_failed(&self, reason: &str) {
        if !self.read_failed.swap(true, AtomicOrdering::AcqRel) {
            warn!(target: "perfstore::stream", reason, "Pooled input stream marked as failed");
        }
        self.full_ready.notify_all();
        self.empty_ready.notify_all();
    }

    /// Producer side: next empty buffer, `None` when the producer must stop.
    ///
    /// Waits as long as the reader holds every buffer. A slow reader is
    /// backpressure, not a failure; the wait ends on close, restart or a
    /// failed stream, all of which signal `empty_ready`.
    fn take_empty(&self, generation: u64) -> Option<ByteBuffer> {
        let mut queues = self.queues.lock();
        loop {
            if queues.closed || queues.generation != generation || self.is_read_failed() {
                return None;
            }
            if let Some(mut buffer) = queues.empty.pop_front() {
                buffer.clear();
                return Some(buffer);
            }
            self.empty_ready.wait_for(&mut queues, self.settings.poll_interval);
        }
    }

    /// Producer side: hand over a filled buffer
    fn push_full(&self, generation: u64, buffer: ByteBuffer) {
        let mut queues = self.queues.lock();
        if queues.closed {
            drop(queues);
            self.pool.release(buffer);
        } else if queues.generation != generation {
            queues.empty.push_back(buffer);
            self.empty_ready.notify_one();
        } else {
            queues.full.push_back(buffer);
            self.full_ready.notify_one();
        }
    }

    /// Either side: give back a buffer that holds nothing of interest
    fn return_empty(&self, buffer: ByteBuffer) {
        let mut queues = self.queues.lock();
        if queues.closed {
            drop(queues);
            self.pool.release(buffer);
        } else {
            queues.empty.push_back(buffer);
            self.empty_ready.notify_one();
        }
    }

    /// Reader side: next full buffer within the bounded number of polls
    fn take_full(&self) -> StreamResult<ByteBuffer> {
        let max_tries = self.settings.max_buffer_tries;
        let mut queues = self.queues.lock();
        for attempt in 0..=max_tries {
            if let Some(buffer) = queues.full.pop_front() {
                return Ok(buffer);
            }
            if queues.closed {
                return Err(StreamError::Closed);
            }
            if self.is_read_failed() {
                return Err(StreamError::read_failed("producer could not fill a buffer"));
            }
            if attempt < max_tries {
                self.full_ready.wait_for(&mut queues, self.settings.poll_interval);
            }
        }
        drop(queues);

        self.mark_failed("no filled buffer within the retry bound");
        Err(StreamError::read_failed(format!(
            "no filled buffer after {} tries",
            max_tries
        )))
    }

    /// Failures of a stale producer do not poison the current request
    fn fail_generation(&self, generation: u64, reason: &str) {
        let current = {
            let queues = self.queues.lock();
            !queues.closed && queues.generation == generation
        };
        if current {
            self.mark_failed(reason);
        }
    }

    fn producer_started(&self) {
        self.queues.lock().producers += 1;
    }

    fn producer_finished(&self) {
        let mut queues = self.queues.lock();
        queues.producers = queues.producers.saturating_sub(1);
        if queues.producers == 0 {
            self.producer_idle.notify_all();
        }
    }

    /// Mark closed and give every queued buffer back to the pool.
    /// Returns the number of buffers released.
    fn close(&self, current: Option<ByteBuffer>) -> usize {
        let mut drained: Vec<ByteBuffer> = current.into_iter().collect();
        {
            let mut queues = self.queues.lock();
            queues.closed = true;
            drained.extend(queues.empty.drain(..));
            drained.extend(queues.full.drain(..));
        }
        self.empty_ready.notify_all();
        self.full_ready.notify_all();

        let released = drained.len();
        for buffer in drained {
            self.pool.release(buffer);
        }
        released
    }
}

fn run_producer(shared: Arc<StreamShared>, source: Arc<dyn ByteSource>, generation: u64, total_size: u64) {
    let mut produced = 0u64;
    while produced < total_size {
        let Some(mut buffer) = shared.take_empty(generation) else {
            break;
        };
        let want = (total_size - produced).min(buffer.capacity() as u64) as usize;
        match source.fill(&mut buffer, produced, want) {
            Ok(0) => {
                shared.return_empty(buffer);
                shared.fail_generation(generation, "source ended before the announced size");
                break;
            }
            Ok(n) => {
                produced += n as u64;
                buffer.flip();
                shared.push_full(generation, buffer);
            }
            Err(e) => {
                shared.return_empty(buffer);
                shared.fail_generation(generation, &e.to_string());
                break;
            }
        }
    }
    trace!(target: "perfstore::stream", generation, produced, total_size, "Producer finished");
    shared.producer_finished();
}

// ----------------------------------------------------------------------------
// The stream
// ----------------------------------------------------------------------------

/// A byte stream fed by a background producer through pooled buffers
pub struct PooledInputStream {
    shared: Arc<StreamShared>,
    source: Arc<dyn ByteSource>,
    io_pool: Arc<ThreadPool>,
    current: Option<ByteBuffer>,
    state: StreamState,
    total_size: u64,
    position: u64,
}

impl PooledInputStream {
    pub fn new(ctx: &StreamContext, source: Arc<dyn ByteSource>) -> Self {
        Self {
            shared: Arc::new(StreamShared::new(Arc::clone(&ctx.pool), ctx.settings)),
            source,
            io_pool: Arc::clone(&ctx.io_pool),
            current: None,
            state: StreamState::Created,
            total_size: 0,
            position: 0,
        }
    }

    /// Borrow the stream's buffers and start producing `total_size` bytes.
    /// With a size of zero no producer is started.
    pub fn prepare(&mut self, total_size: u64) -> StreamResult<()> {
        match self.state {
            StreamState::Created => {}
            StreamState::Closed => return Err(StreamError::Closed),
            _ => return Err(StreamError::AlreadyPrepared),
        }

        self.acquire_buffers()?;
        self.total_size = total_size;
        self.position = 0;
        self.state = StreamState::Prepared;

        if total_size > 0 {
            self.spawn_producer(0);
        }
        debug!(
            target: "perfstore::stream",
            total_size,
            buffers = self.shared.settings.buffer_count,
            "Pooled input stream prepared"
        );
        Ok(())
    }

    fn acquire_buffers(&mut self) -> StreamResult<()> {
        let count = self.shared.settings.buffer_count;
        let mut acquired = Vec::with_capacity(count);
        for _ in 0..count {
            match self.shared.pool.acquire() {
                Ok(buffer) => acquired.push(buffer),
                Err(e) => {
                    for buffer in acquired {
                        self.shared.pool.release(buffer);
                    }
                    return Err(e.into());
                }
            }
        }
        self.shared.queues.lock().empty.extend(acquired);
        Ok(())
    }

    fn spawn_producer(&self, generation: u64) {
        self.shared.producer_started();
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let total_size = self.total_size;
        self.io_pool
            .spawn(move || run_producer(shared, source, generation, total_size));
    }

    /// Start over for a new request of `total_size` bytes, reusing the
    /// buffers already borrowed. Unread bytes of the previous request are
    /// discarded.
    pub(crate) fn restart(&mut self, total_size: u64) -> StreamResult<()> {
        match self.state {
            StreamState::Created => return self.prepare(total_size),
            StreamState::Closed => return Err(StreamError::Closed),
            _ => {}
        }
        if self.shared.is_read_failed() {
            return Err(StreamError::read_failed("stream failed earlier"));
        }

        let current = self.current.take();
        let generation = {
            let shared = &self.shared;
            let mut queues = shared.queues.lock();
            queues.generation += 1;
            while let Some(buffer) = queues.full.pop_front() {
                queues.empty.push_back(buffer);
            }
            if let Some(buffer) = current {
                queues.empty.push_back(buffer);
            }
            shared.empty_ready.notify_all();

            let mut tries = 0;
            while queues.producers > 0 {
                if tries >= shared.settings.max_buffer_tries {
                    return Err(StreamError::read_failed("previous producer did not stop"));
                }
                tries += 1;
                shared.producer_idle.wait_for(&mut queues, shared.settings.poll_interval);
            }
            queues.generation
        };

        self.total_size = total_size;
        self.position = 0;
        self.state = StreamState::Prepared;
        if total_size > 0 {
            self.spawn_producer(generation);
        }
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn bytes_left(&self) -> u64 {
        self.total_size - self.position
    }

    pub fn is_read_failed(&self) -> bool {
        self.shared.is_read_failed()
    }

    fn check_readable(&self) -> StreamResult<()> {
        match self.state {
            StreamState::Created => Err(StreamError::NotPrepared),
            StreamState::Closed => Err(StreamError::Closed),
            _ => Ok(()),
        }
    }

    /// Ensure the current buffer has bytes, swapping in the next full one
    fn ensure_current(&mut self) -> StreamResult<&mut ByteBuffer> {
        let exhausted = self.current.as_ref().map_or(true, |b| !b.has_remaining());
        if exhausted {
            if let Some(old) = self.current.take() {
                self.shared.return_empty(old);
            }
            self.current = Some(self.shared.take_full()?);
        }
        self.current
            .as_mut()
            .ok_or_else(|| StreamError::read_failed("no current buffer"))
    }

    /// Read into `dst`. Returns zero once every announced byte was read.
    pub fn read_into(&mut self, dst: &mut [u8]) -> StreamResult<usize> {
        self.check_readable()?;
        if dst.is_empty() || self.bytes_left() == 0 {
            return Ok(0);
        }
        self.state = StreamState::Streaming;

        let max = (dst.len() as u64).min(self.bytes_left()) as usize;
        let buffer = self.ensure_current()?;
        let n = buffer.get_slice(&mut dst[..max]);
        self.position += n as u64;
        Ok(n)
    }

    /// Next byte, `None` at end of stream
    pub fn read_byte(&mut self) -> StreamResult<Option<u8>> {
        self.check_readable()?;
        if self.bytes_left() == 0 {
            return Ok(None);
        }
        self.state = StreamState::Streaming;

        let byte = self.ensure_current()?.get_u8();
        if byte.is_some() {
            self.position += 1;
        }
        Ok(byte)
    }

    /// Return every buffer to the pool. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        let was_prepared = self.state != StreamState::Created;
        self.state = StreamState::Closed;

        let released = self.shared.close(self.current.take());
        self.source.close();
        if was_prepared {
            trace!(
                target: "perfstore::stream",
                released,
                position = self.position,
                total_size = self.total_size,
                "Pooled input stream closed"
            );
        }
    }
}

impl io::Read for PooledInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(io::Error::from)
    }
}

impl Drop for PooledInputStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::{context, fast_settings};
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct MemorySource {
        data: Vec<u8>,
        fills: AtomicUsize,
        fail_from: Option<u64>,
        delay: Duration,
    }

    impl MemorySource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                fills: AtomicUsize::new(0),
                fail_from: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl ByteSource for MemorySource {
        fn fill(&self, buffer: &mut ByteBuffer, offset: u64, max: usize) -> io::Result<usize> {
            self.fills.fetch_add(1, AtomicOrdering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail_from.map_or(false, |from| offset >= from) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            let start = offset as usize;
            let end = (start + max).min(self.data.len());
            Ok(buffer.put_slice(&self.data[start..end]))
        }
    }

    fn wait_for_pool(pool: &BufferPool, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.available() != expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.available(), expected);
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_zero_size_never_contacts_producer() {
        let ctx = context(64, 8, fast_settings(3));
        let source = Arc::new(MemorySource::new(payload(100)));
        let mut stream = PooledInputStream::new(&ctx, source.clone());

        stream.prepare(0).unwrap();
        assert_eq!(stream.bytes_left(), 0);
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.read_byte().unwrap(), None);
        assert_eq!(source.fills.load(AtomicOrdering::SeqCst), 0);

        stream.close();
        assert_eq!(ctx.pool.available(), 8);
    }

    #[test]
    fn test_streams_more_bytes_than_buffers_hold() {
        let ctx = context(64, 8, fast_settings(2));
        let data = payload(1_000);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(data.clone())));
        stream.prepare(data.len() as u64).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(stream.bytes_left(), 0);
        assert_eq!(stream.state(), StreamState::Streaming);

        drop(stream);
        wait_for_pool(&ctx.pool, 8);
    }

    #[test]
    fn test_read_byte_walks_buffers() {
        let ctx = context(4, 4, fast_settings(2));
        let data = payload(10);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(data.clone())));
        stream.prepare(10).unwrap();

        let mut out = Vec::new();
        while let Some(byte) = stream.read_byte().unwrap() {
            out.push(byte);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_producer_failure_is_sticky() {
        let ctx = context(64, 8, fast_settings(2));
        let mut source = MemorySource::new(payload(1_000));
        source.fail_from = Some(128);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(source));
        stream.prepare(1_000).unwrap();

        let mut first = vec![0u8; 128];
        stream.read_exact(&mut first).unwrap();

        let err = stream.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(stream.is_read_failed());
        assert!(stream.read(&mut [0u8; 8]).is_err());

        stream.close();
        wait_for_pool(&ctx.pool, 8);
    }

    #[test]
    fn test_slow_producer_fails_reader_after_bounded_tries() {
        let ctx = context(64, 8, StreamSettings::new(2, 3, Duration::from_millis(10)));
        let mut source = MemorySource::new(payload(64));
        source.delay = Duration::from_millis(400);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(source));
        stream.prepare(64).unwrap();

        let started = Instant::now();
        let err = stream.read_into(&mut [0u8; 8]).unwrap_err();
        assert!(matches!(err, StreamError::ReadFailed { .. }));
        assert!(started.elapsed() < Duration::from_millis(400));

        stream.close();
        wait_for_pool(&ctx.pool, 8);
    }

    #[test]
    fn test_close_mid_stream_returns_all_buffers() {
        let ctx = context(16, 8, fast_settings(5));
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(payload(4_096))));
        stream.prepare(4_096).unwrap();

        let mut head = [0u8; 10];
        stream.read_exact(&mut head).unwrap();
        stream.close();
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(stream.read_into(&mut head), Err(StreamError::Closed)));

        wait_for_pool(&ctx.pool, 8);
        assert_eq!(ctx.pool.snapshot().rejected_releases, 0);
    }

    #[test]
    fn test_state_errors() {
        let ctx = context(16, 8, fast_settings(2));
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(payload(8))));
        assert!(matches!(stream.read_into(&mut [0u8; 1]), Err(StreamError::NotPrepared)));

        stream.prepare(8).unwrap();
        assert!(matches!(stream.prepare(8), Err(StreamError::AlreadyPrepared)));
    }

    #[test]
    fn test_prepare_fails_cleanly_when_pool_is_short() {
        let ctx = context(16, 1, fast_settings(2));
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(payload(8))));

        assert!(matches!(stream.prepare(8), Err(StreamError::Pool(_))));
        assert_eq!(ctx.pool.available(), 1);
        assert_eq!(stream.state(), StreamState::Created);
    }

    #[test]
    fn test_restart_reuses_buffers() {
        let ctx = context(8, 4, fast_settings(2));
        let data = payload(20);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(data.clone())));

        stream.restart(5).unwrap();
        let mut first = [0u8; 5];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, &data[..5]);

        stream.restart(12).unwrap();
        let mut second = vec![0u8; 12];
        stream.read_exact(&mut second).unwrap();
        // The memory source is offset-addressed, so a restart reads from zero.
        assert_eq!(&second[..], &data[..12]);
        assert_eq!(ctx.pool.snapshot().allocated, 2);
    }

    #[test]
    fn test_slow_reader_does_not_fail_the_stream() {
        let ctx = context(16, 4, StreamSettings::new(2, 3, Duration::from_millis(10)));
        let data = payload(256);
        let mut stream = PooledInputStream::new(&ctx, Arc::new(MemorySource::new(data.clone())));
        stream.prepare(data.len() as u64).unwrap();

        let first = stream.read_byte().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(!stream.is_read_failed());

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(first, Some(data[0]));
        assert_eq!(rest, &data[1..]);

        drop(stream);
        wait_for_pool(&ctx.pool, 4);
    }
}
