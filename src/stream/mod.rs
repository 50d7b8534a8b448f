// ============================================================================
// POOLED STREAMS
// ============================================================================
// Byte streams backed by buffers borrowed from the shared `BufferPool`.
//
// - `PooledInputStream` shuttles buffers between an empty and a full queue
//   while a background producer fills them from disk or a socket.
// - `PooledOutputStream` collects serialized bytes for a channel write.
//
// Closing a stream (explicitly or by dropping it) returns every buffer it
// holds to the pool exactly once.
// ============================================================================

pub mod disk;
pub mod input;
pub mod output;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use rayon::ThreadPool;

use crate::config::StreamConfig;
use crate::pool::BufferPool;
use crate::{DEFAULT_BUFFER_POLL_INTERVAL_MS, DEFAULT_MAX_BUFFER_TRIES, MAX_STREAM_BUFFERS, MIN_STREAM_BUFFERS};

pub use disk::{ChannelId, DiskSource, StorageDescriptor};
pub use input::{ByteSource, PooledInputStream, StreamState};
pub use output::PooledOutputStream;
pub use socket::{SocketInputStream, SocketSource};

/// Tuning shared by all input streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Buffers per stream, always within [2, 5]
    pub buffer_count: usize,
    /// Polls of the reader for a filled buffer before the read fails.
    /// Producers are not bounded by it: they wait for the reader to hand
    /// a buffer back until the stream is closed or restarted.
    pub max_buffer_tries: u32,
    /// Wait per poll
    pub poll_interval: Duration,
}

impl StreamSettings {
    pub fn new(buffer_count: usize, max_buffer_tries: u32, poll_interval: Duration) -> Self {
        Self {
            buffer_count: buffer_count.clamp(MIN_STREAM_BUFFERS, MAX_STREAM_BUFFERS),
            max_buffer_tries: max_buffer_tries.max(1),
            poll_interval,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.effective_buffer_count(),
            config.max_buffer_tries,
            config.buffer_poll_interval(),
        )
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::new(
            MIN_STREAM_BUFFERS,
            DEFAULT_MAX_BUFFER_TRIES,
            Duration::from_millis(DEFAULT_BUFFER_POLL_INTERVAL_MS),
        )
    }
}

/// Everything needed to open a pooled stream: the pool the buffers come
/// from and the executor that runs background producers.
#[derive(Clone)]
pub struct StreamContext {
    pub pool: Arc<BufferPool>,
    pub io_pool: Arc<ThreadPool>,
    pub settings: StreamSettings,
}

impl StreamContext {
    pub fn new(pool: Arc<BufferPool>, io_pool: Arc<ThreadPool>, settings: StreamSettings) -> Self {
        Self { pool, io_pool, settings }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn context(buffer_size: usize, max_buffers: usize, settings: StreamSettings) -> StreamContext {
        let pool = Arc::new(BufferPool::new(buffer_size, max_buffers, 5, Duration::from_millis(1)));
        let io_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .thread_name(|i| format!("test-io-{i}"))
                .build()
                .unwrap(),
        );
        StreamContext::new(pool, io_pool, settings)
    }

    pub fn fast_settings(buffer_count: usize) -> StreamSettings {
        StreamSettings::new(buffer_count, 20, Duration::from_millis(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_clamp_buffer_count() {
        assert_eq!(StreamSettings::new(0, 30, Duration::ZERO).buffer_count, 2);
        assert_eq!(StreamSettings::new(9, 30, Duration::ZERO).buffer_count, 5);
        assert_eq!(StreamSettings::new(3, 0, Duration::ZERO).max_buffer_tries, 1);
    }
}
