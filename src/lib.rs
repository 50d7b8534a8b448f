//! # PerfStore - APM Record Ingestion & Storage Engine
//!
//! The server-side half of an application performance monitoring platform.
//! Agents stream timer, HTTP, SQL, JMX and invocation records; this crate
//! absorbs them, optionally aggregates them per time bucket, and persists them
//! into indexed channel files through a bounded pool of reusable buffers. The
//! same pooled buffers stream the bytes back out from disk or a socket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PERFSTORE ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  AGENT LISTENER → INGESTION → PROCESSOR CHAIN → STORAGE WRITER → CHANNELS   │
//! │                                  │                    │                     │
//! │                       AGGREGATION CACHE         BUFFER POOL ← READ STREAMS  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`pool`]: fixed-size pool of fixed-capacity byte buffers
//! - [`stream`]: pooled input streams (disk, socket) and the pooled output stream
//! - [`processor`]: pluggable record-processing stages
//! - [`aggregation`]: bounded time-bucketed aggregation cache
//! - [`storage`]: storage writer, write tasks, indexing and channel contracts
//! - [`engine`]: wiring of all of the above behind one lifecycle

pub mod aggregation;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod persistence;
pub mod pool;
pub mod processor;
pub mod record;
pub mod storage;
pub mod stream;

pub use config::StoreConfig;
pub use engine::Engine;
pub use error::{PerfStoreError, PerfStoreResult, RecoveryHint};
pub use pool::{BufferPool, ByteBuffer};
pub use record::{Record, RecordIdent, RecordPayload, RecordType, TimerStats};
pub use storage::{StorageWriter, WriteHandle, WriteOutcome, WritePreferences};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const STORE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const STORE_NAME: &str = "perfstore";
pub const STORE_FULL_NAME: &str = "PerfStore APM Storage Engine";

// ----------------------------------------------------------------------------
// Buffer Pool
// ----------------------------------------------------------------------------

/// Capacity of a single pooled buffer in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Number of buffers the global pool may ever allocate
pub const DEFAULT_MAX_BUFFERS: usize = 256;

/// Attempts made by `BufferPool::acquire` before reporting exhaustion
pub const DEFAULT_ACQUIRE_ATTEMPTS: u32 = 30;

/// Pause between two acquire attempts (milliseconds)
pub const DEFAULT_ACQUIRE_RETRY_INTERVAL_MS: u64 = 10;

// ----------------------------------------------------------------------------
// Pooled Streams
// ----------------------------------------------------------------------------

/// Lower bound of buffers a pooled input stream works with
pub const MIN_STREAM_BUFFERS: usize = 2;

/// Upper bound of buffers a pooled input stream works with
pub const MAX_STREAM_BUFFERS: usize = 5;

/// Buffer swaps attempted before a stream is declared failed
pub const DEFAULT_MAX_BUFFER_TRIES: u32 = 30;

/// Wait per buffer swap attempt (milliseconds)
pub const DEFAULT_BUFFER_POLL_INTERVAL_MS: u64 = 100;

// ----------------------------------------------------------------------------
// Storage Writer
// ----------------------------------------------------------------------------

/// Bounded wait for a free serializer (milliseconds)
pub const DEFAULT_SERIALIZER_WAIT_MS: u64 = 1_000;

/// Cadence of the writing status check (seconds)
pub const DEFAULT_STATUS_CHECK_INTERVAL_SECS: u64 = 30;

/// Poll interval of `process_synchronously` (milliseconds)
pub const PROCESS_SYNC_POLL_MS: u64 = 500;

/// Largest encoded record accepted by the serializers
pub const MAX_RECORD_SIZE: u64 = 16 * 1024 * 1024;

/// File extension of channel data files
pub const CHANNEL_FILE_EXTENSION: &str = "chan";

/// File holding the serialized storage index of a finalized storage
pub const STORAGE_INDEX_FILE: &str = "storage.index";

/// File holding the serialized storage descriptor
pub const STORAGE_INFO_FILE: &str = "storage.info";

// ----------------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------------

/// Default bucket width for aggregation (milliseconds)
pub const DEFAULT_AGGREGATION_PERIOD_MS: i64 = 5_000;

/// Default live entries kept before the oldest is evicted
pub const DEFAULT_MAX_ELEMENTS: usize = 1_000;

/// Default cadence of the live-path sweeper (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Ingestion
// ----------------------------------------------------------------------------

/// Default address of the agent listener
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9070";

/// Length prefix of one agent frame in bytes
pub const FRAME_HEADER_SIZE: u64 = 4;
