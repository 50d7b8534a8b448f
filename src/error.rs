// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `PerfStoreError`.
// Every error knows whether it is recoverable and how a caller should react.
// ============================================================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::record::RecordType;

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the storage engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PerfStoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl PerfStoreError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PerfStoreError::Config(_) => false,
            PerfStoreError::Pool(_) => true,
            PerfStoreError::Stream(e) => e.is_recoverable(),
            PerfStoreError::Indexing(_) => false,
            PerfStoreError::Channel(_) => false,
            PerfStoreError::Write(e) => e.is_recoverable(),
            PerfStoreError::Persistence(_) => true,
            PerfStoreError::Ingest(e) => e.is_recoverable(),
            PerfStoreError::Io(_) => true,
            PerfStoreError::Internal(_) => false,
            PerfStoreError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PerfStoreError::Config(_) => "config",
            PerfStoreError::Pool(_) => "pool",
            PerfStoreError::Stream(_) => "stream",
            PerfStoreError::Indexing(_) => "indexing",
            PerfStoreError::Channel(_) => "channel",
            PerfStoreError::Write(_) => "write",
            PerfStoreError::Persistence(_) => "persistence",
            PerfStoreError::Ingest(_) => "ingest",
            PerfStoreError::Io(_) => "io",
            PerfStoreError::Internal(_) => "internal",
            PerfStoreError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PerfStoreError::Config(_) => RecoveryHint::FixConfiguration,
            PerfStoreError::Pool(_) => RecoveryHint::RetryWithBackoff,
            PerfStoreError::Stream(e) => e.recovery_hint(),
            PerfStoreError::Write(e) => e.recovery_hint(),
            PerfStoreError::Ingest(e) => e.recovery_hint(),
            PerfStoreError::Indexing(_) | PerfStoreError::Channel(_) => RecoveryHint::AlertOperator,
            PerfStoreError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the peer
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

// ----------------------------------------------------------------------------
// Buffer Pool Errors
// ----------------------------------------------------------------------------

/// Errors raised while acquiring pooled resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("{resource} pool exhausted after {attempts} attempts")]
    Exhausted { resource: &'static str, attempts: u32 },
}

impl PoolError {
    pub fn exhausted(resource: &'static str, attempts: u32) -> Self {
        PoolError::Exhausted { resource, attempts }
    }
}

// ----------------------------------------------------------------------------
// Stream Errors
// ----------------------------------------------------------------------------

/// Errors of the pooled input and output streams
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Stream was not prepared")]
    NotPrepared,

    #[error("Stream is already prepared")]
    AlreadyPrepared,

    #[error("Stream is closed")]
    Closed,

    #[error("Buffer acquisition failed: {0}")]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn read_failed(message: impl Into<String>) -> Self {
        StreamError::ReadFailed { message: message.into() }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Pool(_))
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StreamError::Pool(_) => RecoveryHint::RetryWithBackoff,
            StreamError::ReadFailed { .. } | StreamError::Io(_) => RecoveryHint::Reconnect,
            _ => RecoveryHint::None,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::ReadFailed { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            StreamError::Pool(_) => io::Error::new(io::ErrorKind::OutOfMemory, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

// ----------------------------------------------------------------------------
// Indexing Errors
// ----------------------------------------------------------------------------

/// Errors raised by an indexing tree handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexingError {
    #[error("Indexing handler is not prepared")]
    NotPrepared,

    #[error("Indexing handler is already finalized")]
    Finalized,

    #[error("No channel available for {record_type} records: {message}")]
    AllocationFailed { record_type: RecordType, message: String },
}

// ----------------------------------------------------------------------------
// Channel Errors
// ----------------------------------------------------------------------------

/// Errors raised by a channel manager
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel IO failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Channel manager is closed")]
    Closed,

    #[error("Write submission rejected: {message}")]
    Rejected { message: String },
}

impl ChannelError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ChannelError::Io { path: path.into(), source }
    }
}

// ----------------------------------------------------------------------------
// Write Errors
// ----------------------------------------------------------------------------

/// Terminal outcomes of a write task or a side-channel write
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Storage cannot accept more writes")]
    StorageFull,

    #[error("Storage writer is not active")]
    WriterInactive,

    #[error("Index allocation failed: {0}")]
    IndexAllocationFailed(#[from] IndexingError),

    #[error("Indexing handler returned no slot for the record")]
    NoSlot,

    #[error("No serializer available after {waited_ms}ms")]
    SerializerUnavailable { waited_ms: u64 },

    #[error("Wait for a serializer was interrupted")]
    SerializerInterrupted,

    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Channel write failed: {0}")]
    ChannelWriteFailed(#[from] ChannelError),

    #[error("Write task panicked: {message}")]
    TaskPanicked { message: String },

    #[error("Pending writes did not complete within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WriteError {
    pub fn serialization(message: impl Into<String>) -> Self {
        WriteError::SerializationFailed { message: message.into() }
    }

    /// Whether the failure happened before an index slot was requested
    pub fn precedes_indexing(&self) -> bool {
        matches!(self, WriteError::StorageFull | WriteError::WriterInactive)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WriteError::StorageFull
                | WriteError::SerializerUnavailable { .. }
                | WriteError::SerializerInterrupted
                | WriteError::Timeout { .. }
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            WriteError::StorageFull => RecoveryHint::AlertOperator,
            WriteError::SerializerUnavailable { .. } | WriteError::SerializerInterrupted | WriteError::Timeout { .. } => {
                RecoveryHint::RetryWithBackoff
            }
            WriteError::SerializationFailed { .. } => RecoveryHint::Skip,
            WriteError::WriterInactive => RecoveryHint::None,
            _ => RecoveryHint::AlertOperator,
        }
    }
}

// ----------------------------------------------------------------------------
// Persistence Errors
// ----------------------------------------------------------------------------

/// Errors of the live-path persistence store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Transaction failed: {message}")]
    TransactionFailed { message: String },

    #[error("Persistence store is closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Ingestion Errors
// ----------------------------------------------------------------------------

/// Errors of the ingestion boundary
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Frame of {size} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("Failed to decode record: {message}")]
    Decode { message: String },

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IngestError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IngestError::Decode { .. } | IngestError::Io(_))
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            IngestError::Decode { .. } => RecoveryHint::Skip,
            _ => RecoveryHint::Reconnect,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type PerfStoreResult<T> = Result<T, PerfStoreError>;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Result type for write operations
pub type WriteResult<T> = Result<T, WriteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_is_recoverable() {
        let err: PerfStoreError = PoolError::exhausted("buffer", 30).into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "pool");
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryWithBackoff);
        assert_eq!(err.to_string(), "Buffer pool error: buffer pool exhausted after 30 attempts");
    }

    #[test]
    fn test_terminal_write_errors() {
        let err: PerfStoreError = WriteError::serialization("bad payload").into();
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);

        let err: PerfStoreError = WriteError::NoSlot.into();
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), "write");
    }

    #[test]
    fn test_precedes_indexing() {
        assert!(WriteError::StorageFull.precedes_indexing());
        assert!(WriteError::WriterInactive.precedes_indexing());
        assert!(!WriteError::NoSlot.precedes_indexing());
        assert!(!WriteError::SerializerInterrupted.precedes_indexing());
    }

    #[test]
    fn test_stream_error_into_io() {
        let io_err: io::Error = StreamError::read_failed("producer died").into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);

        let io_err: io::Error = StreamError::Pool(PoolError::exhausted("buffer", 1)).into();
        assert_eq!(io_err.kind(), io::ErrorKind::OutOfMemory);
    }
}
