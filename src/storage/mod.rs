// ============================================================================
// STORAGE
// ============================================================================
// Indexed storage of records in channel files.
//
// - `StorageWriter` turns records into write tasks
// - `IndexingTreeHandler` reserves and commits index slots
// - `ChannelManager` appends serialized bytes to channel files
// - `StorageManager` resolves paths and signals backpressure
// - `StorageReader` streams stored records back out
// ============================================================================

pub mod channel;
pub mod indexing;
pub mod manager;
pub mod reader;
pub mod serializer;
pub mod status;
pub mod writer;

pub use channel::{ChannelManager, ChannelSnapshot, WriteCompletion, WritingChannelManager};
pub use indexing::{IndexEntry, IndexQuery, IndexingTreeHandler, StorageIndex, StorageIndexingTreeHandler};
pub use manager::{channel_file_name, DiskStorageManager, StorageData, StorageManager};
pub use reader::StorageReader;
pub use serializer::{RecordSerializer, SerializerLease, SerializerPool, SerializerPoolSnapshot};
pub use status::{WritingStatus, WritingStatusTracker};
pub use writer::{
    RecordWriter, StorageWriter, WriteHandle, WriteOutcome, WritePreferences, WriteTask, WriterComponents,
    WriterSnapshot, WriterState,
};
