// ----------------------------------------------------------------------------
// Indexing Tree Handler
// ----------------------------------------------------------------------------
// Allocates the channel a record is written to and remembers where each
// record ended up. A slot is reserved by `start_write` and is either
// committed by `write_successful` or rolled back by `write_failed`.
// ----------------------------------------------------------------------------

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::writer::WriteTask;
use crate::error::IndexingError;
use crate::record::{RecordIdent, RecordType};
use crate::stream::{ChannelId, StorageDescriptor};

pub trait IndexingTreeHandler: Send + Sync {
    /// Called once before the first write of a storage
    fn prepare(&self) -> Result<(), IndexingError>;

    /// Reserve a slot for the task's record. `Ok(None)` means the record has
    /// no place in this index.
    fn start_write(&self, task: &WriteTask) -> Result<Option<ChannelId>, IndexingError>;

    /// The reserved slot was written at `position` with `size` bytes
    fn write_successful(&self, task: &WriteTask, position: u64, size: u64);

    /// Roll back the reservation of a failed task
    fn write_failed(&self, task: &WriteTask);

    /// Stop accepting writes and return the final index
    fn finish(&self) -> Result<StorageIndex, IndexingError>;
}

/// Location and identity of one written record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record_id: i64,
    pub ident: RecordIdent,
    pub record_type: RecordType,
    pub timestamp_ms: i64,
    pub descriptor: StorageDescriptor,
}

/// Selection over the entries of an index. Unset fields match everything;
/// the time range is inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexQuery {
    pub platform_ident: Option<i64>,
    pub record_type: Option<RecordType>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

impl IndexQuery {
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        self.platform_ident.map_or(true, |p| p == entry.ident.platform_ident)
            && self.record_type.map_or(true, |t| t == entry.record_type)
            && self.from_ms.map_or(true, |from| entry.timestamp_ms >= from)
            && self.to_ms.map_or(true, |to| entry.timestamp_ms <= to)
    }
}

/// Final index of a storage, persisted when the storage is closed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIndex {
    /// Ordered by channel, then position
    pub entries: Vec<IndexEntry>,
}

impl StorageIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> Vec<StorageDescriptor> {
        self.entries.iter().map(|e| e.descriptor).collect()
    }

    pub fn select(&self, query: &IndexQuery) -> Vec<&IndexEntry> {
        self.entries.iter().filter(|e| query.matches(e)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    record_id: i64,
    ident: RecordIdent,
    record_type: RecordType,
    timestamp_ms: i64,
    channel_id: ChannelId,
}

#[derive(Debug, Default)]
struct IndexState {
    prepared: bool,
    finalized: bool,
    channels: HashMap<(i64, RecordType), ChannelId>,
    pending: HashMap<u64, PendingWrite>,
    entries: Vec<IndexEntry>,
    rolled_back: u64,
}

/// Indexing handler giving every (platform, record type) pair its own
/// channel file
#[derive(Debug, Default)]
pub struct StorageIndexingTreeHandler {
    state: Mutex<IndexState>,
}

impl StorageIndexingTreeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserved slots not yet committed or rolled back
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Committed entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rolled_back(&self) -> u64 {
        self.state.lock().rolled_back
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}

impl IndexingTreeHandler for StorageIndexingTreeHandler {
    fn prepare(&self) -> Result<(), IndexingError> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(IndexingError::Finalized);
        }
        state.prepared = true;
        Ok(())
    }

    fn start_write(&self, task: &WriteTask) -> Result<Option<ChannelId>, IndexingError> {
        let record = task.record();
        let mut state = self.state.lock();
        if !state.prepared {
            return Err(IndexingError::NotPrepared);
        }
        if state.finalized {
            return Err(IndexingError::Finalized);
        }

        let key = (record.ident.platform_ident, record.record_type());
        let next = state.channels.len() as ChannelId + 1;
        let channel_id = *state.channels.entry(key).or_insert(next);

        state.pending.insert(
            task.id(),
            PendingWrite {
                record_id: record.id,
                ident: record.ident,
                record_type: record.record_type(),
                timestamp_ms: record.timestamp_ms,
                channel_id,
            },
        );
        Ok(Some(channel_id))
    }

    fn write_successful(&self, task: &WriteTask, position: u64, size: u64) {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.remove(&task.id()) else {
            debug!(target: "perfstore::indexing", task_id = task.id(), "Commit for unknown slot");
            return;
        };
        state.entries.push(IndexEntry {
            record_id: pending.record_id,
            ident: pending.ident,
            record_type: pending.record_type,
            timestamp_ms: pending.timestamp_ms,
            descriptor: StorageDescriptor::new(pending.channel_id, position, size),
        });
    }

    fn write_failed(&self, task: &WriteTask) {
        let mut state = self.state.lock();
        if state.pending.remove(&task.id()).is_some() {
            state.rolled_back += 1;
            debug!(target: "perfstore::indexing", task_id = task.id(), "Rolled back slot of failed write");
        }
    }

    fn finish(&self) -> Result<StorageIndex, IndexingError> {
        let mut state = self.state.lock();
        if !state.prepared {
            return Err(IndexingError::NotPrepared);
        }
        state.finalized = true;

        let abandoned = state.pending.len();
        if abandoned > 0 {
            debug!(target: "perfstore::indexing", abandoned, "Dropping uncommitted slots");
            state.pending.clear();
        }

        let mut entries = state.entries.clone();
        entries.sort_by_key(|e| (e.descriptor.channel_id, e.descriptor.position));
        Ok(StorageIndex { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordIdent};
    use crate::storage::writer::{WriteHandle, WritePreferences};

    fn task(id: u64, record: Record) -> WriteTask {
        WriteTask::new(id, record, WritePreferences::default(), WriteHandle::new(id))
    }

    #[test]
    fn test_requires_prepare() {
        let handler = StorageIndexingTreeHandler::new();
        let t = task(1, Record::timer(1, RecordIdent::new(1, 1, 1), 0, 1.0));
        assert_eq!(handler.start_write(&t), Err(IndexingError::NotPrepared));
    }

    #[test]
    fn test_channels_per_platform_and_type() {
        let handler = StorageIndexingTreeHandler::new();
        handler.prepare().unwrap();

        let a = task(1, Record::timer(1, RecordIdent::new(1, 1, 1), 0, 1.0));
        let b = task(2, Record::timer(2, RecordIdent::new(1, 1, 2), 0, 1.0));
        let c = task(3, Record::sql(3, RecordIdent::new(1, 1, 1), 0, 1.0, "select 1", true));
        let d = task(4, Record::timer(4, RecordIdent::new(2, 1, 1), 0, 1.0));

        assert_eq!(handler.start_write(&a), Ok(Some(1)));
        assert_eq!(handler.start_write(&b), Ok(Some(1)));
        assert_eq!(handler.start_write(&c), Ok(Some(2)));
        assert_eq!(handler.start_write(&d), Ok(Some(3)));
        assert_eq!(handler.channel_count(), 3);
        assert_eq!(handler.pending_count(), 4);
    }

    #[test]
    fn test_commit_and_rollback() {
        let handler = StorageIndexingTreeHandler::new();
        handler.prepare().unwrap();
        let ok = task(1, Record::timer(10, RecordIdent::new(1, 1, 1), 500, 1.0));
        let failed = task(2, Record::timer(11, RecordIdent::new(1, 1, 1), 600, 1.0));

        handler.start_write(&ok).unwrap();
        handler.start_write(&failed).unwrap();
        handler.write_successful(&ok, 0, 42);
        handler.write_failed(&failed);
        handler.write_failed(&failed);

        assert_eq!(handler.pending_count(), 0);
        assert_eq!(handler.rolled_back(), 1);

        let index = handler.finish().unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries[0].record_id, 10);
        assert_eq!(index.entries[0].descriptor, StorageDescriptor::new(1, 0, 42));
        assert_eq!(handler.start_write(&ok), Err(IndexingError::Finalized));
    }

    #[test]
    fn test_query_selects_entries() {
        let entry = |record_type, platform, ts| IndexEntry {
            record_id: ts,
            ident: RecordIdent::new(platform, 1, 1),
            record_type,
            timestamp_ms: ts,
            descriptor: StorageDescriptor::new(1, 0, 1),
        };
        let index = StorageIndex {
            entries: vec![
                entry(RecordType::Timer, 1, 100),
                entry(RecordType::SqlStatement, 1, 200),
                entry(RecordType::Timer, 2, 300),
            ],
        };

        let query = IndexQuery {
            record_type: Some(RecordType::Timer),
            to_ms: Some(300),
            ..Default::default()
        };
        assert_eq!(index.select(&query).len(), 2);

        let query = IndexQuery {
            platform_ident: Some(1),
            from_ms: Some(150),
            ..Default::default()
        };
        let selected = index.select(&query);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].record_type, RecordType::SqlStatement);
    }
}
