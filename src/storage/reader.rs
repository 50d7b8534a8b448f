// ----------------------------------------------------------------------------
// Storage Reader
// ----------------------------------------------------------------------------
// Read path of a closed storage. Metadata files and record ranges are pulled
// through disk-backed pooled input streams, so reads share the buffer pool
// with ingestion and writing.
// ----------------------------------------------------------------------------

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;

use super::indexing::{IndexQuery, StorageIndex};
use super::manager::{channel_file_name, StorageData};
use super::serializer::RecordSerializer;
use crate::error::{PerfStoreResult, StreamError};
use crate::record::Record;
use crate::stream::{ChannelId, PooledInputStream, StorageDescriptor, StreamContext};
use crate::{STORAGE_INDEX_FILE, STORAGE_INFO_FILE};

pub struct StorageReader {
    ctx: StreamContext,
    folder: PathBuf,
    storage: StorageData,
    serializer: RecordSerializer,
}

impl StorageReader {
    /// Open the storage stored in `folder`
    pub fn open(ctx: StreamContext, folder: impl Into<PathBuf>, max_record_size: u64) -> PerfStoreResult<Self> {
        let folder = folder.into();
        let serializer = RecordSerializer::new(max_record_size);
        let storage = read_object(&ctx, &serializer, &folder.join(STORAGE_INFO_FILE))?;
        Ok(Self {
            ctx,
            folder,
            storage,
            serializer,
        })
    }

    pub fn storage(&self) -> &StorageData {
        &self.storage
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn channel_path(&self, channel: ChannelId) -> PathBuf {
        self.folder.join(channel_file_name(channel))
    }

    /// Index persisted when the storage was closed
    pub fn read_index(&self) -> PerfStoreResult<StorageIndex> {
        read_object(&self.ctx, &self.serializer, &self.folder.join(STORAGE_INDEX_FILE))
    }

    /// Decode one record per non-empty descriptor, in descriptor order
    pub fn read_records(&self, descriptors: &[StorageDescriptor]) -> PerfStoreResult<Vec<Record>> {
        let mut stream = PooledInputStream::from_descriptors(&self.ctx, descriptors, |id| self.channel_path(id))?;
        let expected = descriptors.iter().filter(|d| d.size > 0).count();

        let mut records = Vec::with_capacity(expected);
        for _ in 0..expected {
            records.push(decode(&self.serializer, &mut stream)?);
        }
        stream.close();

        debug!(
            target: "perfstore::reader",
            storage_id = %self.storage.id,
            records = records.len(),
            "Read records"
        );
        Ok(records)
    }

    /// Every record of the storage
    pub fn read_all(&self) -> PerfStoreResult<Vec<Record>> {
        let index = self.read_index()?;
        self.read_records(&index.descriptors())
    }

    pub fn read_matching(&self, query: &IndexQuery) -> PerfStoreResult<Vec<Record>> {
        let index = self.read_index()?;
        let descriptors: Vec<StorageDescriptor> = index.select(query).iter().map(|e| e.descriptor).collect();
        self.read_records(&descriptors)
    }
}

fn read_object<T: DeserializeOwned>(ctx: &StreamContext, serializer: &RecordSerializer, path: &Path) -> PerfStoreResult<T> {
    let mut stream = PooledInputStream::from_file(ctx, path)?;
    let object = decode(serializer, &mut stream)?;
    stream.close();
    Ok(object)
}

fn decode<T: DeserializeOwned>(serializer: &RecordSerializer, stream: &mut PooledInputStream) -> PerfStoreResult<T> {
    serializer
        .deserialize(&mut *stream)
        .map_err(|e| StreamError::read_failed(format!("failed to decode stored object: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordIdent;
    use crate::storage::indexing::IndexEntry;
    use crate::stream::test_support::{context, fast_settings};
    use std::fs;

    fn write_storage(folder: &Path, records: &[Record]) -> (StorageData, StorageIndex) {
        let mut serializer = RecordSerializer::new(1 << 20);
        let storage = StorageData::new("reader-test");
        fs::write(folder.join(STORAGE_INFO_FILE), serializer.to_vec(&storage).unwrap()).unwrap();

        let mut channel = Vec::new();
        let mut index = StorageIndex::default();
        for record in records {
            let bytes = serializer.to_vec(record).unwrap();
            index.entries.push(IndexEntry {
                record_id: record.id,
                ident: record.ident,
                record_type: record.record_type(),
                timestamp_ms: record.timestamp_ms,
                descriptor: StorageDescriptor::new(1, channel.len() as u64, bytes.len() as u64),
            });
            channel.extend_from_slice(&bytes);
        }
        fs::write(folder.join("1.chan"), channel).unwrap();
        fs::write(folder.join(STORAGE_INDEX_FILE), serializer.to_vec(&index).unwrap()).unwrap();
        (storage, index)
    }

    #[test]
    fn test_reads_back_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let ident = RecordIdent::new(1, 2, 3);
        let records: Vec<Record> = (0..25)
            .map(|i| Record::sql(i, ident, i * 100, i as f64, &format!("select {i}"), i % 2 == 0))
            .collect();
        let (storage, index) = write_storage(dir.path(), &records);

        let ctx = context(16, 16, fast_settings(3));
        let reader = StorageReader::open(ctx.clone(), dir.path(), 1 << 20).unwrap();
        assert_eq!(reader.storage(), &storage);
        assert_eq!(reader.read_index().unwrap(), index);
        assert_eq!(reader.read_all().unwrap(), records);

        drop(reader);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while ctx.pool.available() != 16 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(ctx.pool.available(), 16);
    }

    #[test]
    fn test_reads_selected_range() {
        let dir = tempfile::tempdir().unwrap();
        let ident = RecordIdent::new(1, 2, 3);
        let records: Vec<Record> = (0..10).map(|i| Record::timer(i, ident, i * 1_000, 1.0)).collect();
        write_storage(dir.path(), &records);

        let reader = StorageReader::open(context(32, 8, fast_settings(2)), dir.path(), 1 << 20).unwrap();
        let query = IndexQuery {
            from_ms: Some(3_000),
            to_ms: Some(5_000),
            ..Default::default()
        };
        let ids: Vec<i64> = reader.read_matching(&query).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_missing_storage_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StorageReader::open(context(16, 8, fast_settings(2)), dir.path(), 1 << 20).is_err());
    }
}
