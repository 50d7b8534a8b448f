// ----------------------------------------------------------------------------
// Storage Manager
// ----------------------------------------------------------------------------
// Owns the storage root directory, resolves where a storage and its channel
// files live, and raises the global "cannot write more" signal once the byte
// budget is used up.
// ----------------------------------------------------------------------------

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::stream::ChannelId;
use crate::CHANNEL_FILE_EXTENSION;

/// Descriptor of one storage, persisted next to its channel files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageData {
    pub id: Uuid,
    pub name: CompactString,
    pub created_at: DateTime<Utc>,
}

impl StorageData {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// File name of a channel inside its storage folder
pub fn channel_file_name(channel: ChannelId) -> String {
    format!("{channel}.{CHANNEL_FILE_EXTENSION}")
}

pub trait StorageManager: Send + Sync {
    /// Global backpressure signal. Writes are refused while this is false.
    fn can_write_more(&self) -> bool;

    /// Folder holding every file of `storage`
    fn storage_path(&self, storage: &StorageData) -> PathBuf;

    fn channel_path(&self, storage: &StorageData, channel: ChannelId) -> PathBuf {
        self.storage_path(storage).join(channel_file_name(channel))
    }

    /// Account bytes that reached a channel file
    fn record_written(&self, bytes: u64);
}

/// Storage manager backed by a local directory
#[derive(Debug)]
pub struct DiskStorageManager {
    root: PathBuf,
    /// 0 = unlimited
    max_bytes: u64,
    written: AtomicU64,
}

impl DiskStorageManager {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            written: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.storage_dir, config.max_storage_bytes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl StorageManager for DiskStorageManager {
    fn can_write_more(&self) -> bool {
        self.max_bytes == 0 || self.bytes_written() < self.max_bytes
    }

    fn storage_path(&self, storage: &StorageData) -> PathBuf {
        self.root.join(storage.id.to_string())
    }

    fn record_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_storage_folder() {
        let manager = DiskStorageManager::new("/data", 0);
        let storage = StorageData::new("nightly");

        let folder = manager.storage_path(&storage);
        assert_eq!(folder, PathBuf::from("/data").join(storage.id.to_string()));
        assert_eq!(manager.channel_path(&storage, 7), folder.join("7.chan"));
    }

    #[test]
    fn test_budget_drives_backpressure() {
        let manager = DiskStorageManager::new("/data", 100);
        assert!(manager.can_write_more());
        manager.record_written(60);
        assert!(manager.can_write_more());
        manager.record_written(40);
        assert!(!manager.can_write_more());
    }

    #[test]
    fn test_zero_budget_is_unlimited() {
        let manager = DiskStorageManager::new("/data", 0);
        manager.record_written(u64::MAX / 2);
        assert!(manager.can_write_more());
    }
}
