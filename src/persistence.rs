// ============================================================================
// PERSISTENCE STORE
// ============================================================================
// Long-term sink of the live aggregation path. The relational store of a full
// deployment sits behind the same trait; the engine ships an in-memory store.
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::PersistenceError;
use crate::record::{Record, RecordType};

/// Transactional record sink
pub trait PersistenceStore: Send + Sync {
    /// Insert all records in one transaction: either every record is stored
    /// or none is.
    fn insert_all(&self, records: Vec<Record>) -> Result<(), PersistenceError>;

    fn insert(&self, record: Record) -> Result<(), PersistenceError> {
        self.insert_all(vec![record])
    }
}

/// Point-in-time statistics of the in-memory store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceSnapshot {
    pub stored: usize,
    pub transactions: u64,
    pub failed_transactions: u64,
}

/// Keeps every inserted record in memory
#[derive(Debug, Default)]
pub struct InMemoryPersistenceStore {
    records: Mutex<Vec<Record>>,
    transactions: AtomicU64,
    failed_transactions: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored record, in insertion order
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn records_of_type(&self, record_type: RecordType) -> Vec<Record> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.record_type() == record_type)
            .cloned()
            .collect()
    }

    /// Reject all further transactions
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PersistenceSnapshot {
        PersistenceSnapshot {
            stored: self.len(),
            transactions: self.transactions.load(Ordering::Relaxed),
            failed_transactions: self.failed_transactions.load(Ordering::Relaxed),
        }
    }
}

impl PersistenceStore for InMemoryPersistenceStore {
    fn insert_all(&self, records: Vec<Record>) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::SeqCst) {
            self.failed_transactions.fetch_add(1, Ordering::Relaxed);
            return Err(PersistenceError::Closed);
        }
        if records.is_empty() {
            return Ok(());
        }

        let count = records.len();
        self.records.lock().extend(records);
        self.transactions.fetch_add(1, Ordering::Relaxed);
        debug!(target: "perfstore::persistence", count, "Committed transaction");
        Ok(())
    }
}
