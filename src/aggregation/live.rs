// ----------------------------------------------------------------------------
// Live Aggregation
// ----------------------------------------------------------------------------
// Aggregates charting records per time bucket and hands finalized aggregates
// to a persistence store. Overflow evictions are persisted synchronously by
// the inserting thread; a background sweeper flushes everything periodically.
// ----------------------------------------------------------------------------

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, error, info};

use super::aggregator::aggregator_for;
use super::cache::{AggregationCache, CacheSnapshot};
use crate::config::LiveAggregationConfig;
use crate::error::{PerfStoreError, PerfStoreResult};
use crate::persistence::PersistenceStore;
use crate::record::{Record, RecordType};

const LIVE_TYPES: [RecordType; 3] = [RecordType::Timer, RecordType::HttpTimer, RecordType::SqlStatement];

#[derive(Debug, Default)]
struct LiveStats {
    persisted: AtomicU64,
    dropped: AtomicU64,
    sweeps: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSnapshot {
    pub persisted: u64,
    pub dropped: u64,
    pub sweeps: u64,
    pub caches: Vec<(RecordType, CacheSnapshot)>,
}

pub struct LiveAggregator {
    caches: Vec<AggregationCache>,
    store: Arc<dyn PersistenceStore>,
    stats: LiveStats,
}

impl LiveAggregator {
    pub fn new(store: Arc<dyn PersistenceStore>, period_ms: i64, max_elements: usize) -> Self {
        let caches = LIVE_TYPES
            .iter()
            .filter_map(|t| aggregator_for(*t))
            .map(|aggregator| AggregationCache::new(aggregator, period_ms, max_elements))
            .collect();
        Self {
            caches,
            store,
            stats: LiveStats::default(),
        }
    }

    pub fn from_config(config: &LiveAggregationConfig, store: Arc<dyn PersistenceStore>) -> Self {
        Self::new(store, config.aggregation_period_millis, config.max_elements)
    }

    /// Aggregate one record. Returns false when no cache accepts its type.
    pub fn process(&self, record: &Record) -> bool {
        let Some(cache) = self.caches.iter().find(|c| c.accepts(record)) else {
            return false;
        };
        let evicted = cache.process(record);
        if !evicted.is_empty() {
            self.persist(evicted);
        }
        true
    }

    /// Flush every cache into the store. Returns the number of aggregates
    /// handed over.
    pub fn sweep(&self) -> usize {
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        let flushed: Vec<Record> = self.caches.iter().flat_map(|c| c.flush()).collect();
        let count = flushed.len();
        if count > 0 {
            self.persist(flushed);
        }
        count
    }

    fn persist(&self, records: Vec<Record>) {
        let count = records.len() as u64;
        match self.store.insert_all(records) {
            Ok(()) => {
                self.stats.persisted.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                error!(target: "perfstore::aggregation", error = %e, count, "Persisting live aggregates failed");
            }
        }
    }

    pub fn live_entries(&self) -> usize {
        self.caches.iter().map(AggregationCache::len).sum()
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            sweeps: self.stats.sweeps.load(Ordering::Relaxed),
            caches: self.caches.iter().map(|c| (c.record_type(), c.snapshot())).collect(),
        }
    }

    /// Sweep every `interval` on a dedicated thread until the handle is
    /// stopped or dropped. A final sweep runs on stop.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> PerfStoreResult<SweeperHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(interval.max(Duration::from_millis(1)));
        let live = Arc::clone(self);

        let thread = std::thread::Builder::new()
            .name("perfstore-live-sweeper".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let swept = live.sweep();
                            if swept > 0 {
                                debug!(target: "perfstore::aggregation", swept, "Live sweep");
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                live.sweep();
            })
            .map_err(PerfStoreError::Io)?;

        info!(target: "perfstore::aggregation", interval_ms = interval.as_millis() as u64, "Live sweeper started");
        Ok(SweeperHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Running sweeper thread
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        // dropping the sender wakes the select
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "perfstore::aggregation", "Live sweeper panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceStore;
    use crate::record::RecordIdent;

    fn ident(method: i64) -> RecordIdent {
        RecordIdent::new(1, 1, method)
    }

    #[test]
    fn test_eviction_persists_synchronously() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let live = LiveAggregator::new(store.clone(), 1_000, 1);

        assert!(live.process(&Record::timer(1, ident(1), 0, 1.0)));
        assert!(live.process(&Record::timer(2, ident(1), 10, 1.0)));
        assert!(store.is_empty());

        live.process(&Record::timer(3, ident(2), 0, 1.0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].timer_stats().unwrap().count, 2);
    }

    #[test]
    fn test_sweep_flushes_every_type() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let live = LiveAggregator::new(store.clone(), 1_000, 100);

        live.process(&Record::timer(1, ident(1), 0, 1.0));
        live.process(&Record::sql(2, ident(1), 0, 1.0, "select 1", true));
        live.process(&Record::http(3, ident(1), 0, 1.0, "/", "GET"));
        assert!(!live.process(&Record::invocation(4, ident(1), 0, 1.0, None, vec![])));
        assert_eq!(live.live_entries(), 3);

        assert_eq!(live.sweep(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(live.live_entries(), 0);
        assert_eq!(live.snapshot().persisted, 3);
    }

    #[test]
    fn test_failed_transaction_counts_dropped() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        store.close();
        let live = LiveAggregator::new(store, 1_000, 100);
        live.process(&Record::timer(1, ident(1), 0, 1.0));
        live.sweep();
        assert_eq!(live.snapshot().dropped, 1);
    }

    #[test]
    fn test_sweeper_flushes_on_stop() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let live = Arc::new(LiveAggregator::new(store.clone(), 1_000, 100));
        let mut sweeper = live.start_sweeper(Duration::from_secs(3_600)).unwrap();

        live.process(&Record::timer(1, ident(1), 0, 1.0));
        sweeper.stop();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sweeper_runs_periodically() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let live = Arc::new(LiveAggregator::new(store.clone(), 1_000, 100));
        let _sweeper = live.start_sweeper(Duration::from_millis(10)).unwrap();

        live.process(&Record::timer(1, ident(1), 0, 1.0));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.len(), 1);
    }
}
