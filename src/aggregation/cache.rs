// ----------------------------------------------------------------------------
// Aggregation Cache
// ----------------------------------------------------------------------------
// A concurrent map from (aggregation key, time bucket) to one live aggregate,
// plus a FIFO of first insertions that bounds the map to `max_elements`.
//
// Lock order is always map shard → FIFO. Eviction decisions are made while
// holding the FIFO lock, so one overflow is evicted by exactly one thread.
// Victims are removed from the map and finalized after the FIFO lock is
// released. A finalized entry is flagged `evicted`; a concurrent merger that
// still holds it sees the flag and retries against the map.
// ----------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashSet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::aggregator::{bucket_start, AggregationKey, RecordAggregator};
use crate::record::{Record, RecordType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    key: AggregationKey,
    bucket: i64,
}

struct AggregateEntry {
    record: Record,
    /// Ids of the records merged so far
    aggregated_ids: AHashSet<i64>,
    merged: u64,
    evicted: bool,
}

type SharedEntry = Arc<Mutex<AggregateEntry>>;

#[derive(Debug, Default)]
struct CacheStats {
    processed: AtomicU64,
    rejected: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
    flushed: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time statistics of an aggregation cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub live_entries: usize,
    pub processed: u64,
    pub rejected: u64,
    pub created: u64,
    pub evicted: u64,
    pub flushed: u64,
    pub retries: u64,
}

/// Bounded, time-bucketed aggregation table
pub struct AggregationCache {
    aggregator: Arc<dyn RecordAggregator>,
    period_ms: i64,
    max_elements: usize,
    entries: DashMap<BucketKey, SharedEntry, ahash::RandomState>,
    order: Mutex<VecDeque<(BucketKey, SharedEntry)>>,
    next_id: AtomicI64,
    stats: CacheStats,
}

impl AggregationCache {
    pub fn new(aggregator: Arc<dyn RecordAggregator>, period_ms: i64, max_elements: usize) -> Self {
        Self {
            aggregator,
            period_ms: period_ms.max(1),
            max_elements: max_elements.max(1),
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            order: Mutex::new(VecDeque::new()),
            next_id: AtomicI64::new(1),
            stats: CacheStats::default(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.aggregator.record_type()
    }

    pub fn accepts(&self, record: &Record) -> bool {
        self.aggregator.can_aggregate(record)
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Live aggregates
    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_key(&self, record: &Record) -> BucketKey {
        BucketKey {
            key: self.aggregator.aggregation_key(record),
            bucket: bucket_start(record.timestamp_ms, self.period_ms),
        }
    }

    /// Merge `record` into the aggregate of its bucket.
    ///
    /// Returns the aggregates evicted because this call created a new entry
    /// beyond `max_elements`, oldest first. Records the aggregator does not
    /// accept are ignored.
    pub fn process(&self, record: &Record) -> Vec<Record> {
        if !self.accepts(record) {
            self.stats.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return Vec::new();
        }
        self.stats.processed.fetch_add(1, AtomicOrdering::Relaxed);

        let key = self.bucket_key(record);
        let mut victims = Vec::new();

        loop {
            let entry = match self.entries.entry(key.clone()) {
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                Entry::Vacant(vacant) => {
                    let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
                    let aggregate = self.aggregator.clone_for_aggregation(record, id, key.bucket);
                    let entry: SharedEntry = Arc::new(Mutex::new(AggregateEntry {
                        record: aggregate,
                        aggregated_ids: AHashSet::new(),
                        merged: 0,
                        evicted: false,
                    }));

                    let mut order = self.order.lock();
                    let _slot = vacant.insert(Arc::clone(&entry));
                    order.push_back((key.clone(), Arc::clone(&entry)));
                    while order.len() > self.max_elements {
                        match order.pop_front() {
                            Some(victim) => victims.push(victim),
                            None => break,
                        }
                    }
                    self.stats.created.fetch_add(1, AtomicOrdering::Relaxed);
                    entry
                }
            };

            let mut aggregate = entry.lock();
            if aggregate.evicted {
                drop(aggregate);
                self.stats.retries.fetch_add(1, AtomicOrdering::Relaxed);
                std::thread::yield_now();
                continue;
            }
            self.aggregator.aggregate(&mut aggregate.record, record);
            aggregate.aggregated_ids.insert(record.id);
            aggregate.merged += 1;
            break;
        }

        let evicted: Vec<Record> = victims
            .iter()
            .filter_map(|(victim_key, victim)| self.finalize(victim_key, victim))
            .collect();
        if !evicted.is_empty() {
            self.stats.evicted.fetch_add(evicted.len() as u64, AtomicOrdering::Relaxed);
            trace!(
                target: "perfstore::aggregation",
                record_type = %self.record_type(),
                evicted = evicted.len(),
                "Evicted oldest aggregates"
            );
        }
        evicted
    }

    /// Evict and finalize every live aggregate, oldest first.
    pub fn flush(&self) -> Vec<Record> {
        let drained: Vec<(BucketKey, SharedEntry)> = self.order.lock().drain(..).collect();
        let flushed: Vec<Record> = drained
            .iter()
            .filter_map(|(key, entry)| self.finalize(key, entry))
            .collect();
        self.stats.flushed.fetch_add(flushed.len() as u64, AtomicOrdering::Relaxed);
        flushed
    }

    /// Remove a victim from the map and hand out its aggregate.
    /// Aggregates nothing was merged into yet are dropped.
    fn finalize(&self, key: &BucketKey, entry: &SharedEntry) -> Option<Record> {
        self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, entry));

        let mut aggregate = entry.lock();
        aggregate.evicted = true;
        aggregate.aggregated_ids.clear();
        if aggregate.merged == 0 {
            return None;
        }
        Some(aggregate.record.clone())
    }

    /// Ids merged into the live aggregate of `record`'s bucket
    pub fn aggregated_ids(&self, record: &Record) -> Option<Vec<i64>> {
        let entry = self.entries.get(&self.bucket_key(record)).map(|e| Arc::clone(e.value()))?;
        let aggregate = entry.lock();
        let mut ids: Vec<i64> = aggregate.aggregated_ids.iter().copied().collect();
        ids.sort_unstable();
        Some(ids)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            live_entries: self.len(),
            processed: self.stats.processed.load(AtomicOrdering::Relaxed),
            rejected: self.stats.rejected.load(AtomicOrdering::Relaxed),
            created: self.stats.created.load(AtomicOrdering::Relaxed),
            evicted: self.stats.evicted.load(AtomicOrdering::Relaxed),
            flushed: self.stats.flushed.load(AtomicOrdering::Relaxed),
            retries: self.stats.retries.load(AtomicOrdering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::aggregator::{SqlStatementAggregator, TimerAggregator};
    use crate::record::RecordIdent;
    use pretty_assertions::assert_eq;

    fn ident(method: i64) -> RecordIdent {
        RecordIdent::new(1, 2, method)
    }

    fn timer_cache(period: i64, max: usize) -> AggregationCache {
        AggregationCache::new(Arc::new(TimerAggregator), period, max)
    }

    #[test]
    fn test_two_records_same_bucket() {
        let cache = timer_cache(1_000, 10);
        assert!(cache.process(&Record::timer(1, ident(1), 1_100, 10.0)).is_empty());
        assert!(cache.process(&Record::timer(2, ident(1), 1_900, 100.0)).is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.aggregated_ids(&Record::timer(0, ident(1), 1_500, 0.0)), Some(vec![1, 2]));

        let flushed = cache.flush();
        assert_eq!(flushed.len(), 1);
        let aggregate = &flushed[0];
        assert_eq!(aggregate.timestamp_ms, 1_000);
        let stats = aggregate.timer_stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.duration, 110.0);
        assert_eq!(stats.average(), 55.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 100.0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let forward = timer_cache(1_000, 10);
        let backward = timer_cache(1_000, 10);
        let records: Vec<Record> = (0..20)
            .map(|i| Record::timer(i, ident(1), 5_000 + i * 10, (i * 7 % 13) as f64))
            .collect();

        for r in &records {
            forward.process(r);
        }
        for r in records.iter().rev() {
            backward.process(r);
        }

        let a = forward.flush();
        let b = backward.flush();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].timer_stats(), b[0].timer_stats());
    }

    #[test]
    fn test_different_buckets_do_not_merge() {
        let cache = timer_cache(1_000, 10);
        cache.process(&Record::timer(1, ident(1), 999, 1.0));
        cache.process(&Record::timer(2, ident(1), 1_000, 1.0));
        cache.process(&Record::timer(3, ident(2), 999, 1.0));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_eviction_bound_is_fifo() {
        let cache = timer_cache(1_000, 3);
        for method in 1..=3 {
            assert!(cache.process(&Record::timer(method, ident(method), 0, 1.0)).is_empty());
        }
        // merging into an existing entry never evicts
        assert!(cache.process(&Record::timer(9, ident(1), 10, 1.0)).is_empty());

        let evicted = cache.process(&Record::timer(4, ident(4), 0, 1.0));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].ident, ident(1));
        assert_eq!(evicted[0].timer_stats().unwrap().count, 2);
        assert_eq!(cache.len(), 3);

        let evicted = cache.process(&Record::timer(5, ident(5), 0, 1.0));
        assert_eq!(evicted[0].ident, ident(2));

        let rest: Vec<i64> = cache.flush().iter().map(|r| r.ident.method_ident).collect();
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[test]
    fn test_evicted_key_starts_a_new_entry() {
        let cache = timer_cache(1_000, 1);
        cache.process(&Record::timer(1, ident(1), 0, 1.0));
        let evicted = cache.process(&Record::timer(2, ident(2), 0, 1.0));
        assert_eq!(evicted.len(), 1);

        let evicted = cache.process(&Record::timer(3, ident(1), 0, 5.0));
        assert_eq!(evicted[0].ident, ident(2));
        let flushed = cache.flush();
        assert_eq!(flushed[0].timer_stats().unwrap().count, 1);
        assert_eq!(flushed[0].timer_stats().unwrap().duration, 5.0);
    }

    #[test]
    fn test_ids_assigned_from_one_and_tracking_cleared() {
        let cache = timer_cache(1_000, 10);
        cache.process(&Record::timer(100, ident(1), 0, 1.0));
        cache.process(&Record::timer(101, ident(2), 0, 1.0));

        let flushed = cache.flush();
        let ids: Vec<i64> = flushed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cache.aggregated_ids(&Record::timer(0, ident(1), 0, 0.0)), None);
    }

    #[test]
    fn test_rejects_other_record_types() {
        let cache = AggregationCache::new(Arc::new(SqlStatementAggregator), 1_000, 10);
        assert!(cache.process(&Record::timer(1, ident(1), 0, 1.0)).is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.snapshot().rejected, 1);
    }

    #[test]
    fn test_concurrent_first_insert_loses_nothing() {
        let cache = Arc::new(timer_cache(60_000, 10));
        let threads = 8;
        let per_thread = 1_000;

        crossbeam_utils::thread::scope(|scope| {
            for t in 0..threads {
                let cache = Arc::clone(&cache);
                scope.spawn(move |_| {
                    for i in 0..per_thread {
                        cache.process(&Record::timer(t * per_thread + i, ident(1), 1_000, 1.0));
                    }
                });
            }
        })
        .unwrap();

        let flushed = cache.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].timer_stats().unwrap().count, (threads * per_thread) as u64);
    }

    #[test]
    fn test_concurrent_eviction_conserves_counts() {
        let cache = Arc::new(timer_cache(1_000, 4));
        let evicted_total = Arc::new(AtomicU64::new(0));

        crossbeam_utils::thread::scope(|scope| {
            for t in 0..6i64 {
                let cache = Arc::clone(&cache);
                let evicted_total = Arc::clone(&evicted_total);
                scope.spawn(move |_| {
                    for i in 0..500i64 {
                        let record = Record::timer(t * 500 + i, ident(i % 16), 0, 1.0);
                        for aggregate in cache.process(&record) {
                            evicted_total.fetch_add(aggregate.timer_stats().unwrap().count, AtomicOrdering::Relaxed);
                        }
                        assert!(cache.len() <= 4);
                    }
                });
            }
        })
        .unwrap();

        let flushed: u64 = cache.flush().iter().map(|r| r.timer_stats().unwrap().count).sum();
        assert_eq!(flushed + evicted_total.load(AtomicOrdering::Relaxed), 3_000);
    }
}
