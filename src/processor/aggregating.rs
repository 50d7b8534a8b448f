// ----------------------------------------------------------------------------
// Aggregating Stages
// ----------------------------------------------------------------------------

use std::sync::Arc;

use tracing::trace;

use super::RecordProcessor;
use crate::aggregation::{aggregator_for, AggregationCache, CacheSnapshot, LiveAggregator, RecordAggregator};
use crate::record::{Record, RecordType};
use crate::storage::{RecordWriter, WriteHandle, WritePreferences};

/// Aggregates records of one type before they reach the storage writer.
///
/// Aggregates leave the cache when it overflows (oldest first) or on
/// `flush`, and are written without invocation affiliation.
pub struct DataAggregatorProcessor {
    cache: AggregationCache,
}

impl DataAggregatorProcessor {
    pub fn new(aggregator: Arc<dyn RecordAggregator>, period_ms: i64, max_elements: usize) -> Self {
        Self {
            cache: AggregationCache::new(aggregator, period_ms, max_elements),
        }
    }

    /// Stage for a record type that aggregates, `None` otherwise
    pub fn for_type(record_type: RecordType, period_ms: i64, max_elements: usize) -> Option<Self> {
        aggregator_for(record_type).map(|aggregator| Self::new(aggregator, period_ms, max_elements))
    }

    pub fn record_type(&self) -> RecordType {
        self.cache.record_type()
    }

    pub fn live_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    fn write_all(records: Vec<Record>, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        records
            .into_iter()
            .map(|aggregate| writer.write(aggregate, WritePreferences::AGGREGATED))
            .collect()
    }
}

impl RecordProcessor for DataAggregatorProcessor {
    fn name(&self) -> &'static str {
        "data_aggregator"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        self.cache.accepts(record)
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        let evicted = self.cache.process(record);
        Self::write_all(evicted, writer)
    }

    fn flush(&self, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        let flushed = self.cache.flush();
        if !flushed.is_empty() {
            trace!(
                target: "perfstore::processor",
                record_type = %self.cache.record_type(),
                count = flushed.len(),
                "Flushing aggregates"
            );
        }
        Self::write_all(flushed, writer)
    }
}

/// Hands charting records to the live aggregation path. Nothing is written
/// to storage by this stage.
pub struct ChartingProcessor {
    live: Arc<LiveAggregator>,
}

impl ChartingProcessor {
    pub fn new(live: Arc<LiveAggregator>) -> Self {
        Self { live }
    }
}

impl RecordProcessor for ChartingProcessor {
    fn name(&self) -> &'static str {
        "charting"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        record.is_charting()
    }

    fn process_record(&self, record: &mut Record, _writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        self.live.process(record);
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceStore;
    use crate::processor::test_support::RecordingWriter;
    use crate::record::{RecordIdent, RecordPayload, TimerStats};

    const IDENT: RecordIdent = RecordIdent::new(1, 2, 3);

    fn timer_stage(period_ms: i64, max_elements: usize) -> DataAggregatorProcessor {
        DataAggregatorProcessor::for_type(RecordType::Timer, period_ms, max_elements).unwrap()
    }

    #[test]
    fn test_identical_records_flush_as_one() {
        let stage = timer_stage(5_000, 100);
        let writer = RecordingWriter::default();

        for i in 0..500 {
            assert!(stage.process(&mut Record::timer(i, IDENT, 1_000, 2.0), &writer).is_empty());
        }
        assert_eq!(writer.count(), 0);

        let handles = stage.flush(&writer);
        assert_eq!(handles.len(), 1);
        let aggregate = &writer.records()[0];
        assert_eq!(aggregate.timer_stats().unwrap().count, 500);
        assert_eq!(aggregate.timer_stats().unwrap().duration, 1_000.0);
        assert!(stage.flush(&writer).is_empty());
    }

    #[test]
    fn test_overflow_writes_oldest_without_affiliation() {
        let stage = timer_stage(1_000, 1);
        let writer = RecordingWriter::default();

        stage.process(&mut Record::timer(1, IDENT, 10_000, 1.0).with_parent(77), &writer);
        stage.process(&mut Record::timer(2, IDENT, 10_500, 3.0), &writer);
        assert_eq!(writer.count(), 0);

        stage.process(&mut Record::timer(3, IDENT, 12_000, 5.0), &writer);

        let writes = writer.writes.lock();
        assert_eq!(writes.len(), 1);
        let (aggregate, preferences) = &writes[0];
        assert_eq!(aggregate.id, 1);
        assert_eq!(aggregate.timestamp_ms, 10_000);
        assert_eq!(aggregate.timer_stats().unwrap().count, 2);
        assert!(!preferences.write_invocation_affiliation);
    }

    #[test]
    fn test_other_types_pass_through_untouched() {
        let stage = timer_stage(1_000, 10);
        let sql = Record::sql(1, IDENT, 0, 1.0, "select 1", true);
        assert!(!stage.can_be_processed(&sql));
        assert!(DataAggregatorProcessor::for_type(RecordType::Jmx, 1_000, 10).is_none());
    }

    #[test]
    fn test_charting_feeds_live_path_only() {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let live = Arc::new(LiveAggregator::new(store.clone(), 1_000, 10));
        let stage = ChartingProcessor::new(live.clone());
        let writer = RecordingWriter::default();

        let mut charting = Record::new(1, IDENT, 0, RecordPayload::Timer(TimerStats::single(4.0).with_charting(true)));
        let mut plain = Record::timer(2, IDENT, 0, 4.0);
        assert!(stage.process(&mut charting, &writer).is_empty());
        assert!(stage.process(&mut plain, &writer).is_empty());

        assert_eq!(writer.count(), 0);
        assert_eq!(live.live_entries(), 1);
        assert_eq!(live.sweep(), 1);
        assert_eq!(store.len(), 1);
    }
}
