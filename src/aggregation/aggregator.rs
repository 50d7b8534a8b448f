// ----------------------------------------------------------------------------
// Record Aggregators
// ----------------------------------------------------------------------------
// An aggregator decides which records may merge (the aggregation key), how
// the mutable aggregate is created from the first record of a bucket, and how
// later records are merged into it.
// ----------------------------------------------------------------------------

use compact_str::CompactString;

use crate::record::{Record, RecordIdent, RecordPayload, RecordType, TimerStats};

/// Identity part of an aggregation key. Records merge only when both the key
/// and the time bucket are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregationKey {
    Timer {
        ident: RecordIdent,
    },
    Http {
        ident: RecordIdent,
        uri: CompactString,
        request_method: CompactString,
    },
    Sql {
        ident: RecordIdent,
        sql: CompactString,
        prepared: bool,
    },
}

/// Start of the bucket that contains `timestamp_ms`
pub fn bucket_start(timestamp_ms: i64, period_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(period_ms)
}

pub trait RecordAggregator: Send + Sync {
    /// Type of record this aggregator handles
    fn record_type(&self) -> RecordType;

    fn can_aggregate(&self, record: &Record) -> bool {
        record.record_type() == self.record_type()
    }

    /// Key of an accepted record
    fn aggregation_key(&self, record: &Record) -> AggregationKey;

    /// Fresh aggregate for the bucket: identity copied, statistics empty,
    /// timestamp moved to the bucket boundary.
    fn clone_for_aggregation(&self, record: &Record, id: i64, bucket_start: i64) -> Record;

    /// Merge `from` into the aggregate
    fn aggregate(&self, into: &mut Record, from: &Record) {
        if let (Some(target), Some(source)) = (into.timer_stats_mut(), from.timer_stats()) {
            target.merge(source);
        }
        for parent in &from.invocation_parent_ids {
            into.add_invocation_parent(*parent);
        }
    }
}

// ----------------------------------------------------------------------------
// Timer
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct TimerAggregator;

impl RecordAggregator for TimerAggregator {
    fn record_type(&self) -> RecordType {
        RecordType::Timer
    }

    fn aggregation_key(&self, record: &Record) -> AggregationKey {
        AggregationKey::Timer { ident: record.ident }
    }

    fn clone_for_aggregation(&self, record: &Record, id: i64, bucket_start: i64) -> Record {
        let timer = record.timer_stats().map(TimerStats::cleared).unwrap_or_default();
        Record::new(id, record.ident, bucket_start, RecordPayload::Timer(timer))
    }
}

// ----------------------------------------------------------------------------
// HTTP timer
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTimerAggregator;

impl RecordAggregator for HttpTimerAggregator {
    fn record_type(&self) -> RecordType {
        RecordType::HttpTimer
    }

    fn aggregation_key(&self, record: &Record) -> AggregationKey {
        match &record.payload {
            RecordPayload::HttpTimer { uri, request_method, .. } => AggregationKey::Http {
                ident: record.ident,
                uri: uri.clone(),
                request_method: request_method.clone(),
            },
            _ => AggregationKey::Timer { ident: record.ident },
        }
    }

    fn clone_for_aggregation(&self, record: &Record, id: i64, bucket_start: i64) -> Record {
        let payload = match &record.payload {
            RecordPayload::HttpTimer { timer, uri, request_method } => RecordPayload::HttpTimer {
                timer: timer.cleared(),
                uri: uri.clone(),
                request_method: request_method.clone(),
            },
            _ => RecordPayload::Timer(TimerStats::empty()),
        };
        Record::new(id, record.ident, bucket_start, payload)
    }
}

// ----------------------------------------------------------------------------
// SQL statement
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlStatementAggregator;

impl RecordAggregator for SqlStatementAggregator {
    fn record_type(&self) -> RecordType {
        RecordType::SqlStatement
    }

    fn aggregation_key(&self, record: &Record) -> AggregationKey {
        match &record.payload {
            RecordPayload::SqlStatement { sql, prepared, .. } => AggregationKey::Sql {
                ident: record.ident,
                sql: sql.clone(),
                prepared: *prepared,
            },
            _ => AggregationKey::Timer { ident: record.ident },
        }
    }

    fn clone_for_aggregation(&self, record: &Record, id: i64, bucket_start: i64) -> Record {
        let payload = match &record.payload {
            RecordPayload::SqlStatement { timer, sql, prepared } => RecordPayload::SqlStatement {
                timer: timer.cleared(),
                sql: sql.clone(),
                prepared: *prepared,
            },
            _ => RecordPayload::Timer(TimerStats::empty()),
        };
        Record::new(id, record.ident, bucket_start, payload)
    }
}

/// Aggregator for the given record type, if that type aggregates at all
pub fn aggregator_for(record_type: RecordType) -> Option<std::sync::Arc<dyn RecordAggregator>> {
    match record_type {
        RecordType::Timer => Some(std::sync::Arc::new(TimerAggregator)),
        RecordType::HttpTimer => Some(std::sync::Arc::new(HttpTimerAggregator)),
        RecordType::SqlStatement => Some(std::sync::Arc::new(SqlStatementAggregator)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: RecordIdent = RecordIdent::new(10, 20, 30);

    #[test]
    fn test_bucket_start() {
        assert_eq!(bucket_start(12_345, 1_000), 12_000);
        assert_eq!(bucket_start(12_000, 1_000), 12_000);
        assert_eq!(bucket_start(-1, 1_000), -1_000);
    }

    #[test]
    fn test_timer_clone_is_empty_at_bucket() {
        let record = Record::timer(5, IDENT, 12_345, 40.0).with_parent(77);
        let clone = TimerAggregator.clone_for_aggregation(&record, 1, 12_000);

        assert_eq!(clone.id, 1);
        assert_eq!(clone.ident, IDENT);
        assert_eq!(clone.timestamp_ms, 12_000);
        assert!(clone.timer_stats().unwrap().is_empty());
        assert!(clone.invocation_parent_ids.is_empty());
    }

    #[test]
    fn test_aggregate_merges_stats_and_parents() {
        let mut aggregate = TimerAggregator.clone_for_aggregation(&Record::timer(1, IDENT, 0, 1.0), 1, 0);
        TimerAggregator.aggregate(&mut aggregate, &Record::timer(1, IDENT, 10, 10.0).with_parent(3));
        TimerAggregator.aggregate(&mut aggregate, &Record::timer(2, IDENT, 20, 100.0).with_parent(2));

        let stats = aggregate.timer_stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.average(), 55.0);
        assert_eq!(aggregate.invocation_parent_ids.as_slice(), &[2, 3]);
    }

    #[test]
    fn test_sql_key_includes_statement() {
        let a = Record::sql(1, IDENT, 0, 1.0, "select 1", true);
        let b = Record::sql(2, IDENT, 0, 1.0, "select 2", true);
        let c = Record::sql(3, IDENT, 0, 1.0, "select 1", true);

        let agg = SqlStatementAggregator;
        assert_ne!(agg.aggregation_key(&a), agg.aggregation_key(&b));
        assert_eq!(agg.aggregation_key(&a), agg.aggregation_key(&c));
        assert!(!agg.can_aggregate(&Record::timer(1, IDENT, 0, 1.0)));
    }

    #[test]
    fn test_http_key_includes_uri_and_method() {
        let agg = HttpTimerAggregator;
        let get = Record::http(1, IDENT, 0, 1.0, "/orders", "GET");
        let post = Record::http(2, IDENT, 0, 1.0, "/orders", "POST");
        assert_ne!(agg.aggregation_key(&get), agg.aggregation_key(&post));
        assert!(aggregator_for(RecordType::Jmx).is_none());
    }
}
