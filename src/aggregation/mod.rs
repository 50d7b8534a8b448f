// ============================================================================
// AGGREGATION
// ============================================================================
// Time-bucketed aggregation of timer-like records. The same bounded cache
// backs the storage path (evictions go to the storage writer) and the live
// path (evictions go to a persistence store).
// ============================================================================

pub mod aggregator;
pub mod cache;
pub mod live;

pub use aggregator::{
    aggregator_for, bucket_start, AggregationKey, HttpTimerAggregator, RecordAggregator, SqlStatementAggregator,
    TimerAggregator,
};
pub use cache::{AggregationCache, CacheSnapshot};
pub use live::{LiveAggregator, LiveSnapshot, SweeperHandle};
