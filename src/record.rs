// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// Performance records as emitted by agents. A record is identified by the
// platform (agent), sensor type and method that produced it and carries a
// type-specific payload. Records are immutable for the pipeline until an
// aggregation stage clones one into a mutable aggregate.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Record Identity
// ----------------------------------------------------------------------------

/// Identity of the agent, sensor and method that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdent {
    pub platform_ident: i64,
    pub sensor_type_ident: i64,
    pub method_ident: i64,
}

impl RecordIdent {
    pub const fn new(platform_ident: i64, sensor_type_ident: i64, method_ident: i64) -> Self {
        Self {
            platform_ident,
            sensor_type_ident,
            method_ident,
        }
    }
}

/// Discriminant of a record payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    Timer,
    HttpTimer,
    SqlStatement,
    Jmx,
    InvocationSequence,
    Exception,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Timer => "timer",
            RecordType::HttpTimer => "http_timer",
            RecordType::SqlStatement => "sql_statement",
            RecordType::Jmx => "jmx",
            RecordType::InvocationSequence => "invocation_sequence",
            RecordType::Exception => "exception",
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Timer Statistics
// ----------------------------------------------------------------------------

/// CPU time measured alongside a timer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub duration: f64,
    pub min: f64,
    pub max: f64,
}

impl CpuStats {
    pub fn single(duration: f64) -> Self {
        Self {
            duration,
            min: duration,
            max: duration,
        }
    }

    fn merge(&mut self, other: &CpuStats) {
        self.duration += other.duration;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Exclusive time: total time minus the time spent in nested measured calls
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExclusiveStats {
    pub count: u64,
    pub duration: f64,
    pub min: f64,
    pub max: f64,
}

impl ExclusiveStats {
    fn merge(&mut self, other: &ExclusiveStats) {
        self.count += other.count;
        self.duration += other.duration;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Running duration statistics of a timed call.
///
/// An empty accumulator has `min = +inf` and `max = -inf` so that the first
/// merged measurement always wins both comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    pub count: u64,
    pub duration: f64,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub cpu: Option<CpuStats>,
    #[serde(default)]
    pub exclusive: Option<ExclusiveStats>,
    /// Record should feed the live charting aggregation
    #[serde(default)]
    pub charting: bool,
}

impl Default for TimerStats {
    fn default() -> Self {
        Self::empty()
    }
}

impl TimerStats {
    pub fn empty() -> Self {
        Self {
            count: 0,
            duration: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            cpu: None,
            exclusive: None,
            charting: false,
        }
    }

    /// Statistics of exactly one measurement
    pub fn single(duration: f64) -> Self {
        Self {
            count: 1,
            duration,
            min: duration,
            max: duration,
            ..Self::empty()
        }
    }

    pub fn with_cpu(mut self, cpu_duration: f64) -> Self {
        self.cpu = Some(CpuStats::single(cpu_duration));
        self
    }

    pub fn with_charting(mut self, charting: bool) -> Self {
        self.charting = charting;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `duration / count`, zero for an empty accumulator
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.duration / self.count as f64
        }
    }

    /// Add one raw measurement
    pub fn add_measurement(&mut self, duration: f64) {
        self.merge(&Self::single(duration));
    }

    /// Merge another accumulator into this one.
    ///
    /// Sums counts and durations and keeps the extremal min/max, so the result
    /// does not depend on merge order.
    pub fn merge(&mut self, other: &TimerStats) {
        self.count += other.count;
        self.duration += other.duration;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        if let Some(theirs) = &other.cpu {
            match self.cpu.as_mut() {
                Some(mine) => mine.merge(theirs),
                None => self.cpu = Some(*theirs),
            }
        }

        if let Some(theirs) = &other.exclusive {
            match self.exclusive.as_mut() {
                Some(mine) => mine.merge(theirs),
                None => self.exclusive = Some(*theirs),
            }
        }

        self.charting |= other.charting;
    }

    /// Copy the total statistics into the exclusive fields.
    pub fn exclusive_from_total(&mut self) {
        self.exclusive = Some(ExclusiveStats {
            count: self.count,
            duration: self.duration,
            min: self.min,
            max: self.max,
        });
    }

    /// Empty accumulator that keeps the charting flag
    pub fn cleared(&self) -> Self {
        Self {
            charting: self.charting,
            ..Self::empty()
        }
    }
}

// ----------------------------------------------------------------------------
// Record Payloads
// ----------------------------------------------------------------------------

/// Type-specific content of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPayload {
    Timer(TimerStats),
    HttpTimer {
        timer: TimerStats,
        uri: CompactString,
        request_method: CompactString,
    },
    SqlStatement {
        timer: TimerStats,
        sql: CompactString,
        prepared: bool,
    },
    Jmx {
        definition_ident: i64,
        value: CompactString,
    },
    InvocationSequence {
        timer: TimerStats,
        /// Timer or SQL measurement of this invocation node
        #[serde(default)]
        attached: Option<Box<Record>>,
        /// Child invocation nodes
        #[serde(default)]
        nested: Vec<Record>,
        child_count: u64,
    },
    Exception {
        class_name: CompactString,
        message: CompactString,
    },
}

impl RecordPayload {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordPayload::Timer(_) => RecordType::Timer,
            RecordPayload::HttpTimer { .. } => RecordType::HttpTimer,
            RecordPayload::SqlStatement { .. } => RecordType::SqlStatement,
            RecordPayload::Jmx { .. } => RecordType::Jmx,
            RecordPayload::InvocationSequence { .. } => RecordType::InvocationSequence,
            RecordPayload::Exception { .. } => RecordType::Exception,
        }
    }
}

// ----------------------------------------------------------------------------
// The Record
// ----------------------------------------------------------------------------

/// Ids of the invocation sequences a record was measured in
pub type ParentIds = SmallVec<[i64; 4]>;

/// One performance measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub ident: RecordIdent,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    #[serde(default)]
    pub invocation_parent_ids: ParentIds,
    pub payload: RecordPayload,
}

impl Record {
    pub fn new(id: i64, ident: RecordIdent, timestamp_ms: i64, payload: RecordPayload) -> Self {
        Self {
            id,
            ident,
            timestamp_ms,
            invocation_parent_ids: ParentIds::new(),
            payload,
        }
    }

    pub fn timer(id: i64, ident: RecordIdent, timestamp_ms: i64, duration: f64) -> Self {
        Self::new(id, ident, timestamp_ms, RecordPayload::Timer(TimerStats::single(duration)))
    }

    pub fn http(
        id: i64,
        ident: RecordIdent,
        timestamp_ms: i64,
        duration: f64,
        uri: &str,
        request_method: &str,
    ) -> Self {
        Self::new(
            id,
            ident,
            timestamp_ms,
            RecordPayload::HttpTimer {
                timer: TimerStats::single(duration),
                uri: uri.into(),
                request_method: request_method.into(),
            },
        )
    }

    pub fn sql(id: i64, ident: RecordIdent, timestamp_ms: i64, duration: f64, sql: &str, prepared: bool) -> Self {
        Self::new(
            id,
            ident,
            timestamp_ms,
            RecordPayload::SqlStatement {
                timer: TimerStats::single(duration),
                sql: sql.into(),
                prepared,
            },
        )
    }

    pub fn invocation(
        id: i64,
        ident: RecordIdent,
        timestamp_ms: i64,
        duration: f64,
        attached: Option<Record>,
        nested: Vec<Record>,
    ) -> Self {
        let child_count = nested.iter().map(|child| 1 + child.descendant_count()).sum();
        Self::new(
            id,
            ident,
            timestamp_ms,
            RecordPayload::InvocationSequence {
                timer: TimerStats::single(duration),
                attached: attached.map(Box::new),
                nested,
                child_count,
            },
        )
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.add_invocation_parent(parent_id);
        self
    }

    pub fn record_type(&self) -> RecordType {
        self.payload.record_type()
    }

    /// Timer statistics of timer-like payloads
    pub fn timer_stats(&self) -> Option<&TimerStats> {
        match &self.payload {
            RecordPayload::Timer(timer)
            | RecordPayload::HttpTimer { timer, .. }
            | RecordPayload::SqlStatement { timer, .. }
            | RecordPayload::InvocationSequence { timer, .. } => Some(timer),
            _ => None,
        }
    }

    pub fn timer_stats_mut(&mut self) -> Option<&mut TimerStats> {
        match &mut self.payload {
            RecordPayload::Timer(timer)
            | RecordPayload::HttpTimer { timer, .. }
            | RecordPayload::SqlStatement { timer, .. }
            | RecordPayload::InvocationSequence { timer, .. } => Some(timer),
            _ => None,
        }
    }

    pub fn is_charting(&self) -> bool {
        self.timer_stats().map_or(false, |t| t.charting)
    }

    /// Keeps the parent ids sorted and free of duplicates
    pub fn add_invocation_parent(&mut self, parent_id: i64) {
        if let Err(pos) = self.invocation_parent_ids.binary_search(&parent_id) {
            self.invocation_parent_ids.insert(pos, parent_id);
        }
    }

    fn descendant_count(&self) -> u64 {
        match &self.payload {
            RecordPayload::InvocationSequence { child_count, .. } => *child_count,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IDENT: RecordIdent = RecordIdent::new(1, 2, 3);

    #[test]
    fn test_empty_stats_sentinels() {
        let stats = TimerStats::empty();
        assert!(stats.is_empty());
        assert_eq!(stats.average(), 0.0);
        assert!(stats.min.is_infinite() && stats.min > 0.0);
        assert!(stats.max.is_infinite() && stats.max < 0.0);
    }

    #[test]
    fn test_merge_two_measurements() {
        let mut stats = TimerStats::empty();
        stats.merge(&TimerStats::single(10.0));
        stats.merge(&TimerStats::single(100.0));

        assert_eq!(stats.count, 2);
        assert_eq!(stats.duration, 110.0);
        assert_eq!(stats.average(), 55.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 100.0);
    }

    #[test]
    fn test_merge_cpu_and_exclusive() {
        let mut a = TimerStats::single(10.0);
        let mut b = TimerStats::single(20.0).with_cpu(5.0).with_charting(true);
        b.exclusive_from_total();

        a.merge(&b);
        assert_eq!(a.cpu, Some(CpuStats::single(5.0)));
        assert_eq!(a.exclusive.map(|e| e.count), Some(1));
        assert!(a.charting);

        a.merge(&TimerStats::single(1.0).with_cpu(1.0));
        let cpu = a.cpu.unwrap();
        assert_eq!(cpu.duration, 6.0);
        assert_eq!(cpu.min, 1.0);
        assert_eq!(cpu.max, 5.0);
    }

    #[test]
    fn test_parent_ids_sorted_unique() {
        let record = Record::timer(1, IDENT, 0, 1.0).with_parent(9).with_parent(3).with_parent(9);
        assert_eq!(record.invocation_parent_ids.as_slice(), &[3, 9]);
    }

    #[test]
    fn test_invocation_child_count() {
        let leaf = Record::invocation(3, IDENT, 0, 1.0, None, vec![]);
        let middle = Record::invocation(2, IDENT, 0, 2.0, None, vec![leaf]);
        let root = Record::invocation(1, IDENT, 0, 3.0, None, vec![middle, Record::invocation(4, IDENT, 0, 1.0, None, vec![])]);

        match root.payload {
            RecordPayload::InvocationSequence { child_count, .. } => assert_eq!(child_count, 3),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_record_types() {
        assert_eq!(Record::timer(1, IDENT, 0, 1.0).record_type(), RecordType::Timer);
        assert_eq!(Record::sql(1, IDENT, 0, 1.0, "select 1", true).record_type(), RecordType::SqlStatement);
        assert_eq!(Record::http(1, IDENT, 0, 1.0, "/", "GET").record_type(), RecordType::HttpTimer);
        assert_eq!(RecordType::InvocationSequence.to_string(), "invocation_sequence");
    }

    #[test]
    fn test_json_shape() {
        let record = Record::sql(7, IDENT, 1_000, 4.0, "select * from t", false);
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    proptest! {
        #[test]
        fn test_merge_order_does_not_matter(durations in proptest::collection::vec(0u32..100_000, 1..50)) {
            let mut forward = TimerStats::empty();
            for d in &durations {
                forward.add_measurement(*d as f64);
            }
            let mut backward = TimerStats::empty();
            for d in durations.iter().rev() {
                backward.add_measurement(*d as f64);
            }

            prop_assert_eq!(forward.count, backward.count);
            prop_assert_eq!(forward.duration, backward.duration);
            prop_assert_eq!(forward.min, backward.min);
            prop_assert_eq!(forward.max, backward.max);
        }
    }
}
