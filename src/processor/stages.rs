// ----------------------------------------------------------------------------
// Basic Stages
// ----------------------------------------------------------------------------

use smallvec::SmallVec;

use super::RecordProcessor;
use crate::record::{Record, RecordPayload, RecordType};
use crate::storage::{RecordWriter, WriteHandle, WritePreferences};

/// Writes records of an allow-list of types as they are
pub struct DataSaverProcessor {
    types: SmallVec<[RecordType; 6]>,
}

impl DataSaverProcessor {
    pub fn new(types: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }
}

impl RecordProcessor for DataSaverProcessor {
    fn name(&self) -> &'static str {
        "data_saver"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        self.types.contains(&record.record_type())
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        vec![writer.write(record.clone(), WritePreferences::default())]
    }
}

/// A leaf SQL call spends all of its time in itself: copies the total
/// statistics into the exclusive ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlExclusiveTimeProcessor;

impl RecordProcessor for SqlExclusiveTimeProcessor {
    fn name(&self) -> &'static str {
        "sql_exclusive_time"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        record.record_type() == RecordType::SqlStatement
    }

    fn process_record(&self, record: &mut Record, _writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        if let RecordPayload::SqlStatement { timer, .. } = &mut record.payload {
            timer.exclusive_from_total();
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::RecordingWriter;
    use crate::record::{RecordIdent, TimerStats};

    const IDENT: RecordIdent = RecordIdent::new(1, 2, 3);

    #[test]
    fn test_saver_writes_allow_listed_types() {
        let saver = DataSaverProcessor::new([RecordType::Timer, RecordType::SqlStatement]);
        let writer = RecordingWriter::default();

        saver.process(&mut Record::timer(1, IDENT, 0, 1.0), &writer);
        saver.process(&mut Record::sql(2, IDENT, 0, 1.0, "select 1", true), &writer);
        saver.process(&mut Record::http(3, IDENT, 0, 1.0, "/", "GET"), &writer);

        assert_eq!(writer.count(), 2);
        assert!(writer.writes.lock().iter().all(|(_, p)| p.write_invocation_affiliation));
    }

    #[test]
    fn test_exclusive_time_equals_total() {
        let mut record = Record::sql(1, IDENT, 0, 30.0, "select 1", true);
        if let Some(timer) = record.timer_stats_mut() {
            timer.merge(&TimerStats::single(10.0));
        }

        SqlExclusiveTimeProcessor.process(&mut record, &RecordingWriter::default());
        let stats = record.timer_stats().unwrap();
        let exclusive = stats.exclusive.unwrap();
        assert_eq!(exclusive.count, 2);
        assert_eq!(exclusive.duration, 40.0);
        assert_eq!(exclusive.min, 10.0);
        assert_eq!(exclusive.max, 30.0);
    }

    #[test]
    fn test_exclusive_time_ignores_timers() {
        let mut record = Record::timer(1, IDENT, 0, 30.0);
        SqlExclusiveTimeProcessor.process(&mut record, &RecordingWriter::default());
        assert!(record.timer_stats().unwrap().exclusive.is_none());
    }
}
