// ----------------------------------------------------------------------------
// Filtering Stages
// ----------------------------------------------------------------------------
// Wrappers that forward matching records to an inner chain. They accept every
// record; the predicate is evaluated inside `process_record`.
// ----------------------------------------------------------------------------

use ahash::AHashSet;

use super::{ProcessorChain, RecordProcessor};
use crate::record::Record;
use crate::storage::{RecordWriter, WriteHandle};

/// Forwards records of the given agents only
pub struct AgentFilterProcessor {
    platforms: AHashSet<i64>,
    inner: ProcessorChain,
}

impl AgentFilterProcessor {
    pub fn new(platforms: impl IntoIterator<Item = i64>, inner: ProcessorChain) -> Self {
        Self {
            platforms: platforms.into_iter().collect(),
            inner,
        }
    }
}

impl RecordProcessor for AgentFilterProcessor {
    fn name(&self) -> &'static str {
        "agent_filter"
    }

    fn can_be_processed(&self, _record: &Record) -> bool {
        true
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        if self.platforms.contains(&record.ident.platform_ident) {
            self.inner.process(record, writer)
        } else {
            Vec::new()
        }
    }

    fn flush(&self, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        self.inner.flush(writer)
    }
}

/// Forwards records whose timestamp lies in `[from_ms, to_ms]`
pub struct TimeFrameProcessor {
    from_ms: i64,
    to_ms: i64,
    inner: ProcessorChain,
}

impl TimeFrameProcessor {
    pub fn new(from_ms: i64, to_ms: i64, inner: ProcessorChain) -> Self {
        Self { from_ms, to_ms, inner }
    }
}

impl RecordProcessor for TimeFrameProcessor {
    fn name(&self) -> &'static str {
        "time_frame"
    }

    fn can_be_processed(&self, _record: &Record) -> bool {
        true
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        if (self.from_ms..=self.to_ms).contains(&record.timestamp_ms) {
            self.inner.process(record, writer)
        } else {
            Vec::new()
        }
    }

    fn flush(&self, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        self.inner.flush(writer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::processor::test_support::RecordingWriter;
    use crate::processor::DataSaverProcessor;
    use crate::record::{RecordIdent, RecordType};

    fn saver() -> ProcessorChain {
        ProcessorChain::new(vec![Arc::new(DataSaverProcessor::new([RecordType::Timer]))])
    }

    #[test]
    fn test_agent_filter_accepts_everything_but_forwards_matches() {
        let filter = AgentFilterProcessor::new([1, 3], saver());
        let writer = RecordingWriter::default();

        for platform in 1..=4 {
            let mut record = Record::timer(platform, RecordIdent::new(platform, 1, 1), 0, 1.0);
            assert!(filter.can_be_processed(&record));
            filter.process(&mut record, &writer);
        }

        let platforms: Vec<i64> = writer.records().iter().map(|r| r.ident.platform_ident).collect();
        assert_eq!(platforms, vec![1, 3]);
    }

    #[test]
    fn test_time_frame_is_inclusive() {
        let frame = TimeFrameProcessor::new(1_000, 2_000, saver());
        let writer = RecordingWriter::default();

        for ts in [999, 1_000, 1_500, 2_000, 2_001] {
            frame.process(&mut Record::timer(ts, RecordIdent::new(1, 1, 1), ts, 1.0), &writer);
        }

        let stamps: Vec<i64> = writer.records().iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps, vec![1_000, 1_500, 2_000]);
    }
}
