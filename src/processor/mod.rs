// ============================================================================
// RECORD PROCESSORS
// ============================================================================
// Ordered, pluggable stages applied to every incoming record before it is
// written. A stage that does not accept a record is skipped. Stages that
// buffer records internally release them on `flush`.
// ============================================================================

pub mod aggregating;
pub mod filter;
pub mod invocation;
pub mod stages;

use std::sync::Arc;

use crate::record::Record;
use crate::storage::{RecordWriter, WriteHandle};

pub use aggregating::{ChartingProcessor, DataAggregatorProcessor};
pub use filter::{AgentFilterProcessor, TimeFrameProcessor};
pub use invocation::{InvocationClonerProcessor, InvocationExtractorProcessor};
pub use stages::{DataSaverProcessor, SqlExclusiveTimeProcessor};

pub trait RecordProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_be_processed(&self, record: &Record) -> bool;

    /// Handle an accepted record. Stages may modify the record for the
    /// stages that follow.
    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle>;

    fn process(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        if self.can_be_processed(record) {
            self.process_record(record, writer)
        } else {
            Vec::new()
        }
    }

    /// Release everything buffered so far
    fn flush(&self, _writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        Vec::new()
    }
}

/// Stages run in a fixed order
#[derive(Clone, Default)]
pub struct ProcessorChain {
    stages: Vec<Arc<dyn RecordProcessor>>,
}

impl ProcessorChain {
    pub fn new(stages: Vec<Arc<dyn RecordProcessor>>) -> Self {
        Self { stages }
    }

    pub fn with(mut self, stage: Arc<dyn RecordProcessor>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Arc<dyn RecordProcessor>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn process(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        let mut handles = Vec::new();
        for stage in &self.stages {
            handles.extend(stage.process(record, writer));
        }
        handles
    }

    pub fn flush(&self, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        self.stages.iter().flat_map(|s| s.flush(writer)).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingWriter;
    use super::*;
    use crate::record::{RecordIdent, RecordType};

    #[test]
    fn test_chain_runs_stages_in_order() {
        let chain = ProcessorChain::default()
            .with(Arc::new(SqlExclusiveTimeProcessor))
            .with(Arc::new(DataSaverProcessor::new([RecordType::SqlStatement])));
        assert_eq!(chain.names(), vec!["sql_exclusive_time", "data_saver"]);

        let writer = RecordingWriter::default();
        let mut record = Record::sql(1, RecordIdent::new(1, 1, 1), 0, 8.0, "select 1", true);
        let handles = chain.process(&mut record, &writer);

        assert_eq!(handles.len(), 1);
        let saved = &writer.records()[0];
        assert_eq!(saved.timer_stats().unwrap().exclusive.unwrap().duration, 8.0);
    }

    #[test]
    fn test_unaccepted_records_are_skipped() {
        let chain = ProcessorChain::new(vec![Arc::new(DataSaverProcessor::new([RecordType::Jmx]))]);
        let writer = RecordingWriter::default();
        let mut record = Record::timer(1, RecordIdent::new(1, 1, 1), 0, 1.0);

        assert!(chain.process(&mut record, &writer).is_empty());
        assert!(chain.flush(&writer).is_empty());
        assert_eq!(writer.count(), 0);
    }
}
