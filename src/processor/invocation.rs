// ----------------------------------------------------------------------------
// Invocation Stages
// ----------------------------------------------------------------------------

use super::{ProcessorChain, RecordProcessor};
use crate::record::{Record, RecordPayload, RecordType};
use crate::storage::{RecordWriter, WriteHandle, WritePreferences};

fn is_invocation(record: &Record) -> bool {
    record.record_type() == RecordType::InvocationSequence
}

/// Forwards the timer and SQL measurements attached to the nested nodes of an
/// invocation tree to an inner chain. Each extracted record is affiliated
/// with the root invocation.
pub struct InvocationExtractorProcessor {
    inner: ProcessorChain,
}

impl InvocationExtractorProcessor {
    pub fn new(inner: ProcessorChain) -> Self {
        Self { inner }
    }

    fn extract(&self, root_id: i64, nodes: &[Record], writer: &dyn RecordWriter, handles: &mut Vec<WriteHandle>) {
        for node in nodes {
            if let RecordPayload::InvocationSequence { attached, nested, .. } = &node.payload {
                if let Some(measurement) = attached {
                    let mut record = measurement.as_ref().clone();
                    record.add_invocation_parent(root_id);
                    handles.extend(self.inner.process(&mut record, writer));
                }
                self.extract(root_id, nested, writer, handles);
            }
        }
    }
}

impl RecordProcessor for InvocationExtractorProcessor {
    fn name(&self) -> &'static str {
        "invocation_extractor"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        is_invocation(record)
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        let mut handles = Vec::new();
        if let RecordPayload::InvocationSequence { nested, .. } = &record.payload {
            self.extract(record.id, nested, writer, &mut handles);
        }
        handles
    }

    fn flush(&self, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        self.inner.flush(writer)
    }
}

/// Writes a copy of the invocation root without its nested nodes. The child
/// count is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvocationClonerProcessor;

impl RecordProcessor for InvocationClonerProcessor {
    fn name(&self) -> &'static str {
        "invocation_cloner"
    }

    fn can_be_processed(&self, record: &Record) -> bool {
        is_invocation(record)
    }

    fn process_record(&self, record: &mut Record, writer: &dyn RecordWriter) -> Vec<WriteHandle> {
        let mut clone = record.clone();
        if let RecordPayload::InvocationSequence { nested, .. } = &mut clone.payload {
            nested.clear();
        }
        vec![writer.write(clone, WritePreferences::default())]
    }
}
