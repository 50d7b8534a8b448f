// ============================================================================
// STORAGE WRITER
// ============================================================================
// Per-record write orchestration. Every record becomes a `WriteTask` that runs
// on the writer executor:
//
//   storage check → index slot → serializer lease → pooled output stream
//     → channel submission → (async) commit or rollback
//
// A task is never retried. Every failure after the slot was requested rolls
// the slot back exactly once, and serializers and buffers are returned on
// every exit path through their owning guards.
// ============================================================================

use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rayon::ThreadPool;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use super::channel::ChannelManager;
use super::indexing::{IndexingTreeHandler, StorageIndex};
use super::manager::{StorageData, StorageManager};
use super::serializer::SerializerPool;
use super::status::{WritingStatus, WritingStatusTracker};
use crate::error::{PerfStoreError, PerfStoreResult, WriteError, WriteResult};
use crate::pool::BufferPool;
use crate::processor::ProcessorChain;
use crate::record::Record;
use crate::stream::PooledOutputStream;
use crate::{PROCESS_SYNC_POLL_MS, STORAGE_INDEX_FILE, STORAGE_INFO_FILE};

// ----------------------------------------------------------------------------
// Write Preferences & Handles
// ----------------------------------------------------------------------------

/// Per-write serialization options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePreferences {
    /// Keep the ids of the invocation sequences a record was measured in
    pub write_invocation_affiliation: bool,
}

impl WritePreferences {
    /// Preferences of aggregated writes
    pub const AGGREGATED: Self = Self {
        write_invocation_affiliation: false,
    };
}

impl Default for WritePreferences {
    fn default() -> Self {
        Self {
            write_invocation_affiliation: true,
        }
    }
}

/// Final state of one write
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Committed { position: u64, size: u64 },
    Failed(Arc<WriteError>),
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed { .. })
    }

    pub fn error(&self) -> Option<&WriteError> {
        match self {
            WriteOutcome::Failed(e) => Some(e.as_ref()),
            WriteOutcome::Committed { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct HandleState {
    outcome: Mutex<Option<WriteOutcome>>,
    done: Condvar,
}

/// Pending result of a submitted write
#[derive(Debug, Clone)]
pub struct WriteHandle {
    task_id: u64,
    state: Arc<HandleState>,
}

impl WriteHandle {
    pub fn new(task_id: u64) -> Self {
        Self {
            task_id,
            state: Arc::new(HandleState::default()),
        }
    }

    /// Handle that is already done
    pub fn ready(task_id: u64, outcome: WriteOutcome) -> Self {
        let handle = Self::new(task_id);
        handle.complete(outcome);
        handle
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_done(&self) -> bool {
        self.state.outcome.lock().is_some()
    }

    pub fn outcome(&self) -> Option<WriteOutcome> {
        self.state.outcome.lock().clone()
    }

    /// Block until the write is done or `timeout` passed
    pub fn wait_timeout(&self, timeout: Duration) -> Option<WriteOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.state.outcome.lock();
        while outcome.is_none() {
            if self.state.done.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.clone()
    }

    /// Set the outcome. Only the first call has an effect.
    pub(crate) fn complete(&self, outcome: WriteOutcome) -> bool {
        self.complete_with(outcome, || {})
    }

    /// `complete`, running `first` before waiters can observe the outcome
    fn complete_with(&self, outcome: WriteOutcome, first: impl FnOnce()) -> bool {
        let mut slot = self.state.outcome.lock();
        if slot.is_some() {
            return false;
        }
        first();
        *slot = Some(outcome);
        self.state.done.notify_all();
        true
    }
}

/// Sink of processor stages
pub trait RecordWriter: Send + Sync {
    fn write(&self, record: Record, preferences: WritePreferences) -> WriteHandle;
}

// ----------------------------------------------------------------------------
// Write Task
// ----------------------------------------------------------------------------

/// One record on its way to a channel file
#[derive(Debug)]
pub struct WriteTask {
    id: u64,
    record: Record,
    preferences: WritePreferences,
    handle: WriteHandle,
    index_requested: AtomicBool,
    index_released: AtomicBool,
    /// First of commit or failure wins; the other is ignored
    settled: AtomicBool,
}

impl WriteTask {
    pub fn new(id: u64, record: Record, preferences: WritePreferences, handle: WriteHandle) -> Self {
        Self {
            id,
            record,
            preferences,
            handle,
            index_requested: AtomicBool::new(false),
            index_released: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn preferences(&self) -> WritePreferences {
        self.preferences
    }

    pub fn handle(&self) -> &WriteHandle {
        &self.handle
    }

    fn run(self: &Arc<Self>, inner: &Arc<WriterInner>) {
        let error = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(inner))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => WriteError::TaskPanicked {
                message: panic_message(payload.as_ref()),
            },
        };
        self.fail(inner, error);
    }

    fn execute(self: &Arc<Self>, inner: &Arc<WriterInner>) -> WriteResult<()> {
        if !inner.storage_manager.can_write_more() {
            return Err(WriteError::StorageFull);
        }
        let storage = inner.active_storage().ok_or(WriteError::WriterInactive)?;

        self.index_requested.store(true, Ordering::Release);
        let channel_id = inner.indexing.start_write(self)?.ok_or(WriteError::NoSlot)?;

        let mut serializer = inner.serializers.acquire()?;
        let mut stream = PooledOutputStream::new(Arc::clone(&inner.pool));
        serializer.serialize(&self.record, &mut stream)?;
        stream.finish();
        drop(serializer);

        let path = inner.storage_manager.channel_path(&storage, channel_id);
        let task = Arc::clone(self);
        let writer = Arc::clone(inner);
        inner.channels.write(
            stream,
            &path,
            Box::new(move |result| match result {
                Ok((position, size)) => task.commit(&writer, position, size),
                Err(e) => task.fail(&writer, WriteError::ChannelWriteFailed(e)),
            }),
        )?;
        Ok(())
    }

    fn commit(&self, inner: &WriterInner, position: u64, size: u64) {
        if self.settled.swap(true, Ordering::AcqRel) {
            warn!(target: "perfstore::writer", task_id = self.id, "Channel completed a write that already failed");
            return;
        }
        inner.indexing.write_successful(self, position, size);
        inner.storage_manager.record_written(size);
        inner.stats.committed.fetch_add(1, Ordering::Relaxed);
        inner.stats.bytes_written.fetch_add(size, Ordering::Relaxed);
        inner.finish_task(&self.handle, WriteOutcome::Committed { position, size });
    }

    fn fail(&self, inner: &WriterInner, error: WriteError) {
        if self.settled.swap(true, Ordering::AcqRel) {
            debug!(target: "perfstore::writer", task_id = self.id, error = %error, "Write already settled");
            return;
        }
        let rollback = self.index_requested.load(Ordering::Acquire) && !error.precedes_indexing();
        if rollback && !self.index_released.swap(true, Ordering::AcqRel) {
            inner.indexing.write_failed(self);
        }

        match &error {
            WriteError::StorageFull | WriteError::WriterInactive => {
                warn!(target: "perfstore::writer", task_id = self.id, reason = %error, "Write rejected")
            }
            WriteError::IndexAllocationFailed(_) | WriteError::NoSlot => {
                debug!(target: "perfstore::writer", task_id = self.id, error = %error, "Index slot not allocated")
            }
            WriteError::SerializationFailed { .. }
            | WriteError::SerializerUnavailable { .. }
            | WriteError::SerializerInterrupted => {
                warn!(target: "perfstore::writer", task_id = self.id, error = %error, "Record not serialized")
            }
            _ => error!(target: "perfstore::writer", task_id = self.id, error = %error, "Write failed"),
        }

        inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        inner.finish_task(&self.handle, WriteOutcome::Failed(Arc::new(error)));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}

// ----------------------------------------------------------------------------
// Storage Writer
// ----------------------------------------------------------------------------

/// Lifecycle of a storage writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriterState {
    Idle,
    Writing,
    Closing,
    Closed,
}

impl WriterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WriterState::Idle,
            1 => WriterState::Writing,
            2 => WriterState::Closing,
            _ => WriterState::Closed,
        }
    }
}

impl Display for WriterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriterState::Idle => "idle",
            WriterState::Writing => "writing",
            WriterState::Closing => "closing",
            WriterState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct WriterStats {
    submitted: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time statistics of a storage writer
#[derive(Debug, Clone, Serialize)]
pub struct WriterSnapshot {
    pub state: WriterState,
    pub submitted: u64,
    pub committed: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub status: WritingStatus,
}

/// Collaborators of a storage writer
pub struct WriterComponents {
    pub storage_manager: Arc<dyn StorageManager>,
    pub indexing: Arc<dyn IndexingTreeHandler>,
    pub channels: Arc<dyn ChannelManager>,
    pub serializers: SerializerPool,
    pub pool: Arc<BufferPool>,
}

struct WriterInner {
    storage_manager: Arc<dyn StorageManager>,
    indexing: Arc<dyn IndexingTreeHandler>,
    channels: Arc<dyn ChannelManager>,
    serializers: SerializerPool,
    pool: Arc<BufferPool>,
    storage: RwLock<Option<StorageData>>,
    state: AtomicU8,
    lifecycle: Mutex<()>,
    next_task_id: AtomicU64,
    /// Submitted writes without an outcome yet
    in_flight: AtomicUsize,
    /// Tasks waiting for or running on the executor
    queued: AtomicUsize,
    status: WritingStatusTracker,
    stats: WriterStats,
}

impl WriterInner {
    fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WriterState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Storage accepting task writes, also while pending writes drain
    fn active_storage(&self) -> Option<StorageData> {
        match self.state() {
            WriterState::Writing | WriterState::Closing => self.storage.read().clone(),
            _ => None,
        }
    }

    fn finish_task(&self, handle: &WriteHandle, outcome: WriteOutcome) {
        handle.complete_with(outcome, || {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.status.task_finished();
        });
    }
}

/// Writes records of one storage through indexing, serialization and
/// channel files
#[derive(Clone)]
pub struct StorageWriter {
    inner: Arc<WriterInner>,
    executor: Arc<ThreadPool>,
}

impl StorageWriter {
    pub fn new(components: WriterComponents, write_threads: usize) -> PerfStoreResult<Self> {
        let executor = rayon::ThreadPoolBuilder::new()
            .num_threads(write_threads.max(1))
            .thread_name(|i| format!("perfstore-writer-{i}"))
            .build()
            .map_err(|e| PerfStoreError::Internal(format!("failed to build writer executor: {e}")))?;

        Ok(Self {
            inner: Arc::new(WriterInner {
                storage_manager: components.storage_manager,
                indexing: components.indexing,
                channels: components.channels,
                serializers: components.serializers,
                pool: components.pool,
                storage: RwLock::new(None),
                state: AtomicU8::new(WriterState::Idle as u8),
                lifecycle: Mutex::new(()),
                next_task_id: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                status: WritingStatusTracker::default(),
                stats: WriterStats::default(),
            }),
            executor: Arc::new(executor),
        })
    }

    pub fn state(&self) -> WriterState {
        self.inner.state()
    }

    pub fn is_writing(&self) -> bool {
        self.state() == WriterState::Writing
    }

    pub fn storage(&self) -> Option<StorageData> {
        self.inner.storage.read().clone()
    }

    /// Open `storage` for writing: create its folder, prepare the index and
    /// persist the storage descriptor.
    pub fn prepare_for_write(&self, storage: StorageData) -> PerfStoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if state != WriterState::Idle {
            return Err(PerfStoreError::Internal(format!(
                "cannot prepare a storage writer that is {state}"
            )));
        }

        let folder = self.inner.storage_manager.storage_path(&storage);
        fs::create_dir_all(&folder)?;
        self.inner.indexing.prepare()?;

        *self.inner.storage.write() = Some(storage.clone());
        self.inner.set_state(WriterState::Writing);
        self.write_non_default_data_object(&storage, STORAGE_INFO_FILE)?;

        info!(
            target: "perfstore::writer",
            storage_id = %storage.id,
            name = %storage.name,
            folder = %folder.display(),
            "Storage prepared for writing"
        );
        Ok(())
    }

    /// Submit one record. The returned handle completes once the record is
    /// committed to its channel or the write failed.
    pub fn write(&self, mut record: Record, preferences: WritePreferences) -> WriteHandle {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = WriteHandle::new(id);
        if !preferences.write_invocation_affiliation {
            record.invocation_parent_ids.clear();
        }
        let task = Arc::new(WriteTask::new(id, record, preferences, handle.clone()));

        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.status.task_arrived();
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        if !self.is_writing() {
            task.fail(&self.inner, WriteError::WriterInactive);
            return handle;
        }

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        self.executor.spawn(move || {
            task.run(&inner);
            inner.queued.fetch_sub(1, Ordering::SeqCst);
        });
        handle
    }

    /// Run `records` through `chain`, then flush the chain
    pub fn process(&self, records: Vec<Record>, chain: &ProcessorChain) -> Vec<WriteHandle> {
        let mut handles = Vec::new();
        for mut record in records {
            handles.extend(chain.process(&mut record, self));
        }
        handles.extend(chain.flush(self));
        handles
    }

    /// `process` and wait until every resulting write is done
    pub fn process_synchronously(
        &self,
        records: Vec<Record>,
        chain: &ProcessorChain,
        timeout: Duration,
    ) -> WriteResult<Vec<WriteOutcome>> {
        let handles = self.process(records, chain);
        Self::wait_for(&handles, timeout)
    }

    /// Wait for the outcome of every handle, in order
    pub fn wait_for(handles: &[WriteHandle], timeout: Duration) -> WriteResult<Vec<WriteOutcome>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = Duration::from_millis(PROCESS_SYNC_POLL_MS);
        let mut outcomes = Vec::with_capacity(handles.len());

        for (done, handle) in handles.iter().enumerate() {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if let Some(outcome) = handle.wait_timeout(poll.min(remaining)) {
                    outcomes.push(outcome);
                    break;
                }
                if remaining.is_zero() {
                    return Err(WriteError::Timeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                debug!(
                    target: "perfstore::writer",
                    done,
                    total = handles.len(),
                    "Waiting for pending writes"
                );
            }
        }
        Ok(outcomes)
    }

    /// Tasks submitted to the executor that did not run to the end yet
    pub fn queued_task_count(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Writes without an outcome yet
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Close the current status period
    pub fn check_writing_status(&self) -> WritingStatus {
        let status = self.inner.status.check();
        match status {
            WritingStatus::Good => {
                debug!(target: "perfstore::writer", %status, queued = self.queued_task_count(), "Writing status")
            }
            WritingStatus::Medium => {
                info!(target: "perfstore::writer", %status, queued = self.queued_task_count(), "Writing status")
            }
            WritingStatus::High | WritingStatus::Critical => {
                warn!(target: "perfstore::writer", %status, queued = self.queued_task_count(), "Writing status")
            }
        }
        status
    }

    pub fn writing_status(&self) -> WritingStatus {
        self.inner.status.current()
    }

    /// Write a metadata object into its own file of the storage folder,
    /// replacing an existing file. Does not touch the index.
    pub fn write_non_default_data_object<T>(&self, object: &T, file_name: &str) -> WriteResult<()>
    where
        T: Serialize + ?Sized,
    {
        let storage = self.inner.storage.read().clone().ok_or(WriteError::WriterInactive)?;
        let path = self.inner.storage_manager.storage_path(&storage).join(file_name);

        let result = self.write_object_file(object, &path);
        match &result {
            Ok(()) => debug!(target: "perfstore::writer", file = %path.display(), "Wrote storage metadata"),
            Err(e) => error!(target: "perfstore::writer", file = %path.display(), error = %e, "Metadata write failed"),
        }
        result
    }

    fn write_object_file<T>(&self, object: &T, path: &Path) -> WriteResult<()>
    where
        T: Serialize + ?Sized,
    {
        let mut serializer = self.inner.serializers.acquire()?;
        let folder = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "metadata path has no folder"))?;

        // Staged next to the target and renamed over it, so a failed
        // rewrite leaves the previous file in place.
        let mut staged = NamedTempFile::new_in(folder)?;
        {
            let mut out = BufWriter::new(staged.as_file_mut());
            serializer.serialize(object, &mut out)?;
            out.flush()?;
        }
        staged.as_file().sync_data()?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Stop accepting writes, wait up to `timeout` for pending ones, then
    /// persist the index and close every channel.
    pub fn close(&self, timeout: Duration) -> PerfStoreResult<StorageIndex> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.state() != WriterState::Writing {
            return Err(WriteError::WriterInactive.into());
        }
        self.inner.set_state(WriterState::Closing);

        let result = self.finalize(timeout);
        self.inner.set_state(WriterState::Closed);

        let snapshot = self.snapshot();
        info!(
            target: "perfstore::writer",
            committed = snapshot.committed,
            failed = snapshot.failed,
            bytes = snapshot.bytes_written,
            "Storage writer closed"
        );
        result
    }

    fn finalize(&self, timeout: Duration) -> PerfStoreResult<StorageIndex> {
        let deadline = Instant::now() + timeout;
        while self.in_flight_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let abandoned = self.in_flight_count();
        if abandoned > 0 {
            warn!(target: "perfstore::writer", abandoned, "Closing with writes still pending");
        }

        let index = self.inner.indexing.finish()?;
        self.write_non_default_data_object(&index, STORAGE_INDEX_FILE)?;
        self.inner.channels.finalize_all()?;
        Ok(index)
    }

    /// Stop without finalizing the index. Queued tasks fail as inactive and
    /// waiting serializer leases are interrupted.
    pub fn cancel(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        match self.state() {
            WriterState::Idle | WriterState::Closed => return,
            WriterState::Writing | WriterState::Closing => {}
        }
        self.inner.set_state(WriterState::Closed);
        self.inner.serializers.interrupt();
        if let Err(e) = self.inner.channels.finalize_all() {
            error!(target: "perfstore::writer", error = %e, "Closing channels of cancelled writer failed");
        }
        warn!(
            target: "perfstore::writer",
            queued = self.queued_task_count(),
            "Storage writer cancelled"
        );
    }

    pub fn snapshot(&self) -> WriterSnapshot {
        let stats = &self.inner.stats;
        WriterSnapshot {
            state: self.state(),
            submitted: stats.submitted.load(Ordering::Relaxed),
            committed: stats.committed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            bytes_written: stats.bytes_written.load(Ordering::Relaxed),
            queued: self.queued_task_count(),
            in_flight: self.in_flight_count(),
            status: self.writing_status(),
        }
    }
}

impl RecordWriter for StorageWriter {
    fn write(&self, record: Record, preferences: WritePreferences) -> WriteHandle {
        StorageWriter::write(self, record, preferences)
    }
}
