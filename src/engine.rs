// ============================================================================
// ENGINE
// ============================================================================
// Wires the buffer pool, pooled streams, storage writer, processor chain,
// live aggregation and agent listener behind one lifecycle:
//
//   new → start → (submit | listener) → shutdown
//
// `run` drives the periodic writing status check until a shutdown signal.
// ============================================================================

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::aggregation::{LiveAggregator, LiveSnapshot, SweeperHandle};
use crate::config::{AggregationConfig, StoreConfig};
use crate::error::{PerfStoreError, PerfStoreResult, WriteResult};
use crate::ingest::{AgentListener, IngestSnapshot, IngestionService, SubmitOutcome};
use crate::logging::OpTimer;
use crate::persistence::{InMemoryPersistenceStore, PersistenceSnapshot};
use crate::pool::{BufferPool, BufferPoolSnapshot};
use crate::processor::{
    AgentFilterProcessor, ChartingProcessor, DataAggregatorProcessor, DataSaverProcessor, InvocationClonerProcessor,
    InvocationExtractorProcessor, ProcessorChain, RecordProcessor, SqlExclusiveTimeProcessor, TimeFrameProcessor,
};
use crate::record::{Record, RecordType};
use crate::storage::{
    ChannelSnapshot, DiskStorageManager, SerializerPool, StorageData, StorageIndex, StorageIndexingTreeHandler,
    StorageWriter, WriteOutcome, WriterComponents, WriterSnapshot, WritingChannelManager,
};
use crate::stream::{StreamContext, StreamSettings};
use crate::STORE_VERSION;

/// Record types that aggregate on the storage path
const AGGREGATED_TYPES: [RecordType; 3] = [RecordType::Timer, RecordType::HttpTimer, RecordType::SqlStatement];

/// Record types always written as they arrive
const VERBATIM_TYPES: [RecordType; 2] = [RecordType::Jmx, RecordType::Exception];

// ----------------------------------------------------------------------------
// Chain Filters
// ----------------------------------------------------------------------------

/// Optional restrictions wrapped around the whole storage chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainFilters {
    /// Keep records of these agents only
    pub platforms: Option<Vec<i64>>,
    /// Keep records with a timestamp in `[from, to]`
    pub time_frame: Option<(i64, i64)>,
}

/// Build the storage processor chain.
///
/// Order: SQL exclusive time, invocation extraction and cloning, then the
/// timer-like stages (aggregating or saving), verbatim saving, charting.
/// Measurements extracted from invocations run through the same timer-like
/// stage instances.
pub fn build_storage_chain(
    aggregation: &AggregationConfig,
    live: Option<Arc<LiveAggregator>>,
    filters: &ChainFilters,
) -> ProcessorChain {
    let exclusive: Arc<dyn RecordProcessor> = Arc::new(SqlExclusiveTimeProcessor);

    let mut measurements: Vec<Arc<dyn RecordProcessor>> = Vec::new();
    if aggregation.enabled {
        for record_type in AGGREGATED_TYPES {
            if let Some(stage) = DataAggregatorProcessor::for_type(
                record_type,
                aggregation.aggregation_period_millis,
                aggregation.max_elements,
            ) {
                measurements.push(Arc::new(stage));
            }
        }
    } else {
        measurements.push(Arc::new(DataSaverProcessor::new(AGGREGATED_TYPES)));
    }
    let charting: Option<Arc<dyn RecordProcessor>> =
        live.map(|live| Arc::new(ChartingProcessor::new(live)) as Arc<dyn RecordProcessor>);

    let mut extracted = ProcessorChain::default().with(Arc::clone(&exclusive));
    for stage in &measurements {
        extracted.push(Arc::clone(stage));
    }
    if let Some(stage) = &charting {
        extracted.push(Arc::clone(stage));
    }

    let mut chain = ProcessorChain::default()
        .with(exclusive)
        .with(Arc::new(InvocationExtractorProcessor::new(extracted)))
        .with(Arc::new(InvocationClonerProcessor));
    for stage in measurements {
        chain.push(stage);
    }
    chain.push(Arc::new(DataSaverProcessor::new(VERBATIM_TYPES)));
    if let Some(stage) = charting {
        chain.push(stage);
    }

    if let Some((from, to)) = filters.time_frame {
        chain = ProcessorChain::new(vec![Arc::new(TimeFrameProcessor::new(from, to, chain))]);
    }
    if let Some(platforms) = &filters.platforms {
        chain = ProcessorChain::new(vec![Arc::new(AgentFilterProcessor::new(platforms.iter().copied(), chain))]);
    }
    chain
}

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

/// The storage engine
pub struct Engine {
    config: StoreConfig,
    pool: Arc<BufferPool>,
    stream_ctx: StreamContext,
    listener_ctx: StreamContext,
    channels: Arc<WritingChannelManager>,
    writer: StorageWriter,
    ingestion: Arc<IngestionService>,
    live: Option<Arc<LiveAggregator>>,
    persistence: Arc<InMemoryPersistenceStore>,
    sweeper: Mutex<Option<SweeperHandle>>,
    listener: Mutex<Option<AgentListener>>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    closed: AtomicBool,
    start_time: Instant,
}

impl Engine {
    /// Create an engine and open a fresh storage for writing
    pub fn new(config: StoreConfig) -> PerfStoreResult<Self> {
        Self::with_filters(config, ChainFilters::default())
    }

    pub fn with_filters(config: StoreConfig, filters: ChainFilters) -> PerfStoreResult<Self> {
        config.validate()?;

        let pool = Arc::new(BufferPool::from_config(&config.buffers));
        // Channel writes and disk reads share one pool; socket producers get
        // their own so stalled agents cannot hold up committed writes.
        let io_pool = build_io_pool("perfstore-io", config.storage.io_threads)?;
        let producer_pool = build_io_pool("perfstore-producer", config.streams.producer_threads)?;
        let settings = StreamSettings::from_config(&config.streams);
        let stream_ctx = StreamContext::new(Arc::clone(&pool), Arc::clone(&io_pool), settings);
        let listener_ctx = StreamContext::new(Arc::clone(&pool), producer_pool, settings);

        let shutdown_timeout = Duration::from_secs(config.general.shutdown_timeout_secs);
        let channels = Arc::new(WritingChannelManager::new(Arc::clone(&io_pool), shutdown_timeout));
        let writer = StorageWriter::new(
            WriterComponents {
                storage_manager: Arc::new(DiskStorageManager::from_config(&config.storage)),
                indexing: Arc::new(StorageIndexingTreeHandler::new()),
                channels: channels.clone(),
                serializers: SerializerPool::new(
                    config.storage.write_threads,
                    config.ingest.max_record_size,
                    config.storage.serializer_wait(),
                ),
                pool: Arc::clone(&pool),
            },
            config.storage.write_threads,
        )?;
        writer.prepare_for_write(StorageData::new(config.general.instance_name.as_str()))?;

        let persistence = Arc::new(InMemoryPersistenceStore::new());
        let live = config
            .live_aggregation
            .enabled
            .then(|| Arc::new(LiveAggregator::from_config(&config.live_aggregation, persistence.clone())));

        let chain = build_storage_chain(&config.aggregation, live.clone(), &filters);
        debug!(target: "perfstore::engine", stages = ?chain.names(), "Storage chain built");
        let ingestion = Arc::new(IngestionService::new(writer.clone(), chain));

        Ok(Self {
            config,
            pool,
            stream_ctx,
            listener_ctx,
            channels,
            writer,
            ingestion,
            live,
            persistence,
            sweeper: Mutex::new(None),
            listener: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn writer(&self) -> &StorageWriter {
        &self.writer
    }

    /// Context of disk-backed streams, sharing the storage IO pool
    pub fn stream_context(&self) -> &StreamContext {
        &self.stream_ctx
    }

    /// Context of agent connection streams, with its own producer pool
    pub fn listener_context(&self) -> &StreamContext {
        &self.listener_ctx
    }

    pub fn persistence(&self) -> &Arc<InMemoryPersistenceStore> {
        &self.persistence
    }

    /// Folder of the storage being written
    pub fn storage_folder(&self) -> Option<std::path::PathBuf> {
        self.writer
            .storage()
            .map(|storage| self.config.storage.storage_dir.join(storage.id.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start background work: the live aggregation sweeper
    pub fn start(&self) -> PerfStoreResult<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(PerfStoreError::ShuttingDown);
        }
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }

        if let Some(live) = &self.live {
            let handle = live.start_sweeper(self.config.live_aggregation.sweep_interval())?;
            *self.sweeper.lock() = Some(handle);
        }

        info!(
            target: "perfstore::engine",
            version = STORE_VERSION,
            instance = %self.config.general.instance_name,
            storage = ?self.storage_folder(),
            aggregation = self.config.aggregation.enabled,
            live_aggregation = self.live.is_some(),
            "Engine started"
        );
        Ok(())
    }

    /// Accept agent connections on the configured address
    pub fn start_listener(&self) -> PerfStoreResult<SocketAddr> {
        let mut slot = self.listener.lock();
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.local_addr());
        }
        let listener = AgentListener::start(
            &self.config.ingest.listen_address,
            Arc::clone(&self.ingestion),
            self.listener_ctx.clone(),
            self.config.ingest.max_record_size,
        )?;
        let address = listener.local_addr();
        *slot = Some(listener);
        Ok(address)
    }

    pub fn submit(&self, record: Record) -> SubmitOutcome {
        self.ingestion.submit(record)
    }

    /// Flush buffered aggregates into the writer
    pub fn flush(&self) -> usize {
        self.ingestion.flush()
    }

    /// Run a batch through the chain, flush it and wait for every write
    pub fn process_batch(&self, records: Vec<Record>, timeout: Duration) -> WriteResult<Vec<WriteOutcome>> {
        self.writer.process_synchronously(records, self.ingestion.chain(), timeout)
    }

    /// Drive the engine until a shutdown is triggered or the process is
    /// signalled, then shut down.
    pub async fn run(self: Arc<Self>) -> PerfStoreResult<Option<StorageIndex>> {
        self.start()?;

        let mut status_check = interval(Duration::from_secs(
            self.config.storage.status_check_interval_secs.max(1),
        ));
        let ctrl_c = tokio::signal::ctrl_c();
        let terminate = terminate_signal();
        tokio::pin!(ctrl_c, terminate);

        info!(target: "perfstore::engine", "Engine running, entering main loop");
        loop {
            tokio::select! {
                _ = status_check.tick() => {
                    self.writer.check_writing_status();
                }
                _ = self.shutdown.notified() => {
                    info!(target: "perfstore::engine", "Shutdown notification received");
                    break;
                }
                _ = &mut ctrl_c => {
                    info!(target: "perfstore::engine", "Received SIGINT");
                    break;
                }
                _ = &mut terminate => {
                    info!(target: "perfstore::engine", "Received SIGTERM");
                    break;
                }
            }
        }

        let engine = Arc::clone(&self);
        tokio::task::spawn_blocking(move || engine.shutdown())
            .await
            .map_err(|e| PerfStoreError::Internal(format!("shutdown task failed: {e}")))?
    }

    /// Ask a running `run` loop to stop
    pub fn trigger_shutdown(&self) {
        info!(target: "perfstore::engine", "Shutdown requested");
        self.shutdown.notify_one();
    }

    /// Stop intake, flush every buffered aggregate and close the storage.
    /// Returns the storage index on the first call, `None` afterwards.
    pub fn shutdown(&self) -> PerfStoreResult<Option<StorageIndex>> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(None);
        }
        self.running.store(false, AtomicOrdering::Release);
        info!(target: "perfstore::engine", "Starting graceful shutdown");
        let timer = OpTimer::with_threshold("engine_shutdown", self.config.general.shutdown_timeout_secs * 1_000);

        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        let flushed = self.ingestion.stop();
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        } else if let Some(live) = &self.live {
            live.sweep();
        }

        let index = self
            .writer
            .close(Duration::from_secs(self.config.general.shutdown_timeout_secs))?;

        let elapsed_ms = timer.stop();
        info!(
            target: "perfstore::engine",
            flushed,
            indexed = index.len(),
            persisted = self.persistence.len(),
            duration_ms = elapsed_ms,
            "Engine shutdown complete"
        );
        Ok(Some(index))
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime: self.uptime(),
            is_running: self.is_running(),
            pool: self.pool.snapshot(),
            channels: self.channels.snapshot(),
            writer: self.writer.snapshot(),
            ingest: self.ingestion.snapshot(),
            live: self.live.as_ref().map(|live| live.snapshot()),
            persistence: self.persistence.snapshot(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.load(AtomicOrdering::Acquire) {
            warn!(target: "perfstore::engine", "Engine dropped without shutdown, cancelling writer");
            self.writer.cancel();
        }
    }
}

fn build_io_pool(name: &'static str, threads: usize) -> PerfStoreResult<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{name}-{i}"))
        .panic_handler(move |_| error!(target: "perfstore::engine", pool = name, "IO job panicked"))
        .build()
        .map(Arc::new)
        .map_err(|e| PerfStoreError::Internal(format!("failed to build {name} executor: {e}")))
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(target: "perfstore::engine", error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub uptime: Duration,
    pub is_running: bool,
    pub pool: BufferPoolSnapshot,
    pub channels: ChannelSnapshot,
    pub writer: WriterSnapshot,
    pub ingest: IngestSnapshot,
    pub live: Option<LiveSnapshot>,
    pub persistence: PersistenceSnapshot,
}
