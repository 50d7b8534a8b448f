// ============================================================================
// INGESTION
// ============================================================================
// Entry point for agent records. `IngestionService::submit` runs a record
// through the storage processor chain; `AgentListener` accepts agent
// connections and decodes length-prefixed record frames from them.
//
// Frame layout: u32 big-endian payload length, then the bincode-encoded
// record. One socket-backed pooled stream is reused for every frame of a
// connection.
// ============================================================================

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{IngestError, PerfStoreResult};
use crate::processor::ProcessorChain;
use crate::record::Record;
use crate::storage::{RecordSerializer, StorageWriter};
use crate::stream::{SocketInputStream, StreamContext};
use crate::FRAME_HEADER_SIZE;

/// Pause of the accept loop while no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ----------------------------------------------------------------------------
// Ingestion Service
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

#[derive(Debug, Default)]
struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    writes: AtomicU64,
    frames: AtomicU64,
    decode_failures: AtomicU64,
    connections: AtomicU64,
}

/// Point-in-time ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    /// Write tasks issued by the chain
    pub writes: u64,
    pub frames: u64,
    pub decode_failures: u64,
    pub connections: u64,
}

pub struct IngestionService {
    writer: StorageWriter,
    chain: ProcessorChain,
    stopped: AtomicBool,
    stats: IngestStats,
}

impl IngestionService {
    pub fn new(writer: StorageWriter, chain: ProcessorChain) -> Self {
        Self {
            writer,
            chain,
            stopped: AtomicBool::new(false),
            stats: IngestStats::default(),
        }
    }

    pub fn writer(&self) -> &StorageWriter {
        &self.writer
    }

    pub fn chain(&self) -> &ProcessorChain {
        &self.chain
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run one record through the chain. Rejected once the service stopped
    /// or while the writer does not accept writes.
    pub fn submit(&self, mut record: Record) -> SubmitOutcome {
        if self.is_stopped() || !self.writer.is_writing() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(target: "perfstore::ingest", record_id = record.id, "Record rejected");
            return SubmitOutcome::Rejected;
        }

        let handles = self.chain.process(&mut record, &self.writer);
        self.stats.writes.fetch_add(handles.len() as u64, Ordering::Relaxed);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Accepted
    }

    /// Release everything the chain buffers. Returns the writes issued.
    pub fn flush(&self) -> usize {
        let handles = self.chain.flush(&self.writer);
        self.stats.writes.fetch_add(handles.len() as u64, Ordering::Relaxed);
        debug!(target: "perfstore::ingest", writes = handles.len(), "Processor chain flushed");
        handles.len()
    }

    /// Refuse further records and flush the chain once
    pub fn stop(&self) -> usize {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.flush()
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            frames: self.stats.frames.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            connections: self.stats.connections.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Framing
// ----------------------------------------------------------------------------

/// Encode `record` as one agent frame
pub fn encode_frame(record: &Record, serializer: &mut RecordSerializer) -> PerfStoreResult<Vec<u8>> {
    let payload = serializer.to_vec(record)?;
    let len = u32::try_from(payload.len()).map_err(|_| IngestError::FrameTooLarge {
        size: payload.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read the next frame. A decode failure leaves the stream positioned at
/// the start of the following frame.
fn read_frame(
    stream: &mut SocketInputStream,
    serializer: &RecordSerializer,
    max_record_size: u64,
) -> Result<Record, IngestError> {
    stream.reset(FRAME_HEADER_SIZE)?;
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    stream.read_exact(&mut header)?;

    let size = u32::from_be_bytes(header) as u64;
    if size > max_record_size {
        return Err(IngestError::FrameTooLarge {
            size,
            max: max_record_size,
        });
    }

    stream.reset(size)?;
    let decoded = serializer.deserialize::<Record, _>(&mut *stream);
    if stream.is_read_failed() {
        return Err(IngestError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection failed mid-frame",
        )));
    }

    let leftover = stream.bytes_left();
    if leftover > 0 {
        io::copy(stream, &mut io::sink())?;
    }
    match decoded {
        Ok(_) if leftover > 0 => Err(IngestError::Decode {
            message: format!("{leftover} trailing bytes in frame"),
        }),
        Ok(record) => Ok(record),
        Err(e) => Err(IngestError::Decode { message: e.to_string() }),
    }
}

// ----------------------------------------------------------------------------
// Agent Listener
// ----------------------------------------------------------------------------

/// TCP listener feeding agent frames into an `IngestionService`
pub struct AgentListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AgentListener {
    /// Bind `address` and start accepting connections
    pub fn start(
        address: &str,
        service: Arc<IngestionService>,
        ctx: StreamContext,
        max_record_size: u64,
    ) -> PerfStoreResult<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            std::thread::Builder::new()
                .name("perfstore-acceptor".into())
                .spawn(move || {
                    accept_loop(listener, service, ctx, max_record_size, shutdown, connections)
                })?
        };

        info!(target: "perfstore::ingest", address = %local_addr, "Agent listener started");
        Ok(Self {
            local_addr,
            shutdown,
            acceptor: Some(acceptor),
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop accepting and wait for every connection thread to end
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
            let handles: Vec<JoinHandle<()>> = self.connections.lock().drain(..).collect();
            for handle in handles {
                let _ = handle.join();
            }
            info!(target: "perfstore::ingest", address = %self.local_addr, "Agent listener stopped");
        }
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    service: Arc<IngestionService>,
    ctx: StreamContext,
    max_record_size: u64,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((socket, peer)) => {
                service.stats.connections.fetch_add(1, Ordering::Relaxed);
                let service = Arc::clone(&service);
                let ctx = ctx.clone();
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name(format!("perfstore-agent-{peer}"))
                    .spawn(move || serve_connection(socket, peer, &service, &ctx, max_record_size, &shutdown));
                match spawned {
                    Ok(handle) => {
                        let mut connections = connections.lock();
                        connections.retain(|h| !h.is_finished());
                        connections.push(handle);
                    }
                    Err(e) => warn!(target: "perfstore::ingest", peer = %peer, error = %e, "Failed to spawn connection thread"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                warn!(target: "perfstore::ingest", error = %e, "Accept failed");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    service: &IngestionService,
    ctx: &StreamContext,
    max_record_size: u64,
    shutdown: &AtomicBool,
) {
    debug!(target: "perfstore::ingest", peer = %peer, "Agent connected");
    match read_frames(socket, service, ctx, max_record_size, shutdown) {
        Ok(frames) => debug!(target: "perfstore::ingest", peer = %peer, frames, "Agent disconnected"),
        Err(e) => warn!(
            target: "perfstore::ingest",
            peer = %peer,
            error = %e,
            hint = ?e.recovery_hint(),
            "Agent connection closed on error"
        ),
    }
}

fn read_frames(
    socket: TcpStream,
    service: &IngestionService,
    ctx: &StreamContext,
    max_record_size: u64,
    shutdown: &AtomicBool,
) -> Result<u64, IngestError> {
    socket.set_nonblocking(false)?;
    let peer = socket.try_clone()?;
    let mut stream = SocketInputStream::new(ctx, socket)?;
    let serializer = RecordSerializer::new(max_record_size);

    let mut frames = 0;
    let result = loop {
        match wait_for_frame(&peer, shutdown) {
            Ok(true) => {}
            Ok(false) => break Ok(frames),
            Err(e) => break Err(e.into()),
        }

        match read_frame(&mut stream, &serializer, max_record_size) {
            Ok(record) => {
                frames += 1;
                service.stats.frames.fetch_add(1, Ordering::Relaxed);
                service.submit(record);
            }
            Err(e @ IngestError::Decode { .. }) => {
                service.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(target: "perfstore::ingest", error = %e, "Skipping undecodable frame");
            }
            Err(e) => break Err(e),
        }
    };
    stream.close();
    result
}

/// Block until the next frame starts arriving. False when the peer closed
/// the connection or the listener shuts down.
fn wait_for_frame(peer: &TcpStream, shutdown: &AtomicBool) -> io::Result<bool> {
    let mut byte = [0u8; 1];
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }
        match peer.peek(&mut byte) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordIdent;
    use crate::stream::test_support::{context, fast_settings};
    use std::io::Write;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_frame_layout() {
        let mut serializer = RecordSerializer::new(1 << 20);
        let record = Record::timer(1, RecordIdent::new(1, 2, 3), 0, 1.0);
        let frame = encode_frame(&record, &mut serializer).unwrap();

        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded: Record = serializer.deserialize(&frame[4..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_reads_consecutive_frames_from_one_stream() {
        let (mut client, server) = connected_pair();
        let ctx = context(16, 8, fast_settings(2));
        let mut stream = SocketInputStream::new(&ctx, server).unwrap();
        let mut serializer = RecordSerializer::new(1 << 20);

        let ident = RecordIdent::new(1, 2, 3);
        let sent: Vec<Record> = (0..3).map(|i| Record::sql(i, ident, i, 1.0, "select * from orders", true)).collect();
        for record in &sent {
            client.write_all(&encode_frame(record, &mut serializer).unwrap()).unwrap();
        }

        let received: Vec<Record> = (0..3)
            .map(|_| read_frame(&mut stream, &serializer, 1 << 20).unwrap())
            .collect();
        assert_eq!(received, sent);

        stream.close();
        assert_eq!(ctx.pool.available(), 8);
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let (mut client, server) = connected_pair();
        let ctx = context(16, 8, fast_settings(2));
        let mut stream = SocketInputStream::new(&ctx, server).unwrap();

        client.write_all(&1_000u32.to_be_bytes()).unwrap();
        let err = read_frame(&mut stream, &RecordSerializer::new(1 << 20), 100).unwrap_err();
        assert!(matches!(err, IngestError::FrameTooLarge { size: 1_000, max: 100 }));
    }

    #[test]
    fn test_garbage_frame_is_skipped() {
        let (mut client, server) = connected_pair();
        let ctx = context(16, 8, fast_settings(2));
        let mut stream = SocketInputStream::new(&ctx, server).unwrap();
        let mut serializer = RecordSerializer::new(1 << 20);

        client.write_all(&3u32.to_be_bytes()).unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).unwrap();
        let record = Record::timer(9, RecordIdent::new(1, 1, 1), 0, 2.0);
        client.write_all(&encode_frame(&record, &mut serializer).unwrap()).unwrap();

        assert!(matches!(
            read_frame(&mut stream, &serializer, 1 << 20),
            Err(IngestError::Decode { .. })
        ));
        assert_eq!(read_frame(&mut stream, &serializer, 1 << 20).unwrap(), record);
    }
}
