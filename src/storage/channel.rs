// ----------------------------------------------------------------------------
// Channel Manager
// ----------------------------------------------------------------------------
// Appends finished output streams to channel files on the IO pool. The file
// position is reserved and the bytes are written under the channel's lock,
// so concurrent writes to one channel never interleave. A failed append is
// cut back off the file so the next write lands at the tracked position.
// ----------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::{debug, error, warn};

use crate::error::ChannelError;
use crate::stream::PooledOutputStream;

/// Invoked exactly once with `(position, size)` of the written bytes or the
/// failure
pub type WriteCompletion = Box<dyn FnOnce(Result<(u64, u64), ChannelError>) + Send>;

pub trait ChannelManager: Send + Sync {
    /// Submit an asynchronous append of `stream` to the file at `path`.
    ///
    /// On `Err` the completion is dropped without being called and the
    /// stream's buffers are back in the pool.
    fn write(&self, stream: PooledOutputStream, path: &Path, on_complete: WriteCompletion) -> Result<(), ChannelError>;

    /// Wait for submitted writes, sync and close every channel file
    fn finalize_all(&self) -> Result<(), ChannelError>;
}

/// Append target of a channel
trait ChannelSink: Write {
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn len(&self) -> io::Result<u64>;
}

impl ChannelSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

struct ChannelFile {
    file: File,
    position: u64,
    /// Set when a failed append could be neither cut off nor measured
    poisoned: bool,
}

/// Append `stream` at `*position`. On failure the partial bytes are
/// truncated away; if that fails too the position is re-read from the
/// sink, and if even that fails the channel is poisoned.
fn append_stream<S: ChannelSink>(
    sink: &mut S,
    position: &mut u64,
    poisoned: &mut bool,
    stream: &PooledOutputStream,
) -> io::Result<(u64, u64)> {
    if *poisoned {
        return Err(io::Error::other("channel position is unknown after a failed write"));
    }
    let start = *position;
    match stream.write_to(sink) {
        Ok(size) => {
            *position += size;
            Ok((start, size))
        }
        Err(e) => {
            let _ = sink.flush();
            if let Err(truncate_err) = sink.truncate(start) {
                warn!(target: "perfstore::channel", error = %truncate_err, "Could not cut back a failed append");
                match sink.len() {
                    Ok(len) => *position = len,
                    Err(len_err) => {
                        error!(target: "perfstore::channel", error = %len_err, "Channel poisoned");
                        *poisoned = true;
                    }
                }
            }
            Err(e)
        }
    }
}

/// Releases one pending slot when dropped, also on a panicking completion
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct ChannelStats {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time statistics of a channel manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub open_channels: usize,
    pub pending: usize,
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    pub bytes: u64,
}

/// Channel manager writing to local files on a rayon pool
pub struct WritingChannelManager {
    io_pool: Arc<ThreadPool>,
    files: DashMap<PathBuf, Arc<Mutex<ChannelFile>>>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    finalize_timeout: Duration,
    stats: Arc<ChannelStats>,
}

impl WritingChannelManager {
    pub fn new(io_pool: Arc<ThreadPool>, finalize_timeout: Duration) -> Self {
        Self {
            io_pool,
            files: DashMap::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            finalize_timeout,
            stats: Arc::new(ChannelStats::default()),
        }
    }

    fn channel(&self, path: &Path) -> Result<Arc<Mutex<ChannelFile>>, ChannelError> {
        if let Some(existing) = self.files.get(path) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self.files.entry(path.to_path_buf()).or_try_insert_with(|| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ChannelError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ChannelError::io(path, e))?;
            let position = file.metadata().map_err(|e| ChannelError::io(path, e))?.len();
            debug!(target: "perfstore::channel", path = %path.display(), position, "Opened channel");
            Ok::<_, ChannelError>(Arc::new(Mutex::new(ChannelFile {
                file,
                position,
                poisoned: false,
            })))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            open_channels: self.files.len(),
            pending: self.pending.load(Ordering::Acquire),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
        }
    }
}

impl ChannelManager for WritingChannelManager {
    fn write(&self, mut stream: PooledOutputStream, path: &Path, on_complete: WriteCompletion) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if !stream.is_finished() {
            return Err(ChannelError::Rejected {
                message: "output stream was not finished".into(),
            });
        }

        let channel = self.channel(path)?;
        let path = path.to_path_buf();
        let pending = Arc::clone(&self.pending);
        let stats = Arc::clone(&self.stats);

        pending.fetch_add(1, Ordering::AcqRel);
        stats.submitted.fetch_add(1, Ordering::Relaxed);

        self.io_pool.spawn(move || {
            let _pending = PendingGuard(pending);
            let result = {
                let mut guard = channel.lock();
                let ChannelFile {
                    file,
                    position,
                    poisoned,
                } = &mut *guard;
                append_stream(file, position, poisoned, &stream).map_err(|e| ChannelError::io(&path, e))
            };
            stream.close();

            match &result {
                Ok((_, size)) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                    stats.bytes.fetch_add(*size, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(target: "perfstore::channel", error = %e, "Channel write failed");
                }
            }
            on_complete(result);
        });
        Ok(())
    }

    fn finalize_all(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::Release);

        let deadline = Instant::now() + self.finalize_timeout;
        while self.pending.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    target: "perfstore::channel",
                    pending = self.pending.load(Ordering::Acquire),
                    "Closing channels with writes still pending"
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut first_error = None;
        let paths: Vec<PathBuf> = self.files.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            if let Some((path, channel)) = self.files.remove(&path) {
                let mut channel = channel.lock();
                let synced = channel.file.flush().and_then(|_| channel.file.sync_data());
                if let Err(e) = synced {
                    error!(target: "perfstore::channel", path = %path.display(), error = %e, "Channel sync failed");
                    first_error.get_or_insert(ChannelError::io(&path, e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crossbeam_channel::unbounded;

    fn io_pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn finished_stream(pool: &Arc<BufferPool>, bytes: &[u8]) -> PooledOutputStream {
        let mut stream = PooledOutputStream::new(Arc::clone(pool));
        stream.write_all(bytes).unwrap();
        stream.finish();
        stream
    }

    #[test]
    fn test_appends_and_reports_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage").join("1.chan");
        let pool = Arc::new(BufferPool::new(4, 8, 2, Duration::from_millis(1)));
        let manager = WritingChannelManager::new(io_pool(), Duration::from_secs(5));
        let (tx, rx) = unbounded();

        for payload in [&b"hello"[..], &b"world!"[..]] {
            let tx = tx.clone();
            manager
                .write(finished_stream(&pool, payload), &path, Box::new(move |r| tx.send(r).unwrap()))
                .unwrap();
            // one at a time so positions are deterministic
            let (position, size) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert_eq!(size, payload.len() as u64);
            assert_eq!(position, if size == 5 { 0 } else { 5 });
        }

        manager.finalize_all().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"helloworld!");
        assert_eq!(pool.available(), 8);
        assert_eq!(manager.snapshot().written, 2);
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.chan");
        let pool = Arc::new(BufferPool::new(3, 64, 50, Duration::from_millis(1)));
        let manager = WritingChannelManager::new(io_pool(), Duration::from_secs(5));
        let (tx, rx) = unbounded();

        for i in 0..20u8 {
            let tx = tx.clone();
            let payload = vec![b'a' + i; 7];
            manager
                .write(finished_stream(&pool, &payload), &path, Box::new(move |r| tx.send((i, r)).unwrap()))
                .unwrap();
        }
        manager.finalize_all().unwrap();

        let data = fs::read(&path).unwrap();
        for _ in 0..20 {
            let (i, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let (position, size) = result.unwrap();
            let chunk = &data[position as usize..(position + size) as usize];
            assert!(chunk.iter().all(|b| *b == b'a' + i));
        }
    }

    #[test]
    fn test_closed_manager_rejects_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(4, 4, 2, Duration::from_millis(1)));
        let manager = WritingChannelManager::new(io_pool(), Duration::from_secs(1));
        manager.finalize_all().unwrap();

        let result = manager.write(finished_stream(&pool, b"abc"), &dir.path().join("1.chan"), Box::new(|_| {
            panic!("completion must not run")
        }));
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_unfinished_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(4, 4, 2, Duration::from_millis(1)));
        let manager = WritingChannelManager::new(io_pool(), Duration::from_secs(1));
        let stream = PooledOutputStream::new(pool);

        let result = manager.write(stream, &dir.path().join("1.chan"), Box::new(|_| {}));
        assert!(matches!(result, Err(ChannelError::Rejected { .. })));
    }

    /// In-memory sink that fails once `fail_after` bytes went through
    struct FlakySink {
        data: Vec<u8>,
        fail_after: Option<usize>,
        truncatable: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = match self.fail_after {
                Some(0) => return Err(io::Error::other("no space left")),
                Some(left) => left.min(buf.len()),
                None => buf.len(),
            };
            self.data.extend_from_slice(&buf[..room]);
            if let Some(left) = self.fail_after.as_mut() {
                *left -= room;
            }
            Ok(room)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ChannelSink for FlakySink {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if !self.truncatable {
                return Err(io::Error::other("truncate unsupported"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn len(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }
    }

    #[test]
    fn test_partial_append_is_cut_back() {
        let pool = Arc::new(BufferPool::new(16, 32, 2, Duration::from_millis(1)));
        let mut sink = FlakySink {
            data: Vec::new(),
            fail_after: None,
            truncatable: true,
        };
        let (mut position, mut poisoned) = (0, false);

        let first = finished_stream(&pool, &[b'a'; 100]);
        assert_eq!(append_stream(&mut sink, &mut position, &mut poisoned, &first).unwrap(), (0, 100));

        sink.fail_after = Some(40);
        let second = finished_stream(&pool, &[b'b'; 80]);
        assert!(append_stream(&mut sink, &mut position, &mut poisoned, &second).is_err());
        assert_eq!(sink.data.len(), 100);
        assert_eq!(position, 100);

        sink.fail_after = None;
        let third = finished_stream(&pool, &[b'c'; 50]);
        let (at, size) = append_stream(&mut sink, &mut position, &mut poisoned, &third).unwrap();
        assert_eq!((at, size), (100, 50));
        assert!(sink.data[at as usize..(at + size) as usize].iter().all(|b| *b == b'c'));
    }

    #[test]
    fn test_failed_cut_back_resyncs_position() {
        let pool = Arc::new(BufferPool::new(16, 32, 2, Duration::from_millis(1)));
        let mut sink = FlakySink {
            data: vec![b'a'; 10],
            fail_after: Some(7),
            truncatable: false,
        };
        let (mut position, mut poisoned) = (10, false);

        let broken = finished_stream(&pool, &[b'b'; 30]);
        assert!(append_stream(&mut sink, &mut position, &mut poisoned, &broken).is_err());
        assert_eq!(position, 17);
        assert!(!poisoned);

        sink.fail_after = None;
        let next = finished_stream(&pool, b"xyz");
        let (at, size) = append_stream(&mut sink, &mut position, &mut poisoned, &next).unwrap();
        assert_eq!(&sink.data[at as usize..(at + size) as usize], b"xyz");
    }

    #[test]
    fn test_panicking_completion_does_not_stall_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(8, 8, 2, Duration::from_millis(1)));
        let io_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(1)
                .panic_handler(|_| {})
                .build()
                .unwrap(),
        );
        let manager = WritingChannelManager::new(io_pool, Duration::from_secs(10));

        manager
            .write(finished_stream(&pool, b"abc"), &dir.path().join("1.chan"), Box::new(|_| {
                panic!("completion failed")
            }))
            .unwrap();

        let started = Instant::now();
        manager.finalize_all().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.snapshot().pending, 0);
        assert_eq!(fs::read(dir.path().join("1.chan")).unwrap(), b"abc");
    }
}
