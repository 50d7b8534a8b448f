// ----------------------------------------------------------------------------
// Disk-backed Input Stream
// ----------------------------------------------------------------------------
// Reads a list of (channel, position, size) descriptors back as one
// contiguous byte stream. Each channel file is opened once; buffers never
// span two descriptors.
// ----------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::input::{ByteSource, PooledInputStream};
use super::StreamContext;
use crate::error::StreamResult;
use crate::pool::ByteBuffer;

/// Numeric id of a channel file inside a storage
pub type ChannelId = u32;

/// Location of one written record inside a channel file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub channel_id: ChannelId,
    pub position: u64,
    pub size: u64,
}

impl StorageDescriptor {
    pub fn new(channel_id: ChannelId, position: u64, size: u64) -> Self {
        Self {
            channel_id,
            position,
            size,
        }
    }
}

struct Segment {
    /// Offset of the segment inside the stream
    start: u64,
    file: Arc<File>,
    position: u64,
    size: u64,
}

/// Byte source over descriptors of one or more channel files
pub struct DiskSource {
    segments: Vec<Segment>,
    total_size: u64,
}

impl DiskSource {
    /// Open the channel files referenced by `descriptors`.
    pub fn open<F>(descriptors: &[StorageDescriptor], resolve_path: F) -> io::Result<Self>
    where
        F: Fn(ChannelId) -> PathBuf,
    {
        let mut files: HashMap<ChannelId, Arc<File>> = HashMap::new();
        let mut segments = Vec::with_capacity(descriptors.len());
        let mut start = 0u64;

        for descriptor in descriptors.iter().filter(|d| d.size > 0) {
            let file = match files.get(&descriptor.channel_id) {
                Some(file) => Arc::clone(file),
                None => {
                    let file = Arc::new(File::open(resolve_path(descriptor.channel_id))?);
                    files.insert(descriptor.channel_id, Arc::clone(&file));
                    file
                }
            };
            segments.push(Segment {
                start,
                file,
                position: descriptor.position,
                size: descriptor.size,
            });
            start += descriptor.size;
        }

        Ok(Self {
            segments,
            total_size: start,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn segment_at(&self, offset: u64) -> Option<&Segment> {
        let idx = self.segments.partition_point(|s| s.start + s.size <= offset);
        self.segments.get(idx)
    }
}

impl ByteSource for DiskSource {
    fn fill(&self, buffer: &mut ByteBuffer, offset: u64, max: usize) -> io::Result<usize> {
        let Some(segment) = self.segment_at(offset) else {
            return Ok(0);
        };
        let within = offset - segment.start;
        let n = (segment.size - within).min(max as u64).min(buffer.remaining() as u64) as usize;
        read_exact_at(&segment.file, &mut buffer.writable_mut()[..n], segment.position + within)?;
        buffer.advance(n);
        Ok(n)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], position: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, position)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut position: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, position)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                buf = &mut buf[n..];
                position += n as u64;
            }
        }
    }
    Ok(())
}

impl PooledInputStream {
    /// Open a prepared stream over the given descriptors.
    pub fn from_descriptors<F>(
        ctx: &StreamContext,
        descriptors: &[StorageDescriptor],
        resolve_path: F,
    ) -> StreamResult<Self>
    where
        F: Fn(ChannelId) -> PathBuf,
    {
        let source = DiskSource::open(descriptors, resolve_path)?;
        let total_size = source.total_size();
        let mut stream = PooledInputStream::new(ctx, Arc::new(source));
        stream.prepare(total_size)?;
        Ok(stream)
    }

    /// Open a prepared stream over a whole file.
    pub fn from_file(ctx: &StreamContext, path: &Path) -> StreamResult<Self> {
        let size = std::fs::metadata(path)?.len();
        let path = path.to_path_buf();
        Self::from_descriptors(ctx, &[StorageDescriptor::new(0, 0, size)], move |_| path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::{context, fast_settings};
    use std::io::Read;

    #[test]
    fn test_reads_descriptor_ranges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.chan"), b"AAAAhelloBBBB").unwrap();
        std::fs::write(dir.path().join("2.chan"), b"xx world!").unwrap();

        let ctx = context(4, 8, fast_settings(2));
        let descriptors = [
            StorageDescriptor::new(1, 4, 5),
            StorageDescriptor::new(2, 2, 7),
            StorageDescriptor::new(1, 0, 0),
        ];
        let root = dir.path().to_path_buf();
        let mut stream =
            PooledInputStream::from_descriptors(&ctx, &descriptors, |id| root.join(format!("{id}.chan"))).unwrap();

        assert_eq!(stream.total_size(), 12);
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world!");

        drop(stream);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while ctx.pool.available() != 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(ctx.pool.available(), 8);
    }

    #[test]
    fn test_missing_file_fails_on_open() {
        let ctx = context(4, 8, fast_settings(2));
        let result = PooledInputStream::from_descriptors(&ctx, &[StorageDescriptor::new(1, 0, 4)], |_| {
            PathBuf::from("/nonexistent/perfstore/1.chan")
        });
        assert!(result.is_err());
        assert_eq!(ctx.pool.available(), 8);
    }

    #[test]
    fn test_truncated_file_marks_stream_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.chan");
        std::fs::write(&path, b"short").unwrap();

        let ctx = context(16, 8, fast_settings(2));
        let mut stream =
            PooledInputStream::from_descriptors(&ctx, &[StorageDescriptor::new(1, 0, 64)], |_| path.clone()).unwrap();

        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).is_err());
        assert!(stream.is_read_failed());
    }
}
