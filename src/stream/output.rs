// ----------------------------------------------------------------------------
// Pooled Output Stream
// ----------------------------------------------------------------------------
// Write-side mirror of the input stream. Serializers write into it, buffers
// are borrowed from the pool on demand, and `finish` flips every buffer so a
// channel manager can copy the readable bytes to disk.
// ----------------------------------------------------------------------------

use std::io;
use std::sync::Arc;

use crate::error::StreamError;
use crate::pool::{BufferPool, ByteBuffer};

pub struct PooledOutputStream {
    pool: Arc<BufferPool>,
    /// Filled buffers in write order
    buffers: Vec<ByteBuffer>,
    current: Option<ByteBuffer>,
    total_size: u64,
    finished: bool,
    closed: bool,
}

impl PooledOutputStream {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            buffers: Vec::new(),
            current: None,
            total_size: 0,
            finished: false,
            closed: false,
        }
    }

    /// Bytes written so far
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn writable_buffer(&mut self) -> io::Result<&mut ByteBuffer> {
        let full = self.current.as_ref().map_or(true, |b| !b.has_remaining());
        if full {
            if let Some(done) = self.current.take() {
                self.buffers.push(done);
            }
            let mut fresh = self.pool.acquire().map_err(StreamError::from)?;
            fresh.clear();
            self.current = Some(fresh);
        }
        self.current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no writable buffer"))
    }

    /// Stop writing and flip all buffers for reading
    pub fn finish(&mut self) {
        if self.finished || self.closed {
            return;
        }
        if let Some(last) = self.current.take() {
            self.buffers.push(last);
        }
        for buffer in &mut self.buffers {
            buffer.flip();
        }
        self.finished = true;
    }

    /// Filled buffers, readable after `finish`
    pub fn buffers(&self) -> &[ByteBuffer] {
        &self.buffers
    }

    /// Copy every readable byte into `out`
    pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<u64> {
        if !self.finished {
            return Err(io::Error::new(io::ErrorKind::Other, "output stream not finished"));
        }
        for buffer in &self.buffers {
            out.write_all(buffer.readable())?;
        }
        Ok(self.total_size)
    }

    /// Return every buffer to the pool. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(buffer) = self.current.take() {
            self.pool.release(buffer);
        }
        for buffer in self.buffers.drain(..) {
            self.pool.release(buffer);
        }
    }
}

impl io::Write for PooledOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed || self.finished {
            return Err(io::Error::from(StreamError::Closed));
        }
        let mut written = 0;
        while written < buf.len() {
            let buffer = match self.writable_buffer() {
                Ok(buffer) => buffer,
                Err(e) if written == 0 => return Err(e),
                Err(_) => break,
            };
            written += buffer.put_slice(&buf[written..]);
        }
        self.total_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledOutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn pool(max: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(8, max, 2, Duration::from_millis(1)))
    }

    #[test]
    fn test_spans_buffers_and_preserves_order() {
        let pool = pool(4);
        let mut stream = PooledOutputStream::new(Arc::clone(&pool));
        stream.write_all(b"0123456789abcdefXYZ").unwrap();
        assert_eq!(stream.total_size(), 19);

        stream.finish();
        assert_eq!(stream.buffers().len(), 3);
        let mut out = Vec::new();
        assert_eq!(stream.write_to(&mut out).unwrap(), 19);
        assert_eq!(out, b"0123456789abcdefXYZ");

        drop(stream);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_exhausted_pool_surfaces_as_io_error() {
        let pool = pool(1);
        let mut stream = PooledOutputStream::new(Arc::clone(&pool));
        let err = stream.write_all(&[0u8; 20]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);

        stream.close();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_write_after_finish_fails() {
        let pool = pool(2);
        let mut stream = PooledOutputStream::new(pool);
        stream.write_all(b"abc").unwrap();
        stream.finish();
        assert!(stream.write(b"d").is_err());
    }
}
