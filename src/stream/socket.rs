// ----------------------------------------------------------------------------
// Socket-backed Input Stream
// ----------------------------------------------------------------------------
// One stream per connection. Every request of known length is announced with
// `reset(len)`, which recycles the buffers of the previous request and starts
// a new producer, so a connection never allocates more than its buffer count.
// ----------------------------------------------------------------------------

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use super::input::{ByteSource, PooledInputStream, StreamState};
use super::StreamContext;
use crate::error::StreamResult;
use crate::pool::ByteBuffer;

/// Byte source reading sequentially from a TCP connection
pub struct SocketSource {
    socket: TcpStream,
    max_timeouts: u32,
}

impl SocketSource {
    /// Reads block for at most `poll_interval` and give up after
    /// `max_timeouts` consecutive timeouts.
    pub fn new(socket: TcpStream, poll_interval: Duration, max_timeouts: u32) -> io::Result<Self> {
        let timeout = if poll_interval.is_zero() {
            Duration::from_millis(1)
        } else {
            poll_interval
        };
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self {
            socket,
            max_timeouts: max_timeouts.max(1),
        })
    }
}

impl ByteSource for SocketSource {
    fn fill(&self, buffer: &mut ByteBuffer, _offset: u64, max: usize) -> io::Result<usize> {
        let n = max.min(buffer.remaining());
        let mut timeouts = 0;
        loop {
            match (&self.socket).read(&mut buffer.writable_mut()[..n]) {
                Ok(read) => {
                    buffer.advance(read);
                    return Ok(read);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    timeouts += 1;
                    if timeouts >= self.max_timeouts {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "socket read timed out"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Read);
    }
}

/// Pooled input stream reading from one connection
pub struct SocketInputStream {
    inner: PooledInputStream,
}

impl SocketInputStream {
    pub fn new(ctx: &StreamContext, socket: TcpStream) -> io::Result<Self> {
        let source = SocketSource::new(socket, ctx.settings.poll_interval, ctx.settings.max_buffer_tries)?;
        Ok(Self {
            inner: PooledInputStream::new(ctx, Arc::new(source)),
        })
    }

    /// Start reading a request of `length` bytes. The first call borrows the
    /// stream's buffers; later calls recycle them.
    pub fn reset(&mut self, length: u64) -> StreamResult<()> {
        self.inner.restart(length)
    }

    pub fn bytes_left(&self) -> u64 {
        self.inner.bytes_left()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn is_read_failed(&self) -> bool {
        self.inner.is_read_failed()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Read for SocketInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
