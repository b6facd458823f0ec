//! A small FIFO byte accumulator for partially-received handshake and frame
//! data, grounded in tungstenite's `input_buffer.rs` (`InputBuffer`), built
//! on the same `bytes` crate this workspace already depends on for framing.

use bytes::{Buf, BytesMut};
use std::io::{self, Read};

/// Default read chunk size for a single non-blocking `read()` call.
pub const READ_CHUNK: usize = 8 * 1024;

/// Accumulates bytes read off a socket until the connection's state machine
/// has consumed a complete handshake request or frame out of the front.
#[derive(Debug, Default)]
pub struct IngressBuffer {
    inner: BytesMut,
}

impl IngressBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self { inner: BytesMut::new() }
    }

    /// Read once from `stream` into the buffer (a single bounded `read()`
    /// call); looping this until `WouldBlock` — required because `mio`'s
    /// epoll backend is edge-triggered — is the caller's job, see
    /// [`crate::connection::Connection::recv`].
    pub fn read_from<S: Read>(&mut self, stream: &mut S) -> io::Result<usize> {
        let start = self.inner.len();
        self.inner.resize(start + READ_CHUNK, 0);
        match stream.read(&mut self.inner[start..]) {
            Ok(n) => {
                self.inner.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.inner.truncate(start);
                Err(e)
            }
        }
    }

    /// The unconsumed bytes currently buffered.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Drop the first `n` bytes, which the caller has already parsed.
    pub fn consume(&mut self, n: usize) {
        self.inner.advance(n);
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there is nothing buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_from_accumulates_and_consume_drains_front() {
        let mut src = Cursor::new(b"hello world".to_vec());
        let mut buf = IngressBuffer::new();
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, 11);
        assert_eq!(buf.as_slice(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn multiple_reads_append() {
        let mut buf = IngressBuffer::new();
        let mut first = Cursor::new(b"abc".to_vec());
        let mut second = Cursor::new(b"def".to_vec());
        buf.read_from(&mut first).unwrap();
        buf.read_from(&mut second).unwrap();
        assert_eq!(buf.as_slice(), b"abcdef");
    }
}
