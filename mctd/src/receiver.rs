//! Per-connection receive buffer with partial-frame retention.
//!
//! Reader tasks append raw bytes as they arrive and repeatedly hand the
//! buffered span to a frame parser; whatever the parser does not consume
//! stays buffered for the next read.

use bytes::{Buf, BytesMut};

/// Default buffer capacity, sized for the largest wire message plus headers.
pub const RECEIVE_BUFFER_SIZE: usize = 65535 + 64;

#[derive(Debug)]
pub struct Receiver {
    buf: BytesMut,
    limit: usize,
}

impl Receiver {
    pub fn new(limit: usize) -> Self {
        Receiver {
            buf: BytesMut::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// Bytes currently buffered.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the buffer limit; a peer that fills the buffer
    /// without ever producing a parseable frame is misbehaving.
    pub fn remaining_capacity(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Append received bytes, bounded by the limit. Returns false when the
    /// bytes do not fit (caller should drop the connection).
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining_capacity() {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Copy out `len` bytes at `offset` if available.
    pub fn peek(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.buf.get(offset..offset + len)
    }

    /// Copy out and consume `len` bytes from the front.
    pub fn take(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.buf.len() < len {
            return None;
        }
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Some(out)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Receiver::new(RECEIVE_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_consume_keeps_tail() {
        let mut rx = Receiver::new(64);
        assert!(rx.append(b"hello world"));
        rx.consume(6);
        assert_eq!(rx.data(), b"world");
        assert!(rx.append(b"!"));
        assert_eq!(rx.data(), b"world!");
    }

    #[test]
    fn take_is_short_on_underrun() {
        let mut rx = Receiver::new(64);
        rx.append(b"abc");
        assert!(rx.take(4).is_none());
        assert_eq!(rx.take(3).unwrap(), b"abc");
        assert!(rx.is_empty());
    }

    #[test]
    fn limit_is_enforced() {
        let mut rx = Receiver::new(4);
        assert!(rx.append(b"abcd"));
        assert!(!rx.append(b"e"));
        rx.consume(2);
        assert!(rx.append(b"ef"));
        assert_eq!(rx.data(), b"cdef");
    }
}
