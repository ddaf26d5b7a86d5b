//! # Buffer
//!
//! Exclusively-locked growable byte store backing a connection's receive and
//! send sides. Every operation holds the lock for the duration of the call, so
//! packet formats only ever see bounded reads and peeks, never the storage.

use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Initial capacity reserved for each buffer
const DEFAULT_BUFFER_CAPACITY: usize = 4096;

pub struct Buffer {
    inner: Mutex<BytesMut>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BytesMut::with_capacity(capacity)),
        }
    }

    // A poisoned buffer still holds consistent bytes; every mutation is a single call.
    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes at the tail.
    pub fn write(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    /// Remove and return up to `len` bytes from the head.
    pub fn read(&self, len: usize) -> Bytes {
        let mut inner = self.lock();
        let n = len.min(inner.len());
        inner.split_to(n).freeze()
    }

    /// Copy up to `len` bytes from the head without consuming them.
    pub fn peek(&self, len: usize) -> Bytes {
        let inner = self.lock();
        let n = len.min(inner.len());
        Bytes::copy_from_slice(&inner[..n])
    }

    /// Drop up to `len` bytes from the head, returning how many were dropped.
    pub fn advance(&self, len: usize) -> usize {
        let mut inner = self.lock();
        let n = len.min(inner.len());
        let _ = inner.split_to(n);
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard all buffered bytes.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_is_bounded() {
        let buf = Buffer::new();
        buf.write(b"hello world");

        assert_eq!(&buf.read(5)[..], b"hello");
        assert_eq!(buf.len(), 6);
        assert_eq!(&buf.read(100)[..], b" world");
        assert!(buf.is_empty());
        assert!(buf.read(4).is_empty());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let buf = Buffer::new();
        buf.write(&[1, 2, 3]);

        assert_eq!(&buf.peek(2)[..], &[1, 2]);
        assert_eq!(&buf.peek(10)[..], &[1, 2, 3]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_advance_and_reset() {
        let buf = Buffer::new();
        buf.write(&[9; 10]);

        assert_eq!(buf.advance(4), 4);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.advance(50), 6);

        buf.write(&[1, 2]);
        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_grows_past_capacity() {
        let buf = Buffer::with_capacity(4);
        buf.write(&vec![7u8; 10_000]);
        assert_eq!(buf.len(), 10_000);
    }
}
