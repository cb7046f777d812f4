//! A fixed-capacity, pre-allocated byte buffer meant for aggressive reuse: one buffer holds
//!  one outgoing or incoming frame, and the send/receive paths rent and return them through
//!  the [`crate::buffers::buffer_pool::BufferPool`] instead of allocating per frame.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

/// A fixed-capacity dynamically allocated buffer. `len` tracks the initialized prefix that
///  `as_ref()` / `as_mut()` expose; the capacity never changes after construction.
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so eager zero-initialization is a one-off cost
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// make the entire underlying buffer available through `as_ref()` etc., e.g. to pass it
    ///  to a socket receive call
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    fn new_buf(capacity: usize, content: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        result.put_slice(content);
        result
    }

    #[rstest]
    #[case::empty(new_buf(100, b""), 0)]
    #[case::simple(new_buf(100, b"abc"), 3)]
    #[case::full(new_buf(5, b"abcde"), 5)]
    fn test_len(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
    }

    #[rstest]
    #[case::empty(new_buf(100, b""), 100)]
    #[case::with_data(new_buf(100, b"abc"), 100)]
    #[case::full(new_buf(5, b"abcde"), 5)]
    fn test_capacity(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.capacity(), expected);
    }

    #[rstest]
    #[case::empty(new_buf(3, b""), b"\0\0\0")]
    #[case::with_data(new_buf(4, b"abc"), b"abc\0")]
    #[case::full(new_buf(5, b"abcde"), b"abcde")]
    fn test_maximize_len(#[case] mut buf: FixedBuf, #[case] expected: &[u8]) {
        buf.maximize_len();
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::shorter(3, b"abc")]
    #[case::same(5, b"abcde")]
    #[case::zero(0, b"")]
    fn test_truncate(#[case] len: usize, #[case] expected: &[u8]) {
        let mut buf = new_buf(100, b"abcde");
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = new_buf(100, b"12345");
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.as_ref(), b"");
        assert_eq!(buf.capacity(), 100);
    }

    #[test]
    fn test_buf_mut_put() {
        let mut buf = FixedBuf::new(100);
        buf.put_slice(b"hello");
        buf.put_u16(0x1234);
        assert_eq!(buf.as_ref(), b"hello\x12\x34");
        assert_eq!(buf.remaining_mut(), 100 - 7);
    }

    #[test]
    fn test_as_mut_modification() {
        let mut buf = new_buf(20, b"abc");
        buf.as_mut()[0] = b'A';
        assert_eq!(buf.as_ref(), b"Abc");
    }

    #[test]
    fn test_eq_ignores_capacity() {
        assert_eq!(new_buf(100, b"hi"), new_buf(200, b"hi"));
        assert_ne!(new_buf(100, b"hi"), new_buf(100, b"yo"));
    }
}
