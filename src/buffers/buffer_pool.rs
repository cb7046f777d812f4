use std::sync::Mutex;

use tracing::{debug, trace};

use crate::buffers::fixed_buffer::FixedBuf;

/// A pool of frame-sized [`FixedBuf`]s shared between all send paths and the receive loop.
///
/// Renting and returning is the owning component's responsibility: a buffer must be returned
///  on every exit path and must not be touched afterwards. The pool never blocks for long -
///  the critical section is a single `Vec` push or pop.
pub struct BufferPool {
    frame_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    /// `frame_size` is the capacity of pooled buffers (normally the configured MTU);
    ///  `max_pooled` caps how many returned buffers are retained.
    pub fn new(frame_size: usize, max_pooled: usize) -> BufferPool {
        BufferPool {
            frame_size,
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Returns a buffer with capacity of at least `min_len`. Contents are undefined - the
    ///  caller writes before it reads. Requests above the regular frame size are served with
    ///  a one-off allocation that will not be retained on return.
    pub fn rent(&self, min_len: usize) -> FixedBuf {
        if min_len > self.frame_size {
            debug!("requested buffer of {} bytes exceeds the pooled frame size: one-off allocation", min_len);
            return FixedBuf::new(min_len);
        }

        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.frame_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        if buffer.capacity() != self.frame_size {
            debug!("returned buffer does not have the regular frame capacity: discarding");
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::zero(0)]
    #[case::small(1)]
    #[case::frame_sized(1400)]
    #[case::oversized(5000)]
    fn test_rent_capacity(#[case] min_len: usize) {
        let pool = BufferPool::new(1400, 4);
        assert!(pool.rent(min_len).capacity() >= min_len);
    }

    #[test]
    fn test_rented_buffer_is_empty_after_return() {
        let pool = BufferPool::new(10, 4);

        let mut buf = pool.rent(10);
        buf.put_u8(1);
        buf.put_u8(2);
        pool.return_to_pool(buf);

        assert_eq!(pool.rent(10).as_ref(), b"");
    }

    #[test]
    fn test_return_discards_beyond_cap() {
        let pool = BufferPool::new(10, 2);

        let bufs: Vec<FixedBuf> = (0..5).map(|_| pool.rent(10)).collect();
        for buf in bufs {
            pool.return_to_pool(buf);
        }

        assert_eq!(pool.buffers.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_return_of_oversized_rental_does_not_panic() {
        let pool = BufferPool::new(10, 4);

        let buf = pool.rent(100);
        assert!(buf.capacity() >= 100);
        pool.return_to_pool(buf);

        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
    }
}
