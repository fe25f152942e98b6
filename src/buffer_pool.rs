//! Pooled, reference counted payload buffers.
//!
//! Network payloads live in buffers handed out by a [`BufferPool`] and referenced
//!  through [`PayloadBuf`] handles. A handle can be retained (second independent
//!  handle) or sliced (zero-copy view of a sub-range) - each of those counts as one
//!  holder of the underlying storage. When the last holder releases its handle, the
//!  storage is reclaimed into the pool for reuse.
//!
//! Handles are move-only: `release` consumes the handle, so releasing twice or
//!  touching a released buffer does not compile. Dropping a handle without an
//!  explicit `release` is equivalent to releasing it - the storage is reclaimed at
//!  the same single point either way, when the holder count reaches zero.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

pub struct BufferPool {
    buf_capacity: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_capacity: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_capacity,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_buffer(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_capacity)
    }

    pub fn return_buffer(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buf_capacity {
            // the buffer lost part of its allocation to a still-live slice; pooling
            //  it would shrink the pool's working set over time
            debug!("returned buffer is below nominal capacity: discarding");
            return;
        }

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// a fresh pooled buffer holding a copy of `data`, wrapped in a refcounted handle
    pub fn allocate(self: &Arc<Self>, data: &[u8]) -> PayloadBuf {
        let mut buffer = self.get_buffer();
        buffer.extend_from_slice(data);
        PayloadBuf::from_pooled(buffer, self.clone())
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// One holder's handle on (a slice of) a pooled buffer.
pub struct PayloadBuf {
    data: Option<Bytes>,
    pool: Arc<BufferPool>,
}

impl PayloadBuf {
    pub(crate) fn from_pooled(data: BytesMut, pool: Arc<BufferPool>) -> PayloadBuf {
        PayloadBuf {
            data: Some(data.freeze()),
            pool,
        }
    }

    /// a handle on a shared view of some other buffer - e.g. a slice of a receive
    ///  buffer - without copying. The view keeps the underlying storage alive; it is
    ///  reclaimed into the pool once the receive path and all views released it.
    pub(crate) fn from_shared(data: Bytes, pool: Arc<BufferPool>) -> PayloadBuf {
        PayloadBuf {
            data: Some(data),
            pool,
        }
    }

    /// a second, independently released handle on the same storage
    pub fn retain(&self) -> PayloadBuf {
        PayloadBuf {
            data: self.data.clone(),
            pool: self.pool.clone(),
        }
    }

    /// a zero-copy handle on a sub-range of the storage, counting as its own holder
    pub fn slice(&self, from: usize, to: usize) -> PayloadBuf {
        let data = self
            .data
            .as_ref()
            .expect("payload handle is only empty during drop");
        PayloadBuf {
            data: Some(data.slice(from..to)),
            pool: self.pool.clone(),
        }
    }

    /// Give up this handle. The storage goes back to the pool when the last handle
    ///  on it is released.
    pub fn release(self) {
        // Drop does the work
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for PayloadBuf {
    fn as_ref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl std::fmt::Debug for PayloadBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl PartialEq for PayloadBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}
impl Eq for PayloadBuf {}

impl Drop for PayloadBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // try_into_mut succeeds exactly when this was the last handle on the
            //  storage - that is the single deterministic point of reclamation
            if let Ok(storage) = data.try_into_mut() {
                self.pool.return_buffer(storage);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(64, 4))
    }

    #[test]
    fn test_get_return_reuse() {
        let pool = pool();

        let mut buf = pool.get_buffer();
        buf.put_slice(b"hello");
        pool.return_buffer(buf);
        assert_eq!(pool.num_pooled(), 1);

        // returned buffers come back cleared
        let buf = pool.get_buffer();
        assert_eq!(pool.num_pooled(), 0);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_pool_full_discards() {
        let pool = Arc::new(BufferPool::new(16, 2));
        let bufs: Vec<_> = (0..3).map(|_| pool.get_buffer()).collect();
        for buf in bufs {
            pool.return_buffer(buf);
        }
        assert_eq!(pool.num_pooled(), 2);
    }

    #[test]
    fn test_sole_owner_release_returns_storage() {
        let pool = pool();
        let payload = pool.allocate(b"abc");
        assert_eq!(payload.as_ref(), b"abc");
        assert_eq!(pool.num_pooled(), 0);

        payload.release();
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_retain_defers_reclamation() {
        let pool = pool();
        let payload = pool.allocate(b"abcdef");
        let second = payload.retain();

        payload.release();
        assert_eq!(pool.num_pooled(), 0);
        assert_eq!(second.as_ref(), b"abcdef");

        second.release();
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_slice_is_zero_copy_view() {
        let pool = pool();
        let payload = pool.allocate(b"hello world");
        let slice = payload.slice(6, 11);
        assert_eq!(slice.as_ref(), b"world");

        slice.release();
        assert_eq!(pool.num_pooled(), 0);
        payload.release();
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_drop_is_release() {
        let pool = pool();
        {
            let _payload = pool.allocate(b"xyz");
        }
        assert_eq!(pool.num_pooled(), 1);
    }
}
