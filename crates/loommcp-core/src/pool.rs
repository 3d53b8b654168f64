//! Fixed-size buffer pool for receive paths.
//!
//! The pool holds `pool_size` buffers of `buffer_size` bytes. Acquiring
//! hands out a pooled buffer when one is free and the requested size fits;
//! otherwise the caller gets a plain heap buffer. Pooled buffers return on
//! drop. A pooled buffer is never freed before the pool itself drops.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

struct Shared {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
}

/// A shareable pool of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool of `pool_size` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let free = (0..pool_size)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                buffer_size,
            }),
        }
    }

    /// The fixed size of pooled buffers.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Acquire a pooled buffer, or `None` when the pool is exhausted.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let buf = self.shared.free.lock().pop()?;
        Some(PooledBuffer {
            data: Some(buf),
            origin: Origin::Pool(Arc::clone(&self.shared)),
        })
    }

    /// Acquire a buffer of at least `len` bytes.
    ///
    /// Falls back to a heap buffer when `len` exceeds the pooled buffer size
    /// or the pool is exhausted; heap buffers are freed on drop rather than
    /// returned.
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        if len <= self.shared.buffer_size
            && let Some(buf) = self.try_acquire()
        {
            return buf;
        }
        PooledBuffer {
            data: Some(vec![0u8; len.max(self.shared.buffer_size)].into_boxed_slice()),
            origin: Origin::Heap,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

enum Origin {
    Pool(Arc<Shared>),
    Heap,
}

/// A buffer checked out of a [`BufferPool`], returned on drop.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    origin: Origin,
}

impl PooledBuffer {
    /// Whether this buffer came from the pool (as opposed to heap fallback).
    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Origin::Pool(_))
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Origin::Pool(shared), Some(buf)) = (&self.origin, self.data.take()) {
            shared.free.lock().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let pool = BufferPool::new(1024, 2);
        assert_eq!(pool.available(), 2);
        {
            let a = pool.acquire(100);
            let b = pool.acquire(100);
            assert!(a.is_pooled() && b.is_pooled());
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhaustion_falls_back_to_heap() {
        let pool = BufferPool::new(64, 1);
        let _held = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        let fallback = pool.acquire(10);
        assert!(!fallback.is_pooled());
        drop(fallback);
        // Heap fallback buffers do not enter the pool.
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let pool = BufferPool::new(64, 4);
        let big = pool.acquire(1000);
        assert!(!big.is_pooled());
        assert!(big.len() >= 1000);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn pooled_buffers_are_writable() {
        let pool = BufferPool::new(8, 1);
        let mut buf = pool.acquire(8);
        buf[0] = 0xFF;
        assert_eq!(buf[0], 0xFF);
    }
}
