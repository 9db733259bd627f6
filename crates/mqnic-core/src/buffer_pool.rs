//! Receive buffer pool
//!
//! RX refill needs a steady supply of `rx_buf_size` byte buffers. The pool
//! keeps released buffers in a lock-free `ArrayQueue` so the refill path only
//! allocates when the cache runs dry, and allocation itself is fallible: a
//! failed allocation is reported to the caller (and counted as `alloc_fail`)
//! instead of aborting the process.
//!
//! # Example
//!
//! ```
//! use mqnic_core::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(2048, 16);
//! let buffer = pool.try_acquire().unwrap();
//! assert_eq!(buffer.len(), 2048);
//!
//! pool.release(buffer);
//! assert_eq!(pool.available(), 16);
//! ```

use crossbeam_queue::ArrayQueue;
use std::collections::TryReserveError;
use std::sync::Arc;
#[cfg(any(test, feature = "fault-injection"))]
use std::sync::atomic::{AtomicUsize, Ordering};

/// A lock-free cache of equally sized receive buffers
///
/// Cloning produces another handle to the same cache.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
    #[cfg(any(test, feature = "fault-injection"))]
    fail_next: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool of `pool_size` pre-allocated buffers of `buffer_size` bytes
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let pool = Arc::new(ArrayQueue::new(pool_size.max(1)));
        for _ in 0..pool_size {
            let _ = pool.push(vec![0u8; buffer_size]);
        }

        Self {
            pool,
            buffer_size,
            #[cfg(any(test, feature = "fault-injection"))]
            fail_next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a buffer, allocating a new one if the cache is empty
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if a fresh buffer cannot be reserved.
    pub fn try_acquire(&self) -> Result<Vec<u8>, TryReserveError> {
        #[cfg(any(test, feature = "fault-injection"))]
        if self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Vec::<u8>::new().try_reserve_exact(usize::MAX).map(|_| Vec::new());
        }

        if let Some(buffer) = self.pool.pop() {
            return Ok(buffer);
        }

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(self.buffer_size)?;
        buffer.resize(self.buffer_size, 0);
        Ok(buffer)
    }

    /// Return a buffer to the cache
    ///
    /// The buffer is zeroed and resized to `buffer_size`. It is dropped if the
    /// cache is full.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        let _ = self.pool.push(buffer);
    }

    /// Buffers currently cached
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Size of every buffer handed out
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of cached buffers
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Make the next `count` acquisitions fail as if the allocator were exhausted
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn inject_alloc_failures(&self, count: usize) {
        self.fail_next.store(count, Ordering::Release);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
