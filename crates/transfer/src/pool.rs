//! Fixed-size reusable byte buffers with a capacity ceiling.
//!
//! The pool never blocks. Exhaustion is reported as `None` and callers
//! retry on a later scheduler pass. Grants hand their buffers back when
//! dropped, so a block that errors out or gets abandoned on
//! cancellation returns its capacity without extra bookkeeping.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Thread-safe pool of same-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Previously allocated buffers ready for reuse.
    free: Vec<Vec<u8>>,
    /// Buffers currently owned by grants.
    outstanding: usize,
}

impl BufferPool {
    /// Creates a pool of at most `capacity` buffers of `buffer_size` bytes.
    ///
    /// Buffers are allocated lazily and kept for reuse once released.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                capacity,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                }),
            }),
        }
    }

    /// Grants a single buffer, or `None` when the pool is exhausted.
    pub fn require_buffer(&self) -> Option<BufferGrant> {
        self.require_buffers(1)
    }

    /// Grants exactly `count` buffers, or `None`. Never grants partially.
    pub fn require_buffers(&self, count: usize) -> Option<BufferGrant> {
        let mut buffers = {
            let mut s = self.inner.state.lock().unwrap();
            if s.outstanding + count > self.inner.capacity {
                return None;
            }
            s.outstanding += count;
            let reuse = count.min(s.free.len());
            let split = s.free.len() - reuse;
            s.free.split_off(split)
        };

        // Allocate outside the lock.
        while buffers.len() < count {
            buffers.push(vec![0u8; self.inner.buffer_size]);
        }

        Some(BufferGrant {
            buffers,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns a grant's buffers to the pool.
    ///
    /// Equivalent to dropping the grant.
    pub fn release(&self, grant: BufferGrant) {
        drop(grant);
    }

    /// Size in bytes of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Maximum number of outstanding buffers.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers currently owned by grants.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().unwrap().outstanding
    }

    /// Buffers that could be granted right now.
    pub fn available(&self) -> usize {
        self.inner.capacity - self.outstanding()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// One or more pooled buffers owned by a single in-flight block.
pub struct BufferGrant {
    buffers: Vec<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl BufferGrant {
    /// Number of buffers in this grant.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Size of each buffer in the grant.
    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size
    }

    /// Total bytes the grant can hold.
    pub fn byte_capacity(&self) -> usize {
        self.pool.buffer_size * self.buffers.len()
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.buffers
    }
}

impl fmt::Debug for BufferGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGrant")
            .field("buffers", &self.buffers.len())
            .field("buffer_size", &self.pool.buffer_size)
            .finish()
    }
}

impl Drop for BufferGrant {
    fn drop(&mut self) {
        let returned = std::mem::take(&mut self.buffers);
        let mut s = self.pool.state.lock().unwrap();
        s.outstanding -= returned.len();
        s.free.extend(returned);
    }
}
