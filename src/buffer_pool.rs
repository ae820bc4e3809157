//! Pool of fixed-size copy buffers shared by all transfers
//!
//! A transfer holds a [`PooledBuffer`] for its whole lifetime. The buffer goes
//! back to the pool when the guard drops, so completion, error and client
//! cancellation all release it the same way.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
}

/// Cloneable handle to a shared buffer pool
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// # Arguments
    /// * `buffer_size` - Size of every buffer handed out
    /// * `max_idle` - Buffers kept for reuse; extra returns are freed
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_idle,
                idle: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take an idle buffer, allocating a fresh one when none is available
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = reused.unwrap_or_else(|| {
            let total = self.inner.allocated.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "Allocating copy buffer of {} bytes ({} allocated)",
                self.inner.buffer_size, total
            );
            vec![0u8; self.inner.buffer_size].into_boxed_slice()
        });

        PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Buffers currently waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Buffers allocated over the pool's lifetime
    pub fn allocated_count(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

/// Buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        let mut idle = self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool.max_idle {
            idle.push(buf);
        }
    }
}
