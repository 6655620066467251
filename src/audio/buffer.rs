//! # Frame Buffer Pool
//!
//! Every 20ms each active call decodes one wire chunk and each subscribed room
//! track delivers one or two PCM frames. Allocating a fresh `Vec<i16>` for each
//! of those adds up quickly at a few hundred concurrent calls, so sample
//! buffers are borrowed from a shared pool and handed back when dropped.
//!
//! ## Key Features:
//! - **Fixed-size buffers**: every pooled buffer has room for `frame_samples`
//! - **RAII return**: [`FrameBuffer`] goes back to the pool on `Drop`
//! - **Bounded**: at most `capacity` idle buffers are kept, extras are freed
//! - **Thread safety**: the free list sits behind `Arc<Mutex<..>>`, so relay
//!   tasks on different worker threads can share one pool

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Configuration for the frame buffer pool.
#[derive(Debug, Clone)]
pub struct FramePoolConfig {
    /// Samples each pooled buffer can hold without reallocating
    pub frame_samples: usize,

    /// Maximum number of idle buffers kept for reuse
    pub capacity: usize,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            frame_samples: 1920,   // 20ms of 48kHz stereo
            capacity: 64,
        }
    }
}

/// Shared pool of reusable sample buffers.
///
/// Cloning is cheap; all clones hand out buffers from the same free list.
#[derive(Debug, Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Vec<i16>>>,
    config: FramePoolConfig,
    reused: AtomicU64,
    allocated: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolStats {
    pub idle: usize,
    pub reused: u64,
    pub allocated: u64,
}

impl FramePool {
    /// Create a new, empty pool. Buffers are allocated lazily on first use.
    pub fn new(config: FramePoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(config.capacity)),
                config,
                reused: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow an empty buffer with at least `frame_samples` capacity.
    pub fn acquire(&self) -> FrameBuffer {
        let recycled = self.inner.free.lock().unwrap().pop();

        let samples = match recycled {
            Some(buffer) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.inner.config.frame_samples)
            }
        };

        FrameBuffer {
            samples,
            home: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Number of idle buffers waiting in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    pub fn stats(&self) -> FramePoolStats {
        FramePoolStats {
            idle: self.idle(),
            reused: self.inner.reused.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn release(&self, mut buffer: Vec<i16>) {
        // Buffers that lost their capacity are not reusable
        if buffer.capacity() < self.config.frame_samples {
            return;
        }

        let mut free = self.free.lock().unwrap();
        if free.len() < self.config.capacity {
            buffer.clear();
            free.push(buffer);
        }
    }
}

/// A sample buffer that returns itself to its pool when dropped.
///
/// Buffers created with [`FrameBuffer::detached`] have no pool and are simply
/// freed; this is how frames produced outside the bridge (e.g. by the room
/// transport) are represented.
#[derive(Debug)]
pub struct FrameBuffer {
    samples: Vec<i16>,
    home: Option<Weak<PoolInner>>,
}

impl FrameBuffer {
    /// Wrap an existing vector that does not belong to any pool.
    pub fn detached(samples: Vec<i16>) -> Self {
        Self { samples, home: None }
    }

    /// Mutable access to the underlying vector, for `extend`/`push`.
    pub fn as_mut_vec(&mut self) -> &mut Vec<i16> {
        &mut self.samples
    }

    /// Whether this buffer will go back to a pool on drop.
    #[cfg(test)]
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Clone for FrameBuffer {
    fn clone(&self) -> Self {
        Self::detached(self.samples.clone())
    }
}

impl Deref for FrameBuffer {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        &self.samples
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take().and_then(|home| home.upgrade()) {
            pool.release(std::mem::take(&mut self.samples));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(capacity: usize) -> FramePool {
        FramePool::new(FramePoolConfig { frame_samples: 160, capacity })
    }

    #[test]
    fn test_buffers_are_reused_after_drop() {
        let pool = small_pool(4);

        let mut buffer = pool.acquire();
        buffer.as_mut_vec().extend_from_slice(&[1, 2, 3]);
        drop(buffer);

        assert_eq!(pool.idle(), 1);
        let again = pool.acquire();
        assert!(again.is_empty(), "recycled buffers must come back cleared");
        assert!(again.is_pooled());

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn test_idle_buffers_are_bounded() {
        let pool = small_pool(2);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(buffers);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_detached_and_shrunk_buffers_do_not_return() {
        let pool = small_pool(4);

        let mut shrunk = pool.acquire();
        *shrunk.as_mut_vec() = Vec::new();
        drop(shrunk);
        assert_eq!(pool.idle(), 0);

        let detached = FrameBuffer::detached(vec![0; 10]);
        assert!(!detached.is_pooled());
        drop(detached);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_buffers_outliving_pool_are_freed() {
        let pool = small_pool(4);
        let buffer = pool.acquire();
        drop(pool);
        // Must not panic: the weak handle no longer upgrades
        drop(buffer);
    }
}
