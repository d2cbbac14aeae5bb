//! Reusable scratch buffers.
//!
//! Zone refreshes, pipeline steps and reconciliation all need short-lived
//! vectors (points, zones, query results, ids). `BufferPool::acquire` hands
//! out a cleared vector wrapped in `Pooled`, which puts it back when dropped,
//! including when a step bails out early with `?`.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bulwark_model::{EntityId, Vec3, WorldObject, ZoneDescriptor};
use parking_lot::Mutex;

/// Free buffers kept per pool; anything beyond is dropped on release.
const MAX_FREE: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    pub peak_outstanding: usize,
}

impl PoolStats {
    pub fn outstanding(&self) -> usize {
        self.acquired.saturating_sub(self.released) as usize
    }
}

#[derive(Debug)]
struct PoolInner<T> {
    free: Vec<Vec<T>>,
    stats: PoolStats,
}

#[derive(Debug)]
pub struct BufferPool<T> {
    inner: Arc<Mutex<PoolInner<T>>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::new(),
                stats: PoolStats::default(),
            })),
        }
    }

    pub fn acquire(&self) -> Pooled<T> {
        let mut inner = self.inner.lock();
        let buf = match inner.free.pop() {
            Some(buf) => {
                inner.stats.reused += 1;
                buf
            }
            None => Vec::new(),
        };
        inner.stats.acquired += 1;
        let outstanding = inner.stats.outstanding();
        inner.stats.peak_outstanding = inner.stats.peak_outstanding.max(outstanding);
        Pooled {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    pub fn outstanding(&self) -> usize {
        self.stats().outstanding()
    }
}

/// A vector checked out of a `BufferPool`.
pub struct Pooled<T> {
    buf: Vec<T>,
    pool: Arc<Mutex<PoolInner<T>>>,
}

impl<T> Deref for Pooled<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.buf
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.buf
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buf.fmt(f)
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut inner = self.pool.lock();
        inner.stats.released += 1;
        if inner.free.len() < MAX_FREE {
            inner.free.push(buf);
        }
    }
}

/// The pools the engine draws from.
#[derive(Debug, Clone, Default)]
pub struct BufferPools {
    pub points: BufferPool<Vec3>,
    pub zones: BufferPool<ZoneDescriptor>,
    pub objects: BufferPool<WorldObject>,
    pub ids: BufferPool<EntityId>,
}

impl BufferPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently checked out across all pools.
    pub fn outstanding(&self) -> usize {
        self.points.outstanding()
            + self.zones.outstanding()
            + self.objects.outstanding()
            + self.ids.outstanding()
    }
}
