use super::Chunk;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use thiserror::Error as ThisError;

/// A byte budget that every [`Chunk`] is allocated against. Storage returns
/// its reservation to the pool when the last chunk referencing it is dropped.
#[derive(Debug, Clone)]
pub struct PbufPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    in_use: AtomicUsize,
}

/// Backing storage for a chunk.
#[derive(Debug)]
pub(super) struct Block {
    pub(super) data: Vec<u8>,
    pub(super) reserved: usize,
    pool: Arc<PoolInner>,
}

impl Drop for Block {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.reserved, Ordering::AcqRel);
    }
}

impl PbufPool {
    /// Creates a pool that hands out at most `capacity` bytes at a time.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a pool limited only by the system allocator.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// The total budget of the pool in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently reserved by live chunks.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Allocates a zero-filled chunk of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<Chunk, AllocError> {
        let mut block = self.block(len)?;
        block.data.resize(len, 0);
        Ok(Chunk::new(block))
    }

    /// Allocates a chunk holding a copy of `data`.
    pub fn copy_from(&self, data: &[u8]) -> Result<Chunk, AllocError> {
        self.copy_with_capacity(data, data.len())
    }

    /// Allocates a chunk holding a copy of `data` with room to grow in place
    /// up to `capacity` bytes.
    pub fn copy_with_capacity(&self, data: &[u8], capacity: usize) -> Result<Chunk, AllocError> {
        let mut block = self.block(capacity.max(data.len()))?;
        block.data.extend_from_slice(data);
        Ok(Chunk::new(block))
    }

    fn block(&self, reserved: usize) -> Result<Block, AllocError> {
        let capacity = self.inner.capacity;
        self.inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use
                    .checked_add(reserved)
                    .filter(|&total| total <= capacity)
            })
            .map_err(|in_use| AllocError {
                requested: reserved,
                available: capacity.saturating_sub(in_use),
            })?;
        // From here on the reservation is owned by the block and released on
        // drop, including on the error path below.
        let mut block = Block {
            data: Vec::new(),
            reserved,
            pool: self.inner.clone(),
        };
        block
            .data
            .try_reserve_exact(reserved)
            .map_err(|_| AllocError {
                requested: reserved,
                available: 0,
            })?;
        Ok(block)
    }
}

impl Default for PbufPool {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// The pool could not satisfy an allocation.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
#[error("Could not allocate {requested} bytes, {available} available")]
pub struct AllocError {
    pub requested: usize,
    pub available: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_returned_on_drop() {
        let pool = PbufPool::new(10);
        let a = pool.alloc(6).unwrap();
        assert_eq!(pool.in_use(), 6);
        let err = pool.alloc(6).unwrap_err();
        assert_eq!(err.available, 4);
        let shared = a.clone();
        drop(a);
        assert_eq!(pool.in_use(), 6);
        drop(shared);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.alloc(10).is_ok());
    }

    #[test]
    fn capacity_is_reserved_up_front() {
        let pool = PbufPool::new(16);
        let chunk = pool.copy_with_capacity(b"abc", 12).unwrap();
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.spare_capacity(), 9);
        assert_eq!(pool.in_use(), 12);
    }
}
