use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

use super::memory_budget::{DiskObserver, MemoryBudget};
use crate::constants::BUFFER_POOL_BLOCKS;
use crate::storage::StorageError;

/// Hands out fixed-size disk buffers against a block budget.
///
/// Backing memory is recycled through a lock-free free list. The budget is
/// tracked by [`BufferToken`]s rather than by the memory itself, so a token
/// can move from a buffer into the cache entry that ends up owning the data.
pub struct BufferAllocator {
    block_size: usize,
    budget: Arc<MemoryBudget>,
    free_buffers: ArrayQueue<BytesMut>,
}

impl BufferAllocator {
    pub fn new(block_size: usize, limit_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            budget: MemoryBudget::new(limit_blocks),
            free_buffers: ArrayQueue::new(BUFFER_POOL_BLOCKS),
        })
    }

    /// Allocates one block. On exhaustion the observer is registered and
    /// will be notified once when a block is released; the caller is
    /// expected to retry then.
    pub fn allocate(
        self: &Arc<Self>,
        category: &'static str,
        observer: Option<&Arc<dyn DiskObserver>>,
    ) -> Result<DiskBuffer, StorageError> {
        if !self.budget.try_acquire(observer) {
            tracing::trace!(category, "disk buffer allocation refused");
            return Err(StorageError::BufferExhausted);
        }

        let data = self
            .free_buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.block_size));
        Ok(DiskBuffer {
            data,
            token: Some(BufferToken {
                allocator: self.clone(),
            }),
            category,
        })
    }

    fn recycle(&self, mut buf: BytesMut) {
        if buf.capacity() < self.block_size {
            return;
        }
        buf.clear();
        let _ = self.free_buffers.push(buf);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn in_use(&self) -> usize {
        self.budget.in_use()
    }

    pub fn free_buffers(&self) -> usize {
        self.free_buffers.len()
    }
}

/// Accounts for one block of the allocator budget. Dropping it returns the
/// block and may wake a waiting observer.
pub struct BufferToken {
    allocator: Arc<BufferAllocator>,
}

impl Drop for BufferToken {
    fn drop(&mut self) {
        self.allocator.budget.release(1);
    }
}

impl fmt::Debug for BufferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferToken")
    }
}

/// A block-sized buffer with single-owner semantics.
///
/// Starts empty with room for one block. Fill it, then either hand it to a
/// write job or freeze it with [`DiskBuffer::into_parts`].
pub struct DiskBuffer {
    data: BytesMut,
    token: Option<BufferToken>,
    category: &'static str,
}

impl DiskBuffer {
    pub fn category(&self) -> &'static str {
        self.category
    }

    /// Replaces the contents with `src`.
    pub fn fill_from(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
    }

    /// Resizes to `len` bytes, zero-filling any growth.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Freezes the data and hands back the budget token with it.
    pub fn into_parts(mut self) -> (Bytes, Option<BufferToken>) {
        let data = std::mem::take(&mut self.data).freeze();
        (data, self.token.take())
    }
}

impl Deref for DiskBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for DiskBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            token.allocator.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBuffer")
            .field("len", &self.data.len())
            .field("category", &self.category)
            .finish()
    }
}
