//! Memory caching for disk blocks.
//!
//! # Overview
//!
//! - [`BufferAllocator`] - fixed-size block buffers counted against a budget,
//!   with [`DiskObserver`] backpressure when the budget is exhausted
//! - [`BlockCache`] - piece-indexed block cache: read cache, write-back cache
//!   and incremental piece hashing
//! - [`MemoryBudget`] - the block budget shared by the two
//!
//! # ARC Caching Algorithm
//!
//! Read pieces enter the most-recently-used list and move to the
//! most-frequently-used list on their next hit. Evicted read pieces are
//! remembered in ghost lists; a miss on a remembered piece shifts the
//! target size between the two lists and brings the piece back as
//! frequently used. Volatile reads live in their own list, are evicted
//! before anything else and are never promoted. Written pieces stay in the
//! write list until flushed.
//!
//! # Examples
//!
//! ```
//! use rbit_disk::cache::{BlockCache, PieceKey};
//! use rbit_disk::storage::{FilePool, StorageHandle, StorageId, ZeroStorage};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let cache = BlockCache::new(Arc::new(FilePool::new(8)), 16384, 64, 8);
//! let storage = StorageHandle::new(StorageId(1), ZeroStorage::new(32768, 65536));
//!
//! cache
//!     .write_block(&storage, 0, 0, Bytes::from(vec![7u8; 16384]), None)
//!     .unwrap();
//!
//! let hit = cache
//!     .try_read(PieceKey::new(storage.id(), 0), 0, 16384, false, false)
//!     .unwrap()
//!     .expect("written block is cached");
//! assert_eq!(hit[0], 7);
//! ```

mod arc;
mod block_cache;
mod buffer_pool;
mod memory_budget;
mod piece_cache;

pub use arc::{CacheList, PieceKey};
pub use block_cache::{BlockCache, BlockRef, CacheStats, HashCursor, WriteOutcome};
pub use buffer_pool::{BufferAllocator, BufferToken, DiskBuffer};
pub use memory_budget::{DiskObserver, MemoryBudget};
pub use piece_cache::{CachedPieceInfo, HashState, PieceKind};
