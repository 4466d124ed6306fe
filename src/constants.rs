//! Disk I/O constants and tuning parameters.
//!
//! These are the defaults behind [`DiskSettings`](crate::disk::DiskSettings).
//! Values follow the defaults of popular clients (libtorrent in particular),
//! with some adjustments for machines with fast disks.

use std::time::Duration;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: usize = 16384;

/// Maximum request length per BEP 3 (128KB). Requests larger than this are suspicious.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

// ============================================================================
// Cache constants
// ============================================================================

/// Default cache size in blocks (1024 blocks = 16MB)
pub const DEFAULT_CACHE_BLOCKS: usize = 1024;

/// Upper bound on the cache size in blocks (1GB of 16KB blocks)
pub const MAX_CACHE_BLOCKS: usize = 65536;

/// Contiguous hashed dirty blocks that trigger a flush of a write piece
pub const WRITE_CACHE_LINE_SIZE: usize = 16;

/// Dirty blocks older than this are flushed by cache maintenance (libtorrent default: 300s)
pub const CACHE_EXPIRY: Duration = Duration::from_secs(300);

/// Minimum number of pieces remembered by each ARC ghost list
pub const MIN_GHOST_PIECES: usize = 8;

/// Fraction of the cache freed when allocation reports pressure
pub const TRIM_HEADROOM: f32 = 0.125;

/// How often idle workers wake up to run cache maintenance
pub const CACHE_TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Buffer pool
// ============================================================================

/// Number of recycled block buffers kept by the allocator
pub const BUFFER_POOL_BLOCKS: usize = 1024;

// ============================================================================
// File handles
// ============================================================================

/// Maximum number of open file handles (libtorrent default: 40)
pub const FILE_POOL_SIZE: usize = 40;

// ============================================================================
// Worker threads
// ============================================================================

/// Minimum number of generic I/O threads kept alive
pub const MIN_AIO_THREADS: usize = 1;

/// Maximum number of generic I/O threads (libtorrent default: 4)
pub const MAX_AIO_THREADS: usize = 4;

/// Maximum number of hashing threads. Zero routes hash jobs to the generic pool.
pub const MAX_HASHING_THREADS: usize = 1;

/// Idle workers above the pool minimum exit after this long
pub const THREAD_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
