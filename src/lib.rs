//! rbit-disk - Asynchronous disk I/O for BitTorrent clients
//!
//! This library provides the disk side of a BitTorrent engine: a job-based
//! disk I/O thread with an ARC block cache, write-back caching with
//! incremental piece hashing, and a bounded pool of open file handles.
//!
//! # Modules
//!
//! - [`disk`] - The disk I/O thread, worker pools and job fencing
//! - [`cache`] - ARC block cache, disk buffer allocator and backpressure
//! - [`storage`] - Storage backends and the file handle pool
//! - [`constants`] - Default sizes, limits and timeouts

pub mod cache;
pub mod constants;
pub mod disk;
pub mod storage;

pub use cache::{BlockRef, DiskBuffer, DiskObserver};
pub use disk::{
    CompletionContext, DiskIoThread, DiskSettings, DiskStats, JobFlags, JobKind, ManualContext,
    PeerRequest, TokioContext,
};
pub use storage::{
    FileEntry, PieceInfo, Storage, StorageError, StorageHandle, StorageId, TorrentStorage,
};
