//! Storage backends and file handle management.
//!
//! The disk I/O thread never interprets a torrent's file layout. It talks to
//! a [`Storage`] implementation through a shared [`StorageHandle`] and hands
//! it a view of the shared [`FilePool`] for opening files.
//!
//! # Components
//!
//! - [`Storage`] - File-level operations for one torrent
//! - [`TorrentStorage`] - Files on the local file system, pieces may span files
//! - [`ZeroStorage`] - Reads zeros and discards writes
//! - [`FilePool`] - Bounded LRU of open file handles shared by all storages
//! - [`StorageError`] - Structured error reported through job completions
//!
//! # Examples
//!
//! ```no_run
//! use rbit_disk::storage::{FileEntry, FilePool, PieceInfo, Storage, StorageId, TorrentStorage};
//! use std::path::PathBuf;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = TorrentStorage::new(
//!     PathBuf::from("./downloads"),
//!     vec![FileEntry::new(PathBuf::from("file.txt"), 1000, 0)],
//!     vec![PieceInfo::v1(0, [0u8; 20], 0, 1000)],
//!     1000,
//! )?;
//!
//! let pool = FilePool::new(40);
//! let files = pool.for_storage(StorageId(1));
//! storage.write(&files, 0, 0, &[0u8; 1000])?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! [`TorrentStorage`] validates file paths to prevent directory traversal
//! attacks. Paths containing `..` or absolute paths are rejected, both at
//! construction and when renaming a file.

mod backend;
mod error;
mod file;
mod file_pool;
mod io;
mod torrent;

pub use backend::{
    CheckStatus, MoveFlags, ResumeData, Storage, StorageHandle, StorageId, ZeroStorage,
};
pub use error::{FileOperation, StorageError};
pub use file::{file_spans, AllocationMode, FileEntry, FileIndex, PieceFileSpan, PieceIndex, PieceInfo};
pub use file_pool::{FilePool, OpenMode, PooledFile, StorageFiles};
pub use io::{coalesce_blocks, WriteRegion};
pub use torrent::TorrentStorage;
