use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::StorageError;
use super::file::{FileIndex, PieceIndex};
use super::file_pool::StorageFiles;

/// Identifies one storage instance for the lifetime of the disk I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to do when a file already exists at the destination of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveFlags {
    /// Overwrite files at the destination.
    #[default]
    AlwaysReplaceFiles,
    /// Fail with [`StorageError::FileExists`] if any destination file exists.
    FailIfExist,
    /// Keep existing destination files; the source copy is left in place.
    DontReplace,
}

/// Outcome of a successful resume check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Files on disk agree with the resume data.
    NoError,
    /// Files on disk do not match; every piece must be re-hashed.
    NeedFullCheck,
}

/// What the caller remembers about the files from a previous session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeData {
    /// Recorded size of every file, in file order. `None` means no record.
    pub file_sizes: Vec<Option<u64>>,
}

/// File-level operations the disk I/O thread delegates to.
///
/// Implementations own the mapping from pieces to files; the disk I/O thread
/// never interprets the layout. All methods are called from worker threads,
/// and never concurrently with a fence operation on the same storage.
pub trait Storage: Send + Sync {
    fn num_pieces(&self) -> u32;

    fn piece_size(&self, piece: PieceIndex) -> u32;

    /// The expected hash of a piece: 20 bytes for SHA-1, 32 for SHA-256.
    fn expected_hash(&self, _piece: PieceIndex) -> Option<&[u8]> {
        None
    }

    fn read(
        &self,
        files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError>;

    fn write(
        &self,
        files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Moves every file under `dest` and returns the new save path.
    fn move_storage(
        &self,
        files: &StorageFiles<'_>,
        dest: &Path,
        flags: MoveFlags,
    ) -> Result<PathBuf, StorageError>;

    fn release_files(&self, files: &StorageFiles<'_>) -> Result<(), StorageError> {
        files.release_all();
        Ok(())
    }

    /// Deletes every file of the storage and any directories left empty.
    fn delete_files(&self, files: &StorageFiles<'_>) -> Result<(), StorageError>;

    fn rename_file(
        &self,
        files: &StorageFiles<'_>,
        index: FileIndex,
        name: &str,
    ) -> Result<(), StorageError>;

    fn set_file_priority(
        &self,
        files: &StorageFiles<'_>,
        priorities: &[u8],
    ) -> Result<(), StorageError>;

    fn check_resume(
        &self,
        files: &StorageFiles<'_>,
        resume: Option<&ResumeData>,
    ) -> Result<CheckStatus, StorageError>;
}

struct StorageSlot {
    id: StorageId,
    backend: Box<dyn Storage>,
}

/// Shared, reference-counted handle to a storage.
///
/// Every in-flight job and every cached piece holds a clone, so the storage
/// lives as long as the longest-surviving job or torrent handle.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<StorageSlot>,
}

impl StorageHandle {
    pub fn new(id: StorageId, backend: impl Storage + 'static) -> Self {
        Self {
            inner: Arc::new(StorageSlot {
                id,
                backend: Box::new(backend),
            }),
        }
    }

    pub fn id(&self) -> StorageId {
        self.inner.id
    }

    pub fn backend(&self) -> &dyn Storage {
        self.inner.backend.as_ref()
    }

    /// Number of blocks in `piece` for the given block size.
    pub fn blocks_in_piece(&self, piece: PieceIndex, block_size: usize) -> usize {
        (self.backend().piece_size(piece) as usize).div_ceil(block_size)
    }
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl PartialEq for StorageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for StorageHandle {}

/// Storage that reads zeros and discards writes. Useful for benchmarking the
/// cache and job machinery without touching the disk.
#[derive(Debug, Clone)]
pub struct ZeroStorage {
    piece_length: u32,
    total_length: u64,
}

impl ZeroStorage {
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        Self {
            piece_length,
            total_length,
        }
    }

    fn check_range(&self, piece: PieceIndex, offset: u32, len: usize) -> Result<(), StorageError> {
        if piece >= self.num_pieces() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        if offset as u64 + len as u64 > self.piece_size(piece) as u64 {
            return Err(StorageError::InvalidBlockOffset { piece, offset });
        }
        Ok(())
    }
}

impl Storage for ZeroStorage {
    fn num_pieces(&self) -> u32 {
        self.total_length.div_ceil(self.piece_length as u64) as u32
    }

    fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    fn read(
        &self,
        _files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        self.check_range(piece, offset, buf.len())?;
        buf.fill(0);
        Ok(())
    }

    fn write(
        &self,
        _files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.check_range(piece, offset, data.len())
    }

    fn move_storage(
        &self,
        _files: &StorageFiles<'_>,
        dest: &Path,
        _flags: MoveFlags,
    ) -> Result<PathBuf, StorageError> {
        Ok(dest.to_path_buf())
    }

    fn delete_files(&self, _files: &StorageFiles<'_>) -> Result<(), StorageError> {
        Ok(())
    }

    fn rename_file(
        &self,
        _files: &StorageFiles<'_>,
        _index: FileIndex,
        _name: &str,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn set_file_priority(
        &self,
        _files: &StorageFiles<'_>,
        _priorities: &[u8],
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn check_resume(
        &self,
        _files: &StorageFiles<'_>,
        _resume: Option<&ResumeData>,
    ) -> Result<CheckStatus, StorageError> {
        Ok(CheckStatus::NoError)
    }
}
