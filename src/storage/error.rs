use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::backend::StorageId;
use super::file::{FileIndex, PieceIndex};

/// The file system operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOperation {
    Unknown,
    Open,
    Read,
    Write,
    Rename,
    Remove,
    Mkdir,
    Stat,
    Copy,
    SetLength,
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOperation::Unknown => "file operation",
            FileOperation::Open => "open",
            FileOperation::Read => "read",
            FileOperation::Write => "write",
            FileOperation::Rename => "rename",
            FileOperation::Remove => "remove",
            FileOperation::Mkdir => "mkdir",
            FileOperation::Stat => "stat",
            FileOperation::Copy => "copy",
            FileOperation::SetLength => "set length",
        };
        f.write_str(name)
    }
}

/// Error reported through a job's completion.
///
/// The error is `Clone` because a single abort or fence decision fans out to
/// many jobs, so native I/O errors are captured by kind, raw OS code and
/// message instead of holding the `std::io::Error` itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("{operation} failed for {}: {message}", path.display())]
    Filesystem {
        operation: FileOperation,
        path: PathBuf,
        file_index: Option<FileIndex>,
        kind: io::ErrorKind,
        code: Option<i32>,
        message: String,
    },

    #[error("piece hash mismatch for piece {0}")]
    HashMismatch(PieceIndex),

    #[error("operation cancelled, disk I/O is shutting down")]
    Cancelled,

    #[error("job dropped, storage {0} is being removed")]
    FencedOut(StorageId),

    #[error("disk buffer budget exhausted")]
    BufferExhausted,

    #[error("corrupt data read back: piece {piece}, offset {offset}")]
    Corruption { piece: PieceIndex, offset: u32 },

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    #[error("invalid block offset: piece {piece}, offset {offset}")]
    InvalidBlockOffset { piece: PieceIndex, offset: u32 },

    #[error("invalid file index: {0}")]
    InvalidFileIndex(FileIndex),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("file already exists: {}", .0.display())]
    FileExists(PathBuf),
}

impl StorageError {
    /// Wraps a native I/O error with the operation and path that produced it.
    pub fn io(
        operation: FileOperation,
        path: impl Into<PathBuf>,
        file_index: Option<FileIndex>,
        err: &io::Error,
    ) -> Self {
        StorageError::Filesystem {
            operation,
            path: path.into(),
            file_index,
            kind: err.kind(),
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    /// Returns true for errors caused by shutdown or storage removal rather
    /// than by the disk itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StorageError::Cancelled | StorageError::FencedOut(_))
    }

    /// The native error code, if this is a file system error that carried one.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            StorageError::Filesystem { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::io(FileOperation::Unknown, PathBuf::new(), None, &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_code_and_path() {
        let err = io::Error::from_raw_os_error(2);
        let se = StorageError::io(FileOperation::Open, "a/b.dat", Some(3), &err);

        assert_eq!(se.native_code(), Some(2));
        match &se {
            StorageError::Filesystem {
                operation,
                path,
                file_index,
                kind,
                ..
            } => {
                assert_eq!(*operation, FileOperation::Open);
                assert_eq!(path, &PathBuf::from("a/b.dat"));
                assert_eq!(*file_index, Some(3));
                assert_eq!(*kind, io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(se.to_string().starts_with("open failed for a/b.dat"));
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(StorageError::Cancelled.is_cancellation());
        assert!(StorageError::FencedOut(StorageId(1)).is_cancellation());
        assert!(!StorageError::HashMismatch(0).is_cancellation());
    }
}
