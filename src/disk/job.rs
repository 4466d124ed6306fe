use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::cache::{BlockRef, DiskBuffer};
use crate::storage::{
    CheckStatus, FileIndex, MoveFlags, PieceIndex, ResumeData, StorageError, StorageHandle,
    StorageId,
};

pub type JobId = u64;

/// Completion handler of a job. Called exactly once, on the completion
/// context.
pub type Handler<T> = Box<dyn FnOnce(Result<T, StorageError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Read,
    Write,
    Hash,
    MoveStorage,
    ReleaseFiles,
    DeleteFiles,
    CheckFiles,
    RenameFile,
    StopTorrent,
    FlushPiece,
    SetFilePriority,
    ClearPiece,
    /// Internal: shrink the cache after allocation pressure.
    TrimCache,
}

impl JobKind {
    pub const COUNT: usize = 13;

    pub const ALL: [JobKind; Self::COUNT] = [
        JobKind::Read,
        JobKind::Write,
        JobKind::Hash,
        JobKind::MoveStorage,
        JobKind::ReleaseFiles,
        JobKind::DeleteFiles,
        JobKind::CheckFiles,
        JobKind::RenameFile,
        JobKind::StopTorrent,
        JobKind::FlushPiece,
        JobKind::SetFilePriority,
        JobKind::ClearPiece,
        JobKind::TrimCache,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Fence jobs run alone: after every earlier job of their storage has
    /// finished and before any later one starts.
    pub fn is_fence(self) -> bool {
        matches!(
            self,
            JobKind::MoveStorage
                | JobKind::ReleaseFiles
                | JobKind::DeleteFiles
                | JobKind::CheckFiles
                | JobKind::RenameFile
                | JobKind::StopTorrent
                | JobKind::SetFilePriority
                | JobKind::ClearPiece
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            JobKind::Read => "read",
            JobKind::Write => "write",
            JobKind::Hash => "hash",
            JobKind::MoveStorage => "move_storage",
            JobKind::ReleaseFiles => "release_files",
            JobKind::DeleteFiles => "delete_files",
            JobKind::CheckFiles => "check_files",
            JobKind::RenameFile => "rename_file",
            JobKind::StopTorrent => "stop_torrent",
            JobKind::FlushPiece => "flush_piece",
            JobKind::SetFilePriority => "set_file_priority",
            JobKind::ClearPiece => "clear_piece",
            JobKind::TrimCache => "trim_cache",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct JobFlags {
    /// Cache the blocks of a read in the volatile list.
    pub volatile_read: bool,
    /// Return a private copy instead of a pinned reference into the cache.
    pub force_copy: bool,
    /// Hint that the caller reads the storage front to back.
    pub sequential_access: bool,
}

/// A block range within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRequest {
    pub piece: PieceIndex,
    pub start: u32,
    pub length: u32,
}

impl PeerRequest {
    pub fn new(piece: PieceIndex, start: u32, length: u32) -> Self {
        Self {
            piece,
            start,
            length,
        }
    }
}

pub(crate) struct WriteArgs {
    pub piece: PieceIndex,
    pub offset: u32,
    pub buffer: DiskBuffer,
}

/// Arguments, result and completion handler of one operation.
///
/// An operation that never ran completes with [`StorageError::Cancelled`].
pub(crate) struct Op<A, T> {
    args: Option<A>,
    result: Option<Result<T, StorageError>>,
    handler: Handler<T>,
}

impl<A, T> Op<A, T> {
    pub fn new(args: A, handler: impl FnOnce(Result<T, StorageError>) + Send + 'static) -> Self {
        Self {
            args: Some(args),
            result: None,
            handler: Box::new(handler),
        }
    }

    /// Runs the operation on its arguments. Does nothing the second time.
    pub fn run(&mut self, f: impl FnOnce(A) -> Result<T, StorageError>) {
        if let Some(args) = self.args.take() {
            self.result = Some(f(args));
        }
    }

    pub fn fail(&mut self, error: StorageError) {
        self.args = None;
        if self.result.is_none() {
            self.result = Some(Err(error));
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.result, Some(Ok(_)))
    }

    pub fn error(&self) -> Option<&StorageError> {
        match &self.result {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    pub fn complete(self) {
        let result = self.result.unwrap_or(Err(StorageError::Cancelled));
        (self.handler)(result);
    }
}

pub(crate) enum Action {
    Read(Op<PeerRequest, BlockRef>),
    Write(Op<WriteArgs, ()>),
    Hash(Op<PieceIndex, Vec<u8>>),
    MoveStorage(Op<(PathBuf, MoveFlags), PathBuf>),
    ReleaseFiles(Op<(), ()>),
    DeleteFiles(Op<(), ()>),
    CheckFiles(Op<Option<ResumeData>, CheckStatus>),
    RenameFile(Op<(FileIndex, String), ()>),
    StopTorrent(Op<(), ()>),
    FlushPiece(Op<PieceIndex, ()>),
    SetFilePriority(Op<Vec<u8>, ()>),
    ClearPiece(Op<PieceIndex, ()>),
    TrimCache,
}

macro_rules! each_op {
    ($action:expr, $op:ident => $body:expr, trim => $trim:expr) => {
        match $action {
            Action::Read($op) => $body,
            Action::Write($op) => $body,
            Action::Hash($op) => $body,
            Action::MoveStorage($op) => $body,
            Action::ReleaseFiles($op) => $body,
            Action::DeleteFiles($op) => $body,
            Action::CheckFiles($op) => $body,
            Action::RenameFile($op) => $body,
            Action::StopTorrent($op) => $body,
            Action::FlushPiece($op) => $body,
            Action::SetFilePriority($op) => $body,
            Action::ClearPiece($op) => $body,
            Action::TrimCache => $trim,
        }
    };
}

impl Action {
    pub fn kind(&self) -> JobKind {
        match self {
            Action::Read(_) => JobKind::Read,
            Action::Write(_) => JobKind::Write,
            Action::Hash(_) => JobKind::Hash,
            Action::MoveStorage(_) => JobKind::MoveStorage,
            Action::ReleaseFiles(_) => JobKind::ReleaseFiles,
            Action::DeleteFiles(_) => JobKind::DeleteFiles,
            Action::CheckFiles(_) => JobKind::CheckFiles,
            Action::RenameFile(_) => JobKind::RenameFile,
            Action::StopTorrent(_) => JobKind::StopTorrent,
            Action::FlushPiece(_) => JobKind::FlushPiece,
            Action::SetFilePriority(_) => JobKind::SetFilePriority,
            Action::ClearPiece(_) => JobKind::ClearPiece,
            Action::TrimCache => JobKind::TrimCache,
        }
    }

    pub fn fail(&mut self, error: StorageError) {
        each_op!(self, op => op.fail(error), trim => {})
    }

    pub fn succeeded(&self) -> bool {
        each_op!(self, op => op.is_ok(), trim => true)
    }

    pub fn error(&self) -> Option<&StorageError> {
        each_op!(self, op => op.error(), trim => None)
    }

    pub fn complete(self) {
        each_op!(self, op => op.complete(), trim => {})
    }
}

/// A queued disk operation.
pub(crate) struct Job {
    pub id: JobId,
    /// `None` only for internal jobs.
    pub storage: Option<StorageHandle>,
    pub flags: JobFlags,
    pub action: Action,
    pub queued_at: Instant,
}

impl Job {
    pub fn new(id: JobId, storage: Option<StorageHandle>, flags: JobFlags, action: Action) -> Self {
        Self {
            id,
            storage,
            flags,
            action,
            queued_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.action.kind()
    }

    pub fn is_fence(&self) -> bool {
        self.kind().is_fence()
    }

    pub fn storage_id(&self) -> Option<StorageId> {
        self.storage.as_ref().map(|s| s.id())
    }

    pub fn fail(&mut self, error: StorageError) {
        self.action.fail(error);
    }

    /// Runs the completion handler, consuming the job.
    pub fn complete(self) {
        self.action.complete();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("storage", &self.storage_id())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn capture<T: Send + 'static>() -> (
        Arc<Mutex<Option<Result<T, StorageError>>>>,
        impl FnOnce(Result<T, StorageError>) + Send + 'static,
    ) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (slot, move |r| *sink.lock().unwrap() = Some(r))
    }

    #[test]
    fn test_unexecuted_op_completes_cancelled() {
        let (slot, handler) = capture::<()>();
        let job = Job::new(1, None, JobFlags::default(), Action::FlushPiece(Op::new(0, handler)));
        job.complete();
        assert_eq!(*slot.lock().unwrap(), Some(Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_run_records_result_once() {
        let (slot, handler) = capture::<Vec<u8>>();
        let mut op = Op::new(7u32, handler);
        op.run(|piece| Ok(vec![piece as u8]));
        op.run(|_| Ok(vec![0]));
        op.fail(StorageError::Cancelled);
        assert!(op.is_ok());
        op.complete();
        assert_eq!(*slot.lock().unwrap(), Some(Ok(vec![7])));
    }

    #[test]
    fn test_fail_before_run_skips_execution() {
        let (slot, handler) = capture::<()>();
        let mut action = Action::StopTorrent(Op::new((), handler));
        action.fail(StorageError::FencedOut(StorageId(3)));
        if let Action::StopTorrent(op) = &mut action {
            op.run(|()| panic!("failed op must not run"));
        }
        action.complete();
        assert_eq!(
            *slot.lock().unwrap(),
            Some(Err(StorageError::FencedOut(StorageId(3))))
        );
    }

    #[test]
    fn test_fence_kinds() {
        let fences: Vec<_> = JobKind::ALL.iter().filter(|k| k.is_fence()).collect();
        assert_eq!(fences.len(), 8);
        assert!(!JobKind::Read.is_fence());
        assert!(!JobKind::Hash.is_fence());
        assert!(!JobKind::FlushPiece.is_fence());
        assert!(JobKind::DeleteFiles.is_fence());
        for (i, kind) in JobKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
