//! Bounded pool of open file handles shared by all storages.
//!
//! Handles are keyed by `(storage, file index)`. When the pool grows past its
//! capacity the least recently used handle is dropped from the pool; jobs
//! that still hold it keep it open until they finish, and the next access
//! reopens the file transparently.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::backend::StorageId;
use super::error::{FileOperation, StorageError};
use super::file::FileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

pub struct PooledFile {
    file: Mutex<File>,
    last_used: Mutex<Instant>,
    mode: OpenMode,
    path: PathBuf,
    file_index: FileIndex,
}

impl PooledFile {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| self.error(FileOperation::Read, &e))
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| self.error(FileOperation::Write, &e))
    }

    pub fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.file
            .lock()
            .set_len(len)
            .map_err(|e| self.error(FileOperation::SetLength, &e))
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn error(&self, op: FileOperation, err: &std::io::Error) -> StorageError {
        StorageError::io(op, self.path.clone(), Some(self.file_index), err)
    }
}

type HandleKey = (StorageId, FileIndex);

pub struct FilePool {
    handles: DashMap<HandleKey, Arc<PooledFile>>,
    capacity: AtomicUsize,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: DashMap::new(),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn for_storage(&self, storage: StorageId) -> StorageFiles<'_> {
        StorageFiles {
            pool: self,
            storage,
        }
    }

    pub fn open(
        &self,
        storage: StorageId,
        file_index: FileIndex,
        path: &Path,
        mode: OpenMode,
    ) -> Result<Arc<PooledFile>, StorageError> {
        let key = (storage, file_index);
        if let Some(handle) = self.handles.get(&key) {
            if mode == OpenMode::ReadOnly || handle.mode == OpenMode::ReadWrite {
                handle.touch();
                return Ok(handle.clone());
            }
        }

        let file = match mode {
            OpenMode::ReadOnly => File::open(path),
            OpenMode::ReadWrite => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::io(FileOperation::Mkdir, parent, Some(file_index), &e)
                    })?;
                }
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(path)
            }
        }
        .map_err(|e| StorageError::io(FileOperation::Open, path, Some(file_index), &e))?;

        let handle = Arc::new(PooledFile {
            file: Mutex::new(file),
            last_used: Mutex::new(Instant::now()),
            mode,
            path: path.to_path_buf(),
            file_index,
        });

        self.handles.insert(key, handle.clone());
        self.evict_excess(Some(key));
        Ok(handle)
    }

    fn evict_excess(&self, keep: Option<HandleKey>) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        while self.handles.len() > capacity {
            let oldest = self
                .handles
                .iter()
                .filter(|r| Some(*r.key()) != keep)
                .min_by_key(|r| *r.last_used.lock())
                .map(|r| *r.key());

            match oldest {
                Some(key) => {
                    self.handles.remove(&key);
                    tracing::trace!("file pool evicted {:?}", key);
                }
                None => break,
            }
        }
    }

    /// Closes every handle belonging to `storage`, syncing written files.
    pub fn release(&self, storage: StorageId) {
        let keys: Vec<HandleKey> = self
            .handles
            .iter()
            .filter(|r| r.key().0 == storage)
            .map(|r| *r.key())
            .collect();

        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.mode == OpenMode::ReadWrite {
                    if let Err(e) = handle.file.lock().sync_data() {
                        tracing::warn!(
                            storage = %storage,
                            file = key.1,
                            path = %handle.path.display(),
                            "sync on release failed: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    pub fn release_file(&self, storage: StorageId, file_index: FileIndex) {
        self.handles.remove(&(storage, file_index));
    }

    pub fn release_all(&self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
        self.evict_excess(None);
    }

    pub fn is_open(&self, storage: StorageId, file_index: FileIndex) -> bool {
        self.handles.contains_key(&(storage, file_index))
    }
}

/// The file pool as seen by one storage.
#[derive(Clone, Copy)]
pub struct StorageFiles<'a> {
    pool: &'a FilePool,
    storage: StorageId,
}

impl<'a> StorageFiles<'a> {
    pub fn storage(&self) -> StorageId {
        self.storage
    }

    pub fn open(
        &self,
        file_index: FileIndex,
        path: &Path,
        mode: OpenMode,
    ) -> Result<Arc<PooledFile>, StorageError> {
        self.pool.open(self.storage, file_index, path, mode)
    }

    pub fn release_all(&self) {
        self.pool.release(self.storage);
    }

    pub fn release_file(&self, file_index: FileIndex) {
        self.pool.release_file(self.storage, file_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lru_eviction_closes_oldest() {
        let temp = TempDir::new().unwrap();
        let pool = FilePool::new(2);
        let sid = StorageId(1);

        for i in 0..3 {
            let path = temp.path().join(format!("f{i}"));
            pool.open(sid, i, &path, OpenMode::ReadWrite).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(pool.len(), 2);
        assert!(!pool.is_open(sid, 0));
        assert!(pool.is_open(sid, 1));
        assert!(pool.is_open(sid, 2));
    }

    #[test]
    fn test_reopen_after_eviction_is_transparent() {
        let temp = TempDir::new().unwrap();
        let pool = FilePool::new(1);
        let sid = StorageId(7);
        let a = temp.path().join("a");
        let b = temp.path().join("b");

        pool.open(sid, 0, &a, OpenMode::ReadWrite)
            .unwrap()
            .write_at(0, b"hello")
            .unwrap();
        pool.open(sid, 1, &b, OpenMode::ReadWrite).unwrap();
        assert!(!pool.is_open(sid, 0));

        let mut buf = [0u8; 5];
        pool.open(sid, 0, &a, OpenMode::ReadOnly)
            .unwrap()
            .read_at(0, &mut buf)
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_write_mode_upgrades_read_handle() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x");
        std::fs::write(&path, b"abc").unwrap();

        let pool = FilePool::new(4);
        let ro = pool.open(StorageId(1), 0, &path, OpenMode::ReadOnly).unwrap();
        assert_eq!(ro.mode(), OpenMode::ReadOnly);

        let rw = pool.open(StorageId(1), 0, &path, OpenMode::ReadWrite).unwrap();
        assert_eq!(rw.mode(), OpenMode::ReadWrite);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_only_touches_one_storage() {
        let temp = TempDir::new().unwrap();
        let pool = FilePool::new(8);
        pool.open(StorageId(1), 0, &temp.path().join("a"), OpenMode::ReadWrite)
            .unwrap();
        pool.open(StorageId(2), 0, &temp.path().join("b"), OpenMode::ReadWrite)
            .unwrap();

        pool.release(StorageId(1));

        assert!(!pool.is_open(StorageId(1), 0));
        assert!(pool.is_open(StorageId(2), 0));
    }

    #[test]
    fn test_release_syncs_written_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        let pool = FilePool::new(2);
        let file = pool.open(StorageId(1), 0, &path, OpenMode::ReadWrite).unwrap();
        file.write_at(4, b"abcd").unwrap();
        drop(file);

        pool.release(StorageId(1));

        assert!(pool.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0\0\0abcd");
    }

    #[test]
    fn test_missing_file_reports_open_error() {
        let temp = TempDir::new().unwrap();
        let pool = FilePool::new(2);
        let err = pool
            .open(StorageId(1), 3, &temp.path().join("nope"), OpenMode::ReadOnly)
            .err()
            .unwrap();

        match err {
            StorageError::Filesystem {
                operation,
                file_index,
                kind,
                ..
            } => {
                assert_eq!(operation, FileOperation::Open);
                assert_eq!(file_index, Some(3));
                assert_eq!(kind, std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
