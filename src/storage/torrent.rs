use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use super::backend::{CheckStatus, MoveFlags, ResumeData, Storage};
use super::error::{FileOperation, StorageError};
use super::file::{file_spans, AllocationMode, FileEntry, FileIndex, PieceFileSpan, PieceIndex, PieceInfo};
use super::file_pool::{OpenMode, StorageFiles};

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_all_file_paths(files: &[FileEntry]) -> Result<(), StorageError> {
    for file in files {
        validate_file_path(&file.path)?;
    }
    Ok(())
}

fn not_found_is_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// A torrent's files on the local file system.
pub struct TorrentStorage {
    base_path: RwLock<PathBuf>,
    files: RwLock<Vec<FileEntry>>,
    pieces: Vec<PieceInfo>,
    total_length: u64,
    allocation_mode: AllocationMode,
    priorities: RwLock<Vec<u8>>,
}

impl TorrentStorage {
    pub fn new(
        base_path: PathBuf,
        files: Vec<FileEntry>,
        pieces: Vec<PieceInfo>,
        total_length: u64,
    ) -> Result<Self, StorageError> {
        validate_all_file_paths(&files)?;

        let priorities = vec![1; files.len()];
        Ok(Self {
            base_path: RwLock::new(base_path),
            files: RwLock::new(files),
            pieces,
            total_length,
            allocation_mode: AllocationMode::Sparse,
            priorities: RwLock::new(priorities),
        })
    }

    pub fn with_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.allocation_mode = mode;
        self
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn save_path(&self) -> PathBuf {
        self.base_path.read().clone()
    }

    pub fn file_path(&self, index: FileIndex) -> Option<PathBuf> {
        let files = self.files.read();
        files.get(index).map(|f| self.base_path.read().join(&f.path))
    }

    pub fn file_priorities(&self) -> Vec<u8> {
        self.priorities.read().clone()
    }

    fn block_file_spans(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        length: usize,
    ) -> Result<Vec<PieceFileSpan>, StorageError> {
        let piece = self
            .pieces
            .get(piece_index as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece_index))?;

        if offset as u64 + length as u64 > piece.length {
            return Err(StorageError::InvalidBlockOffset {
                piece: piece_index,
                offset,
            });
        }

        Ok(file_spans(
            &self.files.read(),
            piece.offset + offset as u64,
            length as u64,
        ))
    }

    /// Creates every non-padding file at its full length.
    pub fn preallocate(&self, files: &StorageFiles<'_>) -> Result<(), StorageError> {
        let entries = self.files.read().clone();
        let base = self.save_path();
        for (index, file) in entries.iter().enumerate() {
            if file.is_padding {
                continue;
            }
            let handle = files.open(index, &base.join(&file.path), OpenMode::ReadWrite)?;
            handle.set_len(file.length)?;
        }
        Ok(())
    }

    fn remove_empty_dirs(base: &Path, entries: &[FileEntry]) {
        for file in entries {
            let mut dir = file.path.parent();
            while let Some(d) = dir {
                if d.as_os_str().is_empty() {
                    break;
                }
                // Only succeeds for empty directories.
                if std::fs::remove_dir(base.join(d)).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
    }

    fn move_file(src: &Path, dst: &Path, index: FileIndex) -> Result<(), StorageError> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(FileOperation::Mkdir, parent, Some(index), &e))?;
        }
        if std::fs::rename(src, dst).is_ok() {
            return Ok(());
        }
        // Rename fails across file systems; fall back to copy and remove.
        std::fs::copy(src, dst)
            .map_err(|e| StorageError::io(FileOperation::Copy, src, Some(index), &e))?;
        std::fs::remove_file(src)
            .map_err(|e| StorageError::io(FileOperation::Remove, src, Some(index), &e))
    }
}

impl Storage for TorrentStorage {
    fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    fn piece_size(&self, piece: PieceIndex) -> u32 {
        self.pieces
            .get(piece as usize)
            .map(|p| p.length as u32)
            .unwrap_or(0)
    }

    fn expected_hash(&self, piece: PieceIndex) -> Option<&[u8]> {
        self.pieces
            .get(piece as usize)
            .and_then(|p| p.expected_hash())
    }

    fn read(
        &self,
        files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let spans = self.block_file_spans(piece, offset, buf.len())?;
        let base = self.save_path();
        let entries = self.files.read().clone();
        let mut pos = 0usize;

        for span in spans {
            let chunk = &mut buf[pos..pos + span.length as usize];
            let file = &entries[span.file_index];
            if file.is_padding {
                chunk.fill(0);
            } else {
                let handle =
                    files.open(span.file_index, &base.join(&file.path), OpenMode::ReadOnly)?;
                handle.read_at(span.file_offset, chunk)?;
            }
            pos += span.length as usize;
        }

        Ok(())
    }

    fn write(
        &self,
        files: &StorageFiles<'_>,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let spans = self.block_file_spans(piece, offset, data.len())?;
        let base = self.save_path();
        let entries = self.files.read().clone();
        let mut pos = 0usize;

        for span in spans {
            let file = &entries[span.file_index];
            if !file.is_padding {
                let handle =
                    files.open(span.file_index, &base.join(&file.path), OpenMode::ReadWrite)?;
                handle.write_at(span.file_offset, &data[pos..pos + span.length as usize])?;
            }
            pos += span.length as usize;
        }

        Ok(())
    }

    fn move_storage(
        &self,
        files: &StorageFiles<'_>,
        dest: &Path,
        flags: MoveFlags,
    ) -> Result<PathBuf, StorageError> {
        files.release_all();

        let base = self.save_path();
        if base == dest {
            return Ok(base);
        }
        let entries = self.files.read().clone();

        if flags == MoveFlags::FailIfExist {
            for file in entries.iter().filter(|f| !f.is_padding) {
                let target = dest.join(&file.path);
                if target.exists() {
                    return Err(StorageError::FileExists(target));
                }
            }
        }

        for (index, file) in entries.iter().enumerate() {
            if file.is_padding {
                continue;
            }
            let src = base.join(&file.path);
            let dst = dest.join(&file.path);
            if !src.exists() {
                continue;
            }
            if dst.exists() {
                match flags {
                    MoveFlags::DontReplace => continue,
                    MoveFlags::AlwaysReplaceFiles | MoveFlags::FailIfExist => {
                        std::fs::remove_file(&dst).map_err(|e| {
                            StorageError::io(FileOperation::Remove, &dst, Some(index), &e)
                        })?;
                    }
                }
            }
            Self::move_file(&src, &dst, index)?;
        }

        Self::remove_empty_dirs(&base, &entries);
        *self.base_path.write() = dest.to_path_buf();
        tracing::debug!("moved storage from {} to {}", base.display(), dest.display());
        Ok(dest.to_path_buf())
    }

    fn delete_files(&self, files: &StorageFiles<'_>) -> Result<(), StorageError> {
        files.release_all();

        let base = self.save_path();
        let entries = self.files.read().clone();
        for (index, file) in entries.iter().enumerate() {
            if file.is_padding {
                continue;
            }
            let path = base.join(&file.path);
            not_found_is_none(std::fs::remove_file(&path))
                .map_err(|e| StorageError::io(FileOperation::Remove, &path, Some(index), &e))?;
        }
        Self::remove_empty_dirs(&base, &entries);
        Ok(())
    }

    fn rename_file(
        &self,
        files: &StorageFiles<'_>,
        index: FileIndex,
        name: &str,
    ) -> Result<(), StorageError> {
        let new_path = PathBuf::from(name);
        validate_file_path(&new_path)?;

        let old_path = {
            let entries = self.files.read();
            entries
                .get(index)
                .map(|f| f.path.clone())
                .ok_or(StorageError::InvalidFileIndex(index))?
        };

        files.release_file(index);
        let base = self.save_path();
        let src = base.join(&old_path);
        if src.exists() {
            Self::move_file(&src, &base.join(&new_path), index)?;
        }

        self.files.write()[index].path = new_path;
        Ok(())
    }

    fn set_file_priority(
        &self,
        files: &StorageFiles<'_>,
        priorities: &[u8],
    ) -> Result<(), StorageError> {
        let entries = self.files.read().clone();
        let base = self.save_path();
        let mut current = self.priorities.write();

        for (index, &prio) in priorities.iter().enumerate().take(entries.len()) {
            let was_skipped = current[index] == 0;
            current[index] = prio;

            let file = &entries[index];
            if was_skipped
                && prio > 0
                && !file.is_padding
                && self.allocation_mode == AllocationMode::Full
            {
                let handle = files.open(index, &base.join(&file.path), OpenMode::ReadWrite)?;
                handle.set_len(file.length)?;
            }
        }
        Ok(())
    }

    fn check_resume(
        &self,
        files: &StorageFiles<'_>,
        resume: Option<&ResumeData>,
    ) -> Result<CheckStatus, StorageError> {
        let entries = self.files.read().clone();
        let base = self.save_path();
        let mut status = CheckStatus::NoError;

        for (index, file) in entries.iter().enumerate() {
            if file.is_padding {
                continue;
            }
            let path = base.join(&file.path);
            let actual = not_found_is_none(std::fs::metadata(&path))
                .map_err(|e| StorageError::io(FileOperation::Stat, &path, Some(index), &e))?
                .map(|m| m.len());
            let recorded = resume.and_then(|r| r.file_sizes.get(index).copied().flatten());

            let consistent = match (recorded, actual) {
                (Some(rec), Some(act)) => rec == act,
                (Some(rec), None) => rec == 0,
                (None, Some(act)) => act == 0,
                (None, None) => true,
            };
            if !consistent {
                tracing::debug!("resume data mismatch for {}", path.display());
                status = CheckStatus::NeedFullCheck;
            }
        }

        if status == CheckStatus::NoError && self.allocation_mode == AllocationMode::Full {
            self.preallocate(files)?;
        }
        Ok(status)
    }
}
