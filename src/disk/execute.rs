//! What each kind of job does once a worker picks it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::io_thread::Shared;
use super::job::{Action, Job, JobFlags, PeerRequest, WriteArgs};
use super::stats::DiskCounters;
use crate::cache::{BlockRef, HashCursor, HashState, PieceKey};
use crate::constants::MAX_REQUEST_LENGTH;
use crate::storage::{
    CheckStatus, FileIndex, MoveFlags, PieceIndex, ResumeData, StorageError, StorageFiles,
    StorageHandle,
};

impl Shared {
    pub(super) fn execute(self: &Arc<Self>, job: &mut Job) {
        let flags = job.flags;
        let Some(storage) = job.storage.clone() else {
            if let Action::TrimCache = job.action {
                self.do_trim();
            }
            return;
        };

        match &mut job.action {
            Action::Read(op) => op.run(|request| self.do_read(&storage, request, flags)),
            Action::Write(op) => op.run(|args| self.do_write(&storage, args)),
            Action::Hash(op) => op.run(|piece| self.do_hash(&storage, piece)),
            Action::MoveStorage(op) => {
                op.run(|(dest, mode)| self.do_move_storage(&storage, &dest, mode))
            }
            Action::ReleaseFiles(op) => op.run(|()| self.do_release_files(&storage)),
            Action::DeleteFiles(op) => op.run(|()| self.do_delete_files(&storage)),
            Action::CheckFiles(op) => {
                op.run(|resume| self.do_check_files(&storage, resume.as_ref()))
            }
            Action::RenameFile(op) => {
                op.run(|(index, name)| self.do_rename_file(&storage, index, &name))
            }
            Action::StopTorrent(op) => op.run(|()| self.do_stop_torrent(&storage)),
            Action::FlushPiece(op) => op.run(|piece| {
                self.cache.flush_piece(storage.id(), piece).map(|_| ())
            }),
            Action::SetFilePriority(op) => {
                op.run(|priorities| self.do_set_file_priority(&storage, &priorities))
            }
            Action::ClearPiece(op) => op.run(|piece| self.do_clear_piece(&storage, piece)),
            Action::TrimCache => self.do_trim(),
        }

        if let Some(e) = job.action.error() {
            if !e.is_cancellation() {
                tracing::warn!(
                    job = job.id,
                    kind = %job.kind(),
                    storage = %storage.id(),
                    "disk job failed: {}",
                    e
                );
            }
        }
    }

    fn do_trim(&self) {
        self.trim_started();
        let headroom = self.settings.read().trim_blocks();
        let resident = self.cache.resident_blocks().min(self.cache.capacity());
        self.cache.trim_to(resident.saturating_sub(headroom));
    }

    fn do_read(
        self: &Arc<Self>,
        storage: &StorageHandle,
        request: PeerRequest,
        flags: JobFlags,
    ) -> Result<BlockRef, StorageError> {
        let piece = request.piece;
        if piece >= storage.backend().num_pieces() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        let piece_size = storage.backend().piece_size(piece) as usize;
        let start = request.start as usize;
        let len = request.length as usize;
        if len == 0 || request.length > MAX_REQUEST_LENGTH || start + len > piece_size {
            return Err(StorageError::InvalidBlockOffset {
                piece,
                offset: request.start,
            });
        }

        let (use_read_cache, volatile) = {
            let settings = self.settings.read();
            (
                settings.use_read_cache,
                flags.volatile_read && settings.volatile_read_cache,
            )
        };
        let key = PieceKey::new(storage.id(), piece);
        if let Some(hit) = self
            .cache
            .try_read(key, request.start, len, volatile, flags.force_copy)?
        {
            DiskCounters::add(&self.counters.read_hits, 1);
            return Ok(hit);
        }

        // Blocks already in the cache may be dirty, so they take precedence
        // over what storage holds.
        let bs = self.cache.block_size();
        let first = start / bs;
        let count = (start + len - 1) / bs - first + 1;
        let resident = self.cache.peek_blocks(key, first, count);
        let files = self.files.for_storage(storage.id());
        let mut cache_blocks = use_read_cache;
        let mut parts = Vec::with_capacity(count);

        for (i, cached) in resident.into_iter().enumerate() {
            if let Some(data) = cached {
                parts.push(data);
                continue;
            }
            let index = first + i;
            let block_start = index * bs;
            let block_len = bs.min(piece_size - block_start);

            let buffer = if cache_blocks {
                match self.allocator.allocate("read cache", None) {
                    Ok(buffer) => Some(buffer),
                    Err(_) => {
                        tracing::debug!(storage = %storage.id(), piece, "no buffers for read cache");
                        cache_blocks = false;
                        self.trigger_trim();
                        None
                    }
                }
            } else {
                None
            };

            let data = match buffer {
                Some(mut buffer) => {
                    buffer.resize(block_len);
                    storage
                        .backend()
                        .read(&files, piece, block_start as u32, &mut buffer)?;
                    let (data, token) = buffer.into_parts();
                    self.cache
                        .insert_read(storage, piece, index, vec![(data.clone(), token)], volatile);
                    data
                }
                None => {
                    let mut buf = vec![0u8; block_len];
                    storage
                        .backend()
                        .read(&files, piece, block_start as u32, &mut buf)?;
                    Bytes::from(buf)
                }
            };
            DiskCounters::add(&self.counters.blocks_read, 1);
            parts.push(data);
        }

        assemble(&parts, piece, first * bs, start, len).map(BlockRef::owned)
    }

    fn do_write(&self, storage: &StorageHandle, args: WriteArgs) -> Result<(), StorageError> {
        let (use_write_cache, line_size) = {
            let settings = self.settings.read();
            (settings.use_write_cache, settings.write_cache_line_size)
        };
        let (data, token) = args.buffer.into_parts();
        self.cache
            .write_block(storage, args.piece, args.offset, data, token)?;

        if use_write_cache {
            self.cache
                .try_flush_hashed(storage.id(), args.piece, line_size)?;
        } else {
            self.cache.flush_piece(storage.id(), args.piece)?;
        }
        Ok(())
    }

    fn do_hash(&self, storage: &StorageHandle, piece: PieceIndex) -> Result<Vec<u8>, StorageError> {
        if piece >= storage.backend().num_pieces() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }

        let mut cursor = self.cache.begin_hash(storage, piece);
        if let Err(e) = self.hash_remaining(storage, piece, &mut cursor) {
            self.cache.end_hash(&cursor, false);
            return Err(e);
        }
        let digest = std::mem::replace(&mut cursor.state, HashState::new_v1()).finalize();
        let passed = storage
            .backend()
            .expected_hash(piece)
            .map_or(true, |expected| expected == digest.as_slice());
        self.cache.end_hash(&cursor, passed);

        if !passed {
            tracing::debug!(storage = %storage.id(), piece, "piece failed hash check");
            return Err(StorageError::HashMismatch(piece));
        }

        let line_size = self.settings.read().write_cache_line_size;
        if let Err(e) = self.cache.try_flush_hashed(storage.id(), piece, line_size) {
            tracing::warn!(storage = %storage.id(), piece, "flush after hash failed: {}", e);
        }
        Ok(digest)
    }

    /// Feeds the blocks the cursor has not covered yet, from the cache when
    /// resident and from storage otherwise.
    fn hash_remaining(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        cursor: &mut HashCursor,
    ) -> Result<(), StorageError> {
        let key = PieceKey::new(storage.id(), piece);
        let bs = self.cache.block_size();
        let piece_size = storage.backend().piece_size(piece) as usize;
        let files = self.files.for_storage(storage.id());

        for index in cursor.next_block..cursor.num_blocks {
            let block_start = index * bs;
            let block_len = bs.min(piece_size - block_start);
            match self.cache.pin_block(key, index) {
                Some(block) => {
                    if block.len() != block_len {
                        return Err(StorageError::Corruption {
                            piece,
                            offset: block_start as u32,
                        });
                    }
                    cursor.state.update(&block);
                }
                None => {
                    let mut buf = vec![0u8; block_len];
                    storage
                        .backend()
                        .read(&files, piece, block_start as u32, &mut buf)?;
                    DiskCounters::add(&self.counters.blocks_read, 1);
                    DiskCounters::add(&self.counters.read_back, 1);
                    cursor.state.update(&buf);
                }
            }
            cursor.next_block = index + 1;
        }
        Ok(())
    }

    /// Runs a fence operation with flushes from other storages kept away.
    fn fenced<T>(
        &self,
        storage: &StorageHandle,
        flush: bool,
        op: impl FnOnce(&StorageFiles<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let id = storage.id();
        self.cache.freeze_storage(id);
        let flushed = if flush {
            self.cache.flush_storage(id).map(|_| ())
        } else {
            self.cache.wait_flushes(id);
            Ok(())
        };
        let files = self.files.for_storage(id);
        let result = flushed.and_then(|()| op(&files));
        self.cache.thaw_storage(id);
        result
    }

    fn do_move_storage(
        &self,
        storage: &StorageHandle,
        dest: &Path,
        flags: MoveFlags,
    ) -> Result<PathBuf, StorageError> {
        self.fenced(storage, true, |files| {
            storage.backend().move_storage(files, dest, flags)
        })
    }

    fn do_release_files(&self, storage: &StorageHandle) -> Result<(), StorageError> {
        self.fenced(storage, true, |files| storage.backend().release_files(files))
    }

    fn do_delete_files(&self, storage: &StorageHandle) -> Result<(), StorageError> {
        self.fenced(storage, false, |files| {
            self.cache.evict_storage(storage.id());
            storage.backend().delete_files(files)
        })
    }

    fn do_check_files(
        &self,
        storage: &StorageHandle,
        resume: Option<&ResumeData>,
    ) -> Result<CheckStatus, StorageError> {
        self.fenced(storage, true, |files| {
            storage.backend().check_resume(files, resume)
        })
    }

    fn do_rename_file(
        &self,
        storage: &StorageHandle,
        index: FileIndex,
        name: &str,
    ) -> Result<(), StorageError> {
        self.fenced(storage, true, |files| {
            storage.backend().rename_file(files, index, name)
        })
    }

    fn do_stop_torrent(&self, storage: &StorageHandle) -> Result<(), StorageError> {
        self.fenced(storage, true, |files| {
            self.cache.evict_storage(storage.id());
            storage.backend().release_files(files)
        })
    }

    fn do_set_file_priority(
        &self,
        storage: &StorageHandle,
        priorities: &[u8],
    ) -> Result<(), StorageError> {
        self.fenced(storage, false, |files| {
            storage.backend().set_file_priority(files, priorities)
        })
    }

    fn do_clear_piece(&self, storage: &StorageHandle, piece: PieceIndex) -> Result<(), StorageError> {
        self.fenced(storage, false, |_| {
            if !self.cache.clear_piece(storage.id(), piece) {
                tracing::debug!(storage = %storage.id(), piece, "cleared piece still pinned");
            }
            Ok(())
        })
    }
}

/// Cuts `len` bytes at `start` out of consecutive blocks beginning at piece
/// offset `base`.
fn assemble(
    parts: &[Bytes],
    piece: PieceIndex,
    base: usize,
    start: usize,
    len: usize,
) -> Result<Bytes, StorageError> {
    let from = start - base;
    if let [single] = parts {
        if from + len > single.len() {
            return Err(StorageError::Corruption {
                piece,
                offset: start as u32,
            });
        }
        return Ok(single.slice(from..from + len));
    }

    let mut out = BytesMut::with_capacity(len);
    let mut skip = from;
    for part in parts {
        let take = part.len().saturating_sub(skip).min(len - out.len());
        out.extend_from_slice(&part[skip.min(part.len())..skip.min(part.len()) + take]);
        skip = skip.saturating_sub(part.len());
    }
    if out.len() != len {
        return Err(StorageError::Corruption {
            piece,
            offset: start as u32,
        });
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_single_block() {
        let parts = [Bytes::from_static(b"abcdefgh")];
        assert_eq!(assemble(&parts, 0, 0, 2, 3).unwrap(), Bytes::from_static(b"cde"));
        assert!(matches!(
            assemble(&parts, 0, 0, 6, 4),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn test_assemble_across_blocks() {
        let parts = [
            Bytes::from_static(b"abcd"),
            Bytes::from_static(b"efgh"),
            Bytes::from_static(b"ij"),
        ];
        assert_eq!(
            assemble(&parts, 0, 4, 6, 7).unwrap(),
            Bytes::from_static(b"cdefghi")
        );
        assert_eq!(
            assemble(&parts, 0, 0, 0, 10).unwrap(),
            Bytes::from_static(b"abcdefghij")
        );
        assert!(assemble(&parts, 0, 0, 0, 11).is_err());
    }
}
