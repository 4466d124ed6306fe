use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::arc::{ArcLists, CacheList, PieceKey};
use super::buffer_pool::BufferToken;
use super::piece_cache::{CachedBlock, CachedPiece, CachedPieceInfo, HashState};
use crate::storage::{
    coalesce_blocks, FilePool, PieceIndex, StorageError, StorageHandle, StorageId,
};

/// Flush attempts a write makes to find room before writing through.
const MAKE_ROOM_ATTEMPTS: usize = 8;

/// Bytes of one or more blocks returned by a read.
///
/// A reference to a single cached block pins that block until it is
/// dropped; the cache will not evict it meanwhile.
pub struct BlockRef {
    data: Bytes,
    pin: Option<BlockPin>,
}

struct BlockPin {
    cache: Weak<BlockCache>,
    key: PieceKey,
    block: usize,
}

impl Drop for BlockPin {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.unpin(self.key, self.block);
        }
    }
}

impl BlockRef {
    /// Data not backed by the cache.
    pub fn owned(data: Bytes) -> Self {
        Self { data, pin: None }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl Deref for BlockRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("len", &self.data.len())
            .field("pinned", &self.pin.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block is held dirty in the write cache.
    Cached,
    /// The cache had no room and the block went straight to storage.
    WrittenThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushScope {
    All,
    Hashed,
    /// Everything, from the fence job that froze the storage.
    Fenced,
}

/// A hash in progress for one piece.
///
/// When the piece is cached, the cursor owns the piece's partial hash until
/// [`BlockCache::end_hash`] hands it back.
#[derive(Debug)]
pub struct HashCursor {
    pub state: HashState,
    pub next_block: usize,
    pub num_blocks: usize,
    key: PieceKey,
    owned: bool,
}

/// Occupancy snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub resident_blocks: usize,
    pub dirty_blocks: usize,
    pub pinned_blocks: usize,
    pub pieces: usize,
    pub mru_pieces: usize,
    pub mru_blocks: usize,
    pub mfu_pieces: usize,
    pub mfu_blocks: usize,
    pub mru_ghost_pieces: usize,
    pub mfu_ghost_pieces: usize,
    pub write_pieces: usize,
    pub write_blocks: usize,
    pub volatile_pieces: usize,
    pub volatile_blocks: usize,
    /// ARC target size of the MRU side, in blocks.
    pub arc_target: usize,
    pub evicted_pieces: u64,
    pub blocks_written: u64,
}

struct CacheState {
    pieces: HashMap<PieceKey, CachedPiece>,
    lists: ArcLists,
    capacity: usize,
    /// Storages a fence job is running on. Flushes started on behalf of
    /// other storages leave their pieces alone.
    frozen: HashSet<StorageId>,
    evicted_pieces: u64,
}

impl CacheState {
    fn resident(&self) -> usize {
        self.lists.mru.blocks()
            + self.lists.mfu.blocks()
            + self.lists.write.blocks()
            + self.lists.volatile.blocks()
    }

    fn insert_piece(&mut self, key: PieceKey, mut piece: CachedPiece, now: Instant) {
        piece.last_use = now;
        let list = self.lists.list_mut(piece.list);
        list.insert(key, now);
        list.add_blocks(piece.num_resident);
        self.pieces.insert(key, piece);
    }

    fn remove_piece(&mut self, key: PieceKey) -> Option<CachedPiece> {
        let piece = self.pieces.remove(&key)?;
        debug_assert!(!piece.is_pinned(), "removing a pinned piece");
        let list = self.lists.list_mut(piece.list);
        list.remove(&key);
        list.sub_blocks(piece.num_resident);
        Some(piece)
    }

    fn add_block(
        &mut self,
        key: PieceKey,
        index: usize,
        block: CachedBlock,
        now: Instant,
    ) -> Option<CachedBlock> {
        let piece = self.pieces.get_mut(&key)?;
        let old = piece.set_block(index, block, now);
        if old.is_none() {
            self.lists.list_mut(piece.list).add_blocks(1);
        }
        old
    }

    fn drop_block(&mut self, key: PieceKey, index: usize) -> Option<CachedBlock> {
        let piece = self.pieces.get_mut(&key)?;
        let block = piece.take_block(index)?;
        self.lists.list_mut(piece.list).sub_blocks(1);
        Some(block)
    }

    fn set_list(&mut self, key: PieceKey, to: CacheList, now: Instant) {
        let Some(piece) = self.pieces.get_mut(&key) else {
            return;
        };
        let from = piece.list;
        piece.list = to;
        piece.last_use = now;
        if from == to {
            self.lists.list_mut(to).touch(&key, now);
        } else {
            self.lists.relink(key, from, to, piece.num_resident, now);
        }
    }

    /// Applies a cache hit to the piece's list position.
    fn record_hit(&mut self, key: PieceKey, volatile: bool, now: Instant) {
        let Some(piece) = self.pieces.get(&key) else {
            return;
        };
        let to = match piece.list {
            CacheList::Mru if !volatile => CacheList::Mfu,
            other => other,
        };
        self.set_list(key, to, now);
    }

    fn is_evictable(piece: &CachedPiece) -> bool {
        piece.num_resident > 0
            && piece.num_dirty == 0
            && !piece.is_pinned()
            && !piece.marked_for_eviction
    }

    fn find_victim(&self, exclude: Option<PieceKey>) -> Option<PieceKey> {
        let preferred = self.lists.preferred_victim_list();
        let other = match preferred {
            CacheList::Mru => CacheList::Mfu,
            _ => CacheList::Mru,
        };
        [CacheList::Volatile, preferred, other, CacheList::Write]
            .into_iter()
            .find_map(|list| {
                self.lists.list(list).iter_oldest().find(|key| {
                    Some(*key) != exclude
                        && self.pieces.get(key).is_some_and(Self::is_evictable)
                })
            })
    }

    /// Drops the blocks of a clean, unpinned piece. A piece with hash
    /// progress keeps its entry so the hash can resume.
    fn evict_piece(&mut self, key: PieceKey) -> usize {
        let Some(piece) = self.pieces.get_mut(&key) else {
            return 0;
        };
        self.evicted_pieces += 1;

        if piece.hash.is_some() {
            let mut freed = 0;
            for index in 0..piece.blocks.len() {
                if piece.take_block(index).is_some() {
                    freed += 1;
                }
            }
            self.lists.list_mut(piece.list).sub_blocks(freed);
            tracing::trace!(
                storage = %key.storage,
                piece = key.piece,
                freed,
                "evicted blocks, kept hash progress"
            );
            return freed;
        }

        match self.remove_piece(key) {
            Some(piece) => {
                self.lists.remember(key, piece.list);
                tracing::trace!(
                    storage = %key.storage,
                    piece = key.piece,
                    freed = piece.num_resident,
                    "evicted piece"
                );
                piece.num_resident
            }
            None => 0,
        }
    }

    /// Evicts clean pieces until at most `target` blocks are resident.
    fn evict_clean(&mut self, target: usize, exclude: Option<PieceKey>) -> usize {
        let mut freed = 0;
        while self.resident() > target {
            let Some(victim) = self.find_victim(exclude) else {
                break;
            };
            freed += self.evict_piece(victim);
        }
        freed
    }

    /// The oldest write piece with dirty blocks nobody is flushing yet.
    fn flush_candidate(&self) -> Option<PieceKey> {
        self.lists.write.iter_oldest().find(|key| {
            !self.frozen.contains(&key.storage)
                && self
                    .pieces
                    .get(key)
                    .is_some_and(|pe| !pe.dirty_blocks(|_| true).is_empty())
        })
    }

    fn has_flushing(&self, storage: StorageId) -> bool {
        self.pieces.iter().any(|(k, pe)| {
            k.storage == storage && pe.blocks.iter().flatten().any(|b| b.flushing)
        })
    }

    fn touch(&mut self, key: PieceKey, now: Instant) {
        if let Some(list) = self.pieces.get(&key).map(|pe| pe.list) {
            self.set_list(key, list, now);
        }
    }

    fn insert_dirty(
        &mut self,
        storage: &StorageHandle,
        key: PieceKey,
        num_blocks: usize,
        index: usize,
        block: CachedBlock,
    ) {
        let now = Instant::now();
        match self.pieces.get_mut(&key) {
            None => {
                self.lists.mru_ghost.remove(&key);
                self.lists.mfu_ghost.remove(&key);
                let piece = CachedPiece::new(storage.clone(), key.piece, num_blocks, CacheList::Write);
                self.insert_piece(key, piece, now);
            }
            Some(pe) => {
                pe.marked_for_eviction = false;
                self.set_list(key, CacheList::Write, now);
            }
        }

        let _replaced = self.add_block(key, index, block, now);
        if let Some(pe) = self.pieces.get_mut(&key) {
            if index < pe.next_to_hash {
                restart_hash(pe);
            }
            kick_locked(pe);
        }
    }

    /// Removes a piece's data, discarding dirty blocks. Pinned blocks stay
    /// until their last pin is dropped.
    fn discard_piece(&mut self, key: PieceKey) -> bool {
        let Some(piece) = self.pieces.get(&key) else {
            return true;
        };
        if !piece.is_pinned() {
            self.remove_piece(key);
            return true;
        }

        let unpinned: Vec<usize> = piece
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.as_ref().is_some_and(|b| !b.is_pinned()))
            .map(|(i, _)| i)
            .collect();
        for index in unpinned {
            self.drop_block(key, index);
        }
        if let Some(piece) = self.pieces.get_mut(&key) {
            piece.hash = None;
            piece.next_to_hash = 0;
            piece.need_readback = false;
            piece.marked_for_eviction = true;
        }
        false
    }

    fn remove_if_done(&mut self, key: PieceKey) {
        let Some(piece) = self.pieces.get(&key) else {
            return;
        };
        let done = if piece.marked_for_eviction {
            !piece.is_pinned()
        } else {
            piece.is_empty()
        };
        if done {
            self.remove_piece(key);
        }
    }

    /// Whether a write to `index` has to wait for internal work on the piece.
    fn block_busy(&self, key: &PieceKey, index: usize) -> bool {
        self.pieces.get(key).is_some_and(|pe| {
            pe.hashing || pe.block(index).is_some_and(|b| b.flushing)
        })
    }
}

/// Drops hash progress after a block inside the hashed prefix changed.
fn restart_hash(piece: &mut CachedPiece) {
    let prefix = piece.next_to_hash.min(piece.blocks.len());
    piece.need_readback = (0..prefix).any(|i| !piece.has_block(i));
    piece.hash = None;
    piece.next_to_hash = 0;
}

/// Feeds newly contiguous resident blocks into the piece's partial hash.
fn kick_locked(piece: &mut CachedPiece) {
    if piece.hashing || (piece.hash.is_none() && piece.next_to_hash > 0) {
        return;
    }
    if !piece.has_block(piece.next_to_hash) {
        return;
    }
    let mut state = piece.hash.take().unwrap_or_else(|| {
        HashState::for_expected(piece.storage.backend().expected_hash(piece.piece))
    });
    piece.advance_hash(&mut state);
    piece.hash = Some(state);
}

/// Piece-indexed block cache with ARC eviction, write-back and incremental
/// hashing.
///
/// All state sits behind one mutex that is never held across storage I/O.
/// Capacity is counted in blocks; ghost lists carry no blocks.
pub struct BlockCache {
    state: Mutex<CacheState>,
    unpinned: Condvar,
    files: Arc<FilePool>,
    block_size: usize,
    blocks_written: AtomicU64,
    this: Weak<BlockCache>,
}

impl BlockCache {
    pub fn new(
        files: Arc<FilePool>,
        block_size: usize,
        capacity: usize,
        ghost_limit: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(CacheState {
                pieces: HashMap::new(),
                lists: ArcLists::new(ghost_limit),
                capacity,
                frozen: HashSet::new(),
                evicted_pieces: 0,
            }),
            unpinned: Condvar::new(),
            files,
            block_size,
            blocks_written: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn files(&self) -> &Arc<FilePool> {
        &self.files
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn set_capacity(&self, capacity: usize, ghost_limit: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.lists.set_ghost_limit(ghost_limit);
        state.lists.clamp_p(capacity);
    }

    pub fn resident_blocks(&self) -> usize {
        self.state.lock().resident()
    }

    pub fn is_over_capacity(&self) -> bool {
        let state = self.state.lock();
        state.resident() > state.capacity
    }

    /// Serves `len` bytes at `offset` if every block they touch is resident.
    ///
    /// A request inside one block returns a pinned reference unless
    /// `force_copy` is set; requests spanning blocks are copied.
    pub fn try_read(
        &self,
        key: PieceKey,
        offset: u32,
        len: usize,
        volatile: bool,
        force_copy: bool,
    ) -> Result<Option<BlockRef>, StorageError> {
        if len == 0 {
            return Ok(None);
        }
        let bs = self.block_size;
        let start = offset as usize;
        let end = start + len;
        let first = start / bs;
        let last = (end - 1) / bs;

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(piece) = state.pieces.get_mut(&key) else {
            return Ok(None);
        };
        if piece.marked_for_eviction || (first..=last).any(|i| !piece.has_block(i)) {
            return Ok(None);
        }

        let result = if first == last && !force_copy {
            let Some(block) = piece.block(first) else {
                return Ok(None);
            };
            let from = start - first * bs;
            if from + len > block.data.len() {
                return Err(StorageError::Corruption {
                    piece: key.piece,
                    offset,
                });
            }
            let data = block.data.slice(from..from + len);
            piece.pin(first);
            BlockRef {
                data,
                pin: Some(BlockPin {
                    cache: self.this.clone(),
                    key,
                    block: first,
                }),
            }
        } else {
            let mut out = BytesMut::with_capacity(len);
            for index in first..=last {
                let Some(block) = piece.block(index) else {
                    return Ok(None);
                };
                let block_start = index * bs;
                let from = start.max(block_start) - block_start;
                let to = (end - block_start).min(block.data.len());
                if from >= to {
                    return Err(StorageError::Corruption {
                        piece: key.piece,
                        offset: block_start as u32,
                    });
                }
                out.extend_from_slice(&block.data[from..to]);
            }
            if out.len() != len {
                return Err(StorageError::Corruption {
                    piece: key.piece,
                    offset,
                });
            }
            BlockRef::owned(out.freeze())
        };

        state.record_hit(key, volatile, now);
        Ok(Some(result))
    }

    /// Pins one resident block, for hashing.
    pub fn pin_block(&self, key: PieceKey, index: usize) -> Option<BlockRef> {
        let mut state = self.state.lock();
        let piece = state.pieces.get_mut(&key)?;
        if piece.marked_for_eviction {
            return None;
        }
        let data = piece.block(index)?.data.clone();
        piece.pin(index);
        Some(BlockRef {
            data,
            pin: Some(BlockPin {
                cache: self.this.clone(),
                key,
                block: index,
            }),
        })
    }

    /// Data of the resident blocks `first..first + count`, without counting
    /// as a use of the piece.
    pub fn peek_blocks(&self, key: PieceKey, first: usize, count: usize) -> Vec<Option<Bytes>> {
        let state = self.state.lock();
        let piece = state.pieces.get(&key).filter(|pe| !pe.marked_for_eviction);
        (first..first + count)
            .map(|i| piece.and_then(|pe| pe.block(i)).map(|b| b.data.clone()))
            .collect()
    }

    fn unpin(&self, key: PieceKey, index: usize) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(piece) = state.pieces.get_mut(&key) {
                if piece.unpin(index) && piece.marked_for_eviction {
                    state.remove_if_done(key);
                }
            }
        }
        self.unpinned.notify_all();
    }

    /// Inserts clean blocks read from storage, starting at `first_block`.
    /// Blocks that do not fit after evicting clean pieces are not cached.
    /// Returns how many blocks were inserted.
    pub fn insert_read(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        first_block: usize,
        blocks: Vec<(Bytes, Option<BufferToken>)>,
        volatile: bool,
    ) -> usize {
        let key = PieceKey::new(storage.id(), piece);
        let num_blocks = storage.blocks_in_piece(piece, self.block_size);
        let now = Instant::now();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.pieces.get(&key).is_some_and(|pe| pe.marked_for_eviction) {
            return 0;
        }
        if !state.pieces.contains_key(&key) {
            let list = if volatile {
                CacheList::Volatile
            } else if state.lists.ghost_hit(&key, num_blocks, state.capacity) {
                CacheList::Mfu
            } else {
                CacheList::Mru
            };
            state.insert_piece(key, CachedPiece::new(storage.clone(), piece, num_blocks, list), now);
        }

        let missing = match state.pieces.get(&key) {
            Some(pe) => (first_block..first_block + blocks.len())
                .filter(|&i| i < num_blocks && !pe.has_block(i))
                .count(),
            None => return 0,
        };
        let target = state.capacity.saturating_sub(missing);
        state.evict_clean(target, Some(key));
        let room = state.capacity.saturating_sub(state.resident());

        let mut inserted = 0;
        for (i, (data, token)) in blocks.into_iter().enumerate() {
            let index = first_block + i;
            if inserted >= room || index >= num_blocks {
                break;
            }
            if state.pieces.get(&key).map_or(true, |pe| pe.has_block(index)) {
                continue;
            }
            state.add_block(key, index, CachedBlock::new(data, token, false), now);
            inserted += 1;
        }

        if state.pieces.get(&key).is_some_and(|pe| pe.is_empty()) {
            state.remove_piece(key);
        } else {
            state.touch(key, now);
        }
        inserted
    }

    /// Buffers one dirty block in the write cache.
    ///
    /// Makes room by evicting clean pieces, then by flushing the oldest
    /// dirty pieces. If nothing can be freed the block is written straight
    /// to storage.
    pub fn write_block(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
        token: Option<BufferToken>,
    ) -> Result<WriteOutcome, StorageError> {
        if piece >= storage.backend().num_pieces() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        let bs = self.block_size;
        let num_blocks = storage.blocks_in_piece(piece, bs);
        let index = offset as usize / bs;
        if offset as usize % bs != 0 || index >= num_blocks {
            return Err(StorageError::InvalidBlockOffset { piece, offset });
        }
        let piece_size = storage.backend().piece_size(piece) as usize;
        if data.len() != bs.min(piece_size - index * bs) {
            return Err(StorageError::InvalidBlockOffset { piece, offset });
        }

        let key = PieceKey::new(storage.id(), piece);
        let mut token = token;
        for _ in 0..MAKE_ROOM_ATTEMPTS {
            let candidate = {
                let mut guard = self.state.lock();
                self.unpinned
                    .wait_while(&mut guard, |state| state.block_busy(&key, index));
                let state = &mut *guard;

                let replacing = state.pieces.get(&key).is_some_and(|pe| pe.has_block(index));
                let needed = usize::from(!replacing);
                if state.resident() + needed > state.capacity {
                    let target = state.capacity.saturating_sub(needed);
                    state.evict_clean(target, Some(key));
                }
                if state.resident() + needed <= state.capacity {
                    let block = CachedBlock::new(data.clone(), token.take(), true);
                    state.insert_dirty(storage, key, num_blocks, index, block);
                    return Ok(WriteOutcome::Cached);
                }
                state.flush_candidate()
            };

            match candidate {
                Some(victim) => {
                    if let Err(e) = self.flush_blocks(victim, FlushScope::All) {
                        tracing::warn!("flush to make room failed: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }

        self.write_through(storage, key, index, &data)?;
        Ok(WriteOutcome::WrittenThrough)
    }

    fn write_through(
        &self,
        storage: &StorageHandle,
        key: PieceKey,
        index: usize,
        data: &Bytes,
    ) -> Result<(), StorageError> {
        {
            let mut state = self.state.lock();
            if let Some(pe) = state.pieces.get_mut(&key) {
                let resumable = !pe.hashing && !(pe.hash.is_none() && pe.next_to_hash > 0);
                if resumable && index == pe.next_to_hash {
                    let mut hash = pe.hash.take().unwrap_or_else(|| {
                        HashState::for_expected(storage.backend().expected_hash(key.piece))
                    });
                    hash.update(data);
                    pe.next_to_hash += 1;
                    pe.advance_hash(&mut hash);
                    pe.hash = Some(hash);
                } else if index >= pe.next_to_hash {
                    pe.need_readback = true;
                } else {
                    restart_hash(pe);
                }
            }
        }

        tracing::debug!(
            storage = %key.storage,
            piece = key.piece,
            block = index,
            "cache full, writing through"
        );
        let files = self.files.for_storage(key.storage);
        storage
            .backend()
            .write(&files, key.piece, (index * self.block_size) as u32, data)?;
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_blocks(&self, key: PieceKey, scope: FlushScope) -> Result<usize, StorageError> {
        let (storage, blocks) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if scope != FlushScope::Fenced && state.frozen.contains(&key.storage) {
                return Ok(0);
            }
            let Some(piece) = state.pieces.get_mut(&key) else {
                return Ok(0);
            };
            let hashed = piece.next_to_hash;
            let indices = piece.dirty_blocks(|i| scope != FlushScope::Hashed || i < hashed);
            let mut blocks = Vec::with_capacity(indices.len());
            for index in indices {
                piece.pin(index);
                if let Some(block) = piece.block_mut(index) {
                    block.flushing = true;
                    blocks.push((index, block.data.clone()));
                }
            }
            (piece.storage.clone(), blocks)
        };
        if blocks.is_empty() {
            return Ok(0);
        }

        let flushed: Vec<usize> = blocks.iter().map(|(i, _)| *i).collect();
        let files = self.files.for_storage(key.storage);
        let mut written = Vec::with_capacity(flushed.len());
        let mut result = Ok(());
        for region in coalesce_blocks(blocks, self.block_size) {
            match storage
                .backend()
                .write(&files, key.piece, region.offset, &region.data)
            {
                Ok(()) => written.extend(region.blocks),
                Err(e) => {
                    tracing::warn!(
                        storage = %key.storage,
                        piece = key.piece,
                        "flush failed: {}",
                        e
                    );
                    result = Err(e);
                    break;
                }
            }
        }

        {
            let now = Instant::now();
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(piece) = state.pieces.get_mut(&key) {
                for &index in &flushed {
                    if let Some(block) = piece.block_mut(index) {
                        block.flushing = false;
                    }
                    piece.unpin(index);
                }
                for &index in &written {
                    piece.mark_block_clean(index);
                }
                let clean_write_piece = piece.num_dirty == 0
                    && piece.list == CacheList::Write
                    && !piece.marked_for_eviction;
                if clean_write_piece {
                    state.set_list(key, CacheList::Mru, now);
                }
                state.remove_if_done(key);
            }
        }
        self.unpinned.notify_all();

        self.blocks_written
            .fetch_add(written.len() as u64, Ordering::Relaxed);
        tracing::trace!(
            storage = %key.storage,
            piece = key.piece,
            blocks = written.len(),
            "flushed"
        );
        result.map(|()| written.len())
    }

    /// Writes every dirty block of a piece to storage.
    pub fn flush_piece(&self, storage: StorageId, piece: PieceIndex) -> Result<usize, StorageError> {
        self.flush_blocks(PieceKey::new(storage, piece), FlushScope::All)
    }

    /// Flushes the hashed dirty blocks of a piece once there are at least
    /// `line_size` of them, or once the whole piece is hashed.
    pub fn try_flush_hashed(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        line_size: usize,
    ) -> Result<usize, StorageError> {
        let key = PieceKey::new(storage, piece);
        let ready = {
            let state = self.state.lock();
            state.pieces.get(&key).is_some_and(|pe| {
                let hashed = pe.next_to_hash;
                let count = pe.dirty_blocks(|i| i < hashed).len();
                count > 0 && (count >= line_size || pe.is_fully_hashed())
            })
        };
        if ready {
            self.flush_blocks(key, FlushScope::Hashed)
        } else {
            Ok(0)
        }
    }

    fn flush_keys(&self, keys: Vec<PieceKey>, scope: FlushScope) -> Result<usize, StorageError> {
        let mut total = 0;
        let mut first_error = None;
        for key in keys {
            match self.flush_blocks(key, scope) {
                Ok(n) => total += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    fn dirty_keys(&self, filter: impl Fn(&PieceKey, &CachedPiece) -> bool) -> Vec<PieceKey> {
        let state = self.state.lock();
        let mut keys: Vec<PieceKey> = state
            .pieces
            .iter()
            .filter(|(k, pe)| pe.num_dirty > 0 && filter(k, pe))
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    /// Flushes every dirty piece of one storage, then waits for flushes
    /// started elsewhere on its pieces to finish.
    pub fn flush_storage(&self, storage: StorageId) -> Result<usize, StorageError> {
        let result = self.flush_keys(self.dirty_keys(|k, _| k.storage == storage), FlushScope::Fenced);
        self.wait_flushes(storage);
        result
    }

    pub fn flush_all(&self) -> Result<usize, StorageError> {
        self.flush_keys(self.dirty_keys(|_, _| true), FlushScope::Fenced)
    }

    /// Blocks until no block of `storage` is being flushed.
    pub fn wait_flushes(&self, storage: StorageId) {
        let mut state = self.state.lock();
        self.unpinned
            .wait_while(&mut state, |state| state.has_flushing(storage));
    }

    /// Stops flushes on behalf of other storages from touching `storage`.
    pub fn freeze_storage(&self, storage: StorageId) {
        self.state.lock().frozen.insert(storage);
    }

    pub fn thaw_storage(&self, storage: StorageId) {
        self.state.lock().frozen.remove(&storage);
    }

    /// Flushes write pieces whose oldest dirty block is older than `expiry`.
    pub fn flush_expired(&self, expiry: Duration) -> usize {
        let now = Instant::now();
        let keys = self.dirty_keys(|_, pe| {
            pe.dirty_since
                .is_some_and(|since| now.saturating_duration_since(since) >= expiry)
        });
        if keys.is_empty() {
            return 0;
        }
        match self.flush_keys(keys, FlushScope::All) {
            Ok(n) => {
                tracing::debug!(blocks = n, "flushed expired write cache");
                n
            }
            Err(e) => {
                tracing::warn!("flushing expired blocks failed: {}", e);
                0
            }
        }
    }

    /// Evicts until at most `target` blocks are resident, flushing dirty
    /// pieces when clean ones run out. Returns the number of blocks evicted.
    pub fn trim_to(&self, target: usize) -> usize {
        let mut evicted = 0;
        loop {
            let candidate = {
                let mut state = self.state.lock();
                if state.resident() <= target {
                    break;
                }
                evicted += state.evict_clean(target, None);
                if state.resident() <= target {
                    break;
                }
                state.flush_candidate()
            };
            let Some(victim) = candidate else {
                break;
            };
            match self.flush_blocks(victim, FlushScope::All) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("trim could not flush: {}", e);
                    break;
                }
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, target, "trimmed cache");
        }
        evicted
    }

    /// Trims back to capacity.
    pub fn trim(&self) -> usize {
        let capacity = self.capacity();
        self.trim_to(capacity)
    }

    /// Advances the piece's partial hash over newly resident blocks.
    /// Returns true once every block has been hashed.
    pub fn kick_hasher(&self, storage: StorageId, piece: PieceIndex) -> bool {
        let mut state = self.state.lock();
        match state.pieces.get_mut(&PieceKey::new(storage, piece)) {
            Some(pe) => {
                kick_locked(pe);
                pe.is_fully_hashed() && pe.hash.is_some()
            }
            None => false,
        }
    }

    /// Takes over the partial hash of a piece for a hash job.
    pub fn begin_hash(&self, storage: &StorageHandle, piece: PieceIndex) -> HashCursor {
        let key = PieceKey::new(storage.id(), piece);
        let num_blocks = storage.blocks_in_piece(piece, self.block_size);
        let fresh = || HashState::for_expected(storage.backend().expected_hash(piece));

        let mut state = self.state.lock();
        match state.pieces.get_mut(&key) {
            Some(pe) if !pe.hashing && !pe.marked_for_eviction => {
                if pe.hash.is_none() {
                    pe.next_to_hash = 0;
                }
                let mut hash = pe.hash.take().unwrap_or_else(fresh);
                pe.advance_hash(&mut hash);
                pe.hashing = true;
                HashCursor {
                    state: hash,
                    next_block: pe.next_to_hash,
                    num_blocks,
                    key,
                    owned: true,
                }
            }
            _ => HashCursor {
                state: fresh(),
                next_block: 0,
                num_blocks,
                key,
                owned: false,
            },
        }
    }

    /// Returns a hash cursor's piece to the cache. A failed hash leaves the
    /// piece with no hash progress.
    pub fn end_hash(&self, cursor: &HashCursor, passed: bool) {
        if !cursor.owned {
            return;
        }
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(pe) = state.pieces.get_mut(&cursor.key) {
                pe.hashing = false;
                pe.hash = None;
                pe.need_readback = false;
                pe.next_to_hash = if passed { pe.blocks.len() } else { 0 };
                state.remove_if_done(cursor.key);
            }
        }
        self.unpinned.notify_all();
    }

    /// Drops a piece's blocks and hash state without flushing. Returns
    /// false if pinned blocks keep part of the piece alive for now.
    pub fn clear_piece(&self, storage: StorageId, piece: PieceIndex) -> bool {
        let removed = self.state.lock().discard_piece(PieceKey::new(storage, piece));
        self.unpinned.notify_all();
        removed
    }

    /// Drops everything cached for a storage, dirty blocks included, along
    /// with its ghost entries.
    pub fn evict_storage(&self, storage: StorageId) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let keys: Vec<PieceKey> = state
                .pieces
                .keys()
                .filter(|k| k.storage == storage)
                .copied()
                .collect();
            for key in keys {
                state.discard_piece(key);
            }
            state.lists.mru_ghost.remove_storage(storage);
            state.lists.mfu_ghost.remove_storage(storage);
        }
        self.unpinned.notify_all();
    }

    /// Drops every piece. Pinned pieces go once unpinned.
    pub fn clear(&self) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let keys: Vec<PieceKey> = state.pieces.keys().copied().collect();
            for key in keys {
                state.discard_piece(key);
            }
            state.lists.mru_ghost.clear();
            state.lists.mfu_ghost.clear();
        }
        self.unpinned.notify_all();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let (dirty, pinned) = state
            .pieces
            .values()
            .fold((0, 0), |(d, p), pe| (d + pe.num_dirty, p + pe.num_pinned));
        let lists = &state.lists;
        CacheStats {
            capacity: state.capacity,
            resident_blocks: state.resident(),
            dirty_blocks: dirty,
            pinned_blocks: pinned,
            pieces: state.pieces.len(),
            mru_pieces: lists.mru.len(),
            mru_blocks: lists.mru.blocks(),
            mfu_pieces: lists.mfu.len(),
            mfu_blocks: lists.mfu.blocks(),
            mru_ghost_pieces: lists.mru_ghost.len(),
            mfu_ghost_pieces: lists.mfu_ghost.len(),
            write_pieces: lists.write.len(),
            write_blocks: lists.write.blocks(),
            volatile_pieces: lists.volatile.len(),
            volatile_blocks: lists.volatile.blocks(),
            arc_target: lists.p(),
            evicted_pieces: state.evicted_pieces,
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
        }
    }

    /// Per-piece snapshot, ordered by storage then piece.
    pub fn pieces_info(&self, storage: Option<StorageId>) -> Vec<CachedPieceInfo> {
        let state = self.state.lock();
        let mut info: Vec<CachedPieceInfo> = state
            .pieces
            .iter()
            .filter(|(k, _)| storage.map_or(true, |s| k.storage == s))
            .map(|(_, pe)| pe.info())
            .collect();
        info.sort_by_key(|i| (i.storage, i.piece));
        info
    }
}
