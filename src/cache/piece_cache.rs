use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use super::arc::CacheList;
use super::buffer_pool::BufferToken;
use crate::storage::{PieceIndex, StorageHandle, StorageId};

#[derive(Clone)]
pub enum HashState {
    V1(Sha1),
    V2(Sha256),
}

impl HashState {
    pub fn new_v1() -> Self {
        HashState::V1(Sha1::new())
    }

    pub fn new_v2() -> Self {
        HashState::V2(Sha256::new())
    }

    /// Picks the algorithm matching the length of the expected digest.
    pub fn for_expected(expected: Option<&[u8]>) -> Self {
        match expected {
            Some(hash) if hash.len() == 32 => Self::new_v2(),
            _ => Self::new_v1(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashState::V1(h) => h.update(data),
            HashState::V2(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            HashState::V1(h) => h.finalize().to_vec(),
            HashState::V2(h) => h.finalize().to_vec(),
        }
    }
}

impl std::fmt::Debug for HashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashState::V1(_) => f.write_str("HashState::V1"),
            HashState::V2(_) => f.write_str("HashState::V2"),
        }
    }
}

/// Which cache a piece is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    ReadCache,
    WriteCache,
    VolatileReadCache,
}

impl From<CacheList> for PieceKind {
    fn from(list: CacheList) -> Self {
        match list {
            CacheList::Mru | CacheList::Mfu => PieceKind::ReadCache,
            CacheList::Write => PieceKind::WriteCache,
            CacheList::Volatile => PieceKind::VolatileReadCache,
        }
    }
}

/// Snapshot of one cached piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPieceInfo {
    pub storage: StorageId,
    pub piece: PieceIndex,
    /// One flag per block: resident or not.
    pub blocks: Vec<bool>,
    pub dirty: Vec<bool>,
    pub last_use: Instant,
    pub next_to_hash: usize,
    pub kind: PieceKind,
    pub need_readback: bool,
}

pub(crate) struct CachedBlock {
    pub data: Bytes,
    pub _token: Option<BufferToken>,
    pub refcount: u32,
    pub dirty: bool,
    pub flushing: bool,
}

impl CachedBlock {
    pub fn new(data: Bytes, token: Option<BufferToken>, dirty: bool) -> Self {
        Self {
            data,
            _token: token,
            refcount: 0,
            dirty,
            flushing: false,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount > 0
    }
}

pub(crate) struct CachedPiece {
    pub storage: StorageHandle,
    pub piece: PieceIndex,
    pub blocks: Vec<Option<CachedBlock>>,
    pub last_use: Instant,
    /// When the oldest dirty block still in the piece was written.
    pub dirty_since: Option<Instant>,
    pub list: CacheList,
    pub num_resident: usize,
    pub num_dirty: usize,
    pub num_pinned: usize,
    /// Blocks below this index have been fed to `hash`.
    pub next_to_hash: usize,
    pub hash: Option<HashState>,
    /// A hash job or the hasher currently owns `hash`.
    pub hashing: bool,
    /// A block above `next_to_hash` left the cache before it was hashed.
    pub need_readback: bool,
    /// Drop the piece as soon as its last pin goes away.
    pub marked_for_eviction: bool,
}

impl CachedPiece {
    pub fn new(storage: StorageHandle, piece: PieceIndex, num_blocks: usize, list: CacheList) -> Self {
        Self {
            storage,
            piece,
            blocks: (0..num_blocks).map(|_| None).collect(),
            last_use: Instant::now(),
            dirty_since: None,
            list,
            num_resident: 0,
            num_dirty: 0,
            num_pinned: 0,
            next_to_hash: 0,
            hash: None,
            hashing: false,
            need_readback: false,
            marked_for_eviction: false,
        }
    }

    pub fn block(&self, index: usize) -> Option<&CachedBlock> {
        self.blocks.get(index).and_then(|b| b.as_ref())
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut CachedBlock> {
        self.blocks.get_mut(index).and_then(|b| b.as_mut())
    }

    pub fn has_block(&self, index: usize) -> bool {
        self.block(index).is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.num_pinned > 0 || self.hashing
    }

    /// Nothing left worth keeping an entry for.
    pub fn is_empty(&self) -> bool {
        self.num_resident == 0 && self.hash.is_none() && !self.hashing
    }

    pub fn is_fully_hashed(&self) -> bool {
        self.next_to_hash >= self.blocks.len()
    }

    /// Pins a block. Returns true if it was not pinned before.
    pub fn pin(&mut self, index: usize) -> bool {
        let Some(block) = self.block_mut(index) else {
            return false;
        };
        block.refcount += 1;
        if block.refcount == 1 {
            self.num_pinned += 1;
            true
        } else {
            false
        }
    }

    /// Drops one pin. Returns true if the block became unpinned.
    pub fn unpin(&mut self, index: usize) -> bool {
        let Some(block) = self.block_mut(index) else {
            debug_assert!(false, "unpin of a missing block");
            return false;
        };
        debug_assert!(block.refcount > 0, "unpin of an unpinned block");
        block.refcount = block.refcount.saturating_sub(1);
        if block.refcount == 0 {
            self.num_pinned -= 1;
            true
        } else {
            false
        }
    }

    /// Stores a block, returning the one it replaced.
    ///
    /// Readers holding the old block keep their own reference to its data;
    /// their pins carry over to the new block.
    pub fn set_block(&mut self, index: usize, mut block: CachedBlock, now: Instant) -> Option<CachedBlock> {
        let dirty = block.dirty;
        if let Some(prev) = self.blocks[index].as_ref() {
            debug_assert!(!prev.flushing, "overwriting a block being flushed");
            block.refcount = prev.refcount;
        }
        let old = self.blocks[index].replace(block);
        match &old {
            Some(prev) => {
                if prev.dirty {
                    self.num_dirty -= 1;
                }
            }
            None => self.num_resident += 1,
        }
        if dirty {
            if self.num_dirty == 0 {
                self.dirty_since = Some(now);
            }
            self.num_dirty += 1;
        }
        old
    }

    /// Removes an unpinned block. Dirty data is discarded.
    pub fn take_block(&mut self, index: usize) -> Option<CachedBlock> {
        let block = self.blocks.get_mut(index)?.take()?;
        debug_assert!(!block.is_pinned(), "evicting a pinned block");
        self.num_resident -= 1;
        if block.dirty {
            self.mark_clean_count();
        }
        if index >= self.next_to_hash
            && !self.is_fully_hashed()
            && (self.list == CacheList::Write || self.hash.is_some())
        {
            self.need_readback = true;
        }
        Some(block)
    }

    pub fn mark_block_clean(&mut self, index: usize) {
        if let Some(block) = self.block_mut(index) {
            if block.dirty {
                block.dirty = false;
                self.mark_clean_count();
            }
        }
    }

    fn mark_clean_count(&mut self) {
        self.num_dirty -= 1;
        if self.num_dirty == 0 {
            self.dirty_since = None;
        }
    }

    /// Feeds resident blocks from `next_to_hash` onward into `state` until
    /// the first gap.
    pub fn advance_hash(&mut self, state: &mut HashState) {
        while let Some(block) = self.block(self.next_to_hash) {
            state.update(&block.data);
            self.next_to_hash += 1;
        }
    }

    /// Dirty, not-yet-flushing blocks matching `filter`, by index.
    pub fn dirty_blocks(&self, filter: impl Fn(usize) -> bool) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(i, b)| {
                b.as_ref()
                    .map(|b| b.dirty && !b.flushing)
                    .unwrap_or(false)
                    && filter(*i)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn info(&self) -> CachedPieceInfo {
        CachedPieceInfo {
            storage: self.storage.id(),
            piece: self.piece,
            blocks: self.blocks.iter().map(|b| b.is_some()).collect(),
            dirty: self
                .blocks
                .iter()
                .map(|b| b.as_ref().map(|b| b.dirty).unwrap_or(false))
                .collect(),
            last_use: self.last_use,
            next_to_hash: self.next_to_hash,
            kind: self.list.into(),
            need_readback: self.need_readback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ZeroStorage;

    fn piece(num_blocks: usize) -> CachedPiece {
        let storage = StorageHandle::new(StorageId(1), ZeroStorage::new(64, 64));
        CachedPiece::new(storage, 0, num_blocks, CacheList::Write)
    }

    #[test]
    fn test_hash_state_selects_algorithm() {
        assert!(matches!(HashState::for_expected(None), HashState::V1(_)));
        assert!(matches!(
            HashState::for_expected(Some(&[0u8; 20])),
            HashState::V1(_)
        ));
        assert!(matches!(
            HashState::for_expected(Some(&[0u8; 32])),
            HashState::V2(_)
        ));
    }

    #[test]
    fn test_advance_hash_stops_at_gap() {
        let now = Instant::now();
        let mut pe = piece(4);
        pe.set_block(0, CachedBlock::new(Bytes::from_static(b"a"), None, true), now);
        pe.set_block(1, CachedBlock::new(Bytes::from_static(b"b"), None, true), now);
        pe.set_block(3, CachedBlock::new(Bytes::from_static(b"d"), None, true), now);

        let mut state = HashState::new_v1();
        pe.advance_hash(&mut state);
        assert_eq!(pe.next_to_hash, 2);

        let mut expected = HashState::new_v1();
        expected.update(b"ab");
        assert_eq!(state.finalize(), expected.finalize());
    }

    #[test]
    fn test_counters_follow_blocks() {
        let now = Instant::now();
        let mut pe = piece(2);
        pe.set_block(0, CachedBlock::new(Bytes::from_static(b"x"), None, true), now);
        assert_eq!((pe.num_resident, pe.num_dirty), (1, 1));
        assert_eq!(pe.dirty_since, Some(now));

        assert!(pe.pin(0));
        assert!(!pe.pin(0));
        assert!(!pe.unpin(0));
        assert!(pe.unpin(0));
        assert_eq!(pe.num_pinned, 0);

        pe.mark_block_clean(0);
        assert_eq!(pe.num_dirty, 0);
        assert_eq!(pe.dirty_since, None);
        assert!(pe.take_block(0).is_some());
        assert!(pe.is_empty());
    }

    #[test]
    fn test_evicting_unhashed_block_needs_readback() {
        let now = Instant::now();
        let mut pe = piece(3);
        for i in 0..2 {
            pe.set_block(i, CachedBlock::new(Bytes::from_static(b"z"), None, false), now);
        }
        pe.next_to_hash = 1;
        pe.hash = Some(HashState::new_v1());

        pe.take_block(0);
        assert!(!pe.need_readback);
        pe.take_block(1);
        assert!(pe.need_readback);
    }
}
