//! List bookkeeping for the adaptive replacement cache.
//!
//! Resident pieces live in exactly one [`LruList`]; evicted read pieces are
//! remembered by identity in a [`GhostList`]. The lists only hold keys, the
//! piece data itself is owned by the block cache.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::storage::{PieceIndex, StorageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceKey {
    pub storage: StorageId,
    pub piece: PieceIndex,
}

impl PieceKey {
    pub fn new(storage: StorageId, piece: PieceIndex) -> Self {
        Self { storage, piece }
    }
}

/// The list a cached piece belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheList {
    /// Read pieces seen once.
    Mru,
    /// Read pieces seen more than once.
    Mfu,
    /// Pieces with dirty blocks, or blocks written and not yet evicted.
    Write,
    /// Read pieces that are evicted first and never promoted.
    Volatile,
}

/// Recency-ordered set of piece keys. Iteration yields the oldest entry
/// first; ties on `last_use` go to the lower (storage, piece) key.
#[derive(Debug, Default)]
pub struct LruList {
    order: BTreeSet<(Instant, PieceKey)>,
    index: HashMap<PieceKey, Instant>,
    blocks: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &PieceKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn insert(&mut self, key: PieceKey, last_use: Instant) {
        if let Some(old) = self.index.insert(key, last_use) {
            self.order.remove(&(old, key));
        }
        self.order.insert((last_use, key));
    }

    pub fn remove(&mut self, key: &PieceKey) -> bool {
        match self.index.remove(key) {
            Some(at) => {
                self.order.remove(&(at, *key));
                true
            }
            None => false,
        }
    }

    /// Moves `key` to the most recent end.
    pub fn touch(&mut self, key: &PieceKey, now: Instant) {
        if self.contains(key) {
            self.insert(*key, now);
        }
    }

    pub fn iter_oldest(&self) -> impl Iterator<Item = PieceKey> + '_ {
        self.order.iter().map(|&(_, key)| key)
    }

    /// Resident blocks of the pieces in this list.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn add_blocks(&mut self, n: usize) {
        self.blocks += n;
    }

    pub fn sub_blocks(&mut self, n: usize) {
        debug_assert!(self.blocks >= n, "list block count underflow");
        self.blocks = self.blocks.saturating_sub(n);
    }
}

/// Bounded FIFO of evicted piece keys.
#[derive(Debug)]
pub struct GhostList {
    keys: VecDeque<PieceKey>,
    set: HashSet<PieceKey>,
    limit: usize,
}

impl GhostList {
    pub fn new(limit: usize) -> Self {
        Self {
            keys: VecDeque::new(),
            set: HashSet::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn contains(&self, key: &PieceKey) -> bool {
        self.set.contains(key)
    }

    pub fn insert(&mut self, key: PieceKey) {
        if self.set.insert(key) {
            self.keys.push_back(key);
        }
        self.expire();
    }

    pub fn remove(&mut self, key: &PieceKey) -> bool {
        if self.set.remove(key) {
            self.keys.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn remove_storage(&mut self, storage: StorageId) {
        self.keys.retain(|k| k.storage != storage);
        self.set.retain(|k| k.storage != storage);
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        self.expire();
    }

    fn expire(&mut self) {
        while self.set.len() > self.limit {
            match self.keys.pop_front() {
                Some(key) => {
                    self.set.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.set.clear();
    }
}

/// All cache lists plus the ARC target size `p` for the MRU side, in blocks.
#[derive(Debug)]
pub struct ArcLists {
    pub mru: LruList,
    pub mfu: LruList,
    pub write: LruList,
    pub volatile: LruList,
    pub mru_ghost: GhostList,
    pub mfu_ghost: GhostList,
    p: usize,
}

impl ArcLists {
    pub fn new(ghost_limit: usize) -> Self {
        Self {
            mru: LruList::new(),
            mfu: LruList::new(),
            write: LruList::new(),
            volatile: LruList::new(),
            mru_ghost: GhostList::new(ghost_limit),
            mfu_ghost: GhostList::new(ghost_limit),
            p: 0,
        }
    }

    pub fn list(&self, list: CacheList) -> &LruList {
        match list {
            CacheList::Mru => &self.mru,
            CacheList::Mfu => &self.mfu,
            CacheList::Write => &self.write,
            CacheList::Volatile => &self.volatile,
        }
    }

    pub fn list_mut(&mut self, list: CacheList) -> &mut LruList {
        match list {
            CacheList::Mru => &mut self.mru,
            CacheList::Mfu => &mut self.mfu,
            CacheList::Write => &mut self.write,
            CacheList::Volatile => &mut self.volatile,
        }
    }

    /// Moves a piece between lists, carrying its resident block count.
    pub fn relink(
        &mut self,
        key: PieceKey,
        from: CacheList,
        to: CacheList,
        blocks: usize,
        now: Instant,
    ) {
        let src = self.list_mut(from);
        src.remove(&key);
        src.sub_blocks(blocks);
        let dst = self.list_mut(to);
        dst.insert(key, now);
        dst.add_blocks(blocks);
    }

    pub fn p(&self) -> usize {
        self.p
    }

    /// Registers a miss on a piece that may still be remembered by a ghost
    /// list. Returns true if it was, adjusting `p` towards the side that
    /// would have kept it.
    pub fn ghost_hit(&mut self, key: &PieceKey, piece_blocks: usize, capacity: usize) -> bool {
        let b1 = self.mru_ghost.len();
        let b2 = self.mfu_ghost.len();
        if self.mru_ghost.remove(key) {
            let delta = if b1 >= b2 { 1 } else { b2 / b1.max(1) };
            self.adapt_p((delta * piece_blocks) as isize, capacity);
            true
        } else if self.mfu_ghost.remove(key) {
            let delta = if b2 >= b1 { 1 } else { b1 / b2.max(1) };
            self.adapt_p(-((delta * piece_blocks) as isize), capacity);
            true
        } else {
            false
        }
    }

    fn adapt_p(&mut self, delta: isize, capacity: usize) {
        let new_p = (self.p as isize + delta).clamp(0, capacity as isize);
        self.p = new_p as usize;
    }

    /// The ARC list to evict from first.
    pub fn preferred_victim_list(&self) -> CacheList {
        if self.mfu.is_empty() || (self.mru.blocks() > self.p && !self.mru.is_empty()) {
            CacheList::Mru
        } else {
            CacheList::Mfu
        }
    }

    /// Remembers an evicted piece.
    pub fn remember(&mut self, key: PieceKey, from: CacheList) {
        match from {
            CacheList::Mfu => self.mfu_ghost.insert(key),
            CacheList::Mru | CacheList::Write => self.mru_ghost.insert(key),
            CacheList::Volatile => {}
        }
    }

    pub fn set_ghost_limit(&mut self, limit: usize) {
        self.mru_ghost.set_limit(limit);
        self.mfu_ghost.set_limit(limit);
    }

    pub fn clamp_p(&mut self, capacity: usize) {
        self.p = self.p.min(capacity);
    }

    pub fn clear(&mut self) {
        let limit = self.mru_ghost.limit;
        *self = Self::new(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(piece: PieceIndex) -> PieceKey {
        PieceKey::new(StorageId(1), piece)
    }

    #[test]
    fn test_lru_orders_by_last_use_then_piece() {
        let now = Instant::now();
        let mut list = LruList::new();
        list.insert(key(5), now);
        list.insert(key(2), now);
        list.insert(key(9), now - Duration::from_secs(1));

        let order: Vec<_> = list.iter_oldest().map(|k| k.piece).collect();
        assert_eq!(order, vec![9, 2, 5]);

        list.touch(&key(9), now + Duration::from_secs(1));
        let order: Vec<_> = list.iter_oldest().map(|k| k.piece).collect();
        assert_eq!(order, vec![2, 5, 9]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_lru_ties_break_on_storage_before_piece() {
        let now = Instant::now();
        let mut list = LruList::new();
        list.insert(PieceKey::new(StorageId(2), 0), now);
        list.insert(PieceKey::new(StorageId(1), 7), now);
        list.insert(PieceKey::new(StorageId(1), 3), now);

        let order: Vec<_> = list.iter_oldest().map(|k| (k.storage, k.piece)).collect();
        assert_eq!(order, vec![(StorageId(1), 3), (StorageId(1), 7), (StorageId(2), 0)]);
    }

    #[test]
    fn test_ghost_list_is_bounded() {
        let mut ghost = GhostList::new(2);
        ghost.insert(key(1));
        ghost.insert(key(2));
        ghost.insert(key(3));

        assert_eq!(ghost.len(), 2);
        assert!(!ghost.contains(&key(1)));
        assert!(ghost.contains(&key(3)));
    }

    #[test]
    fn test_ghost_hits_move_p() {
        let mut lists = ArcLists::new(8);
        lists.remember(key(1), CacheList::Mru);
        lists.remember(key(2), CacheList::Mfu);

        assert!(lists.ghost_hit(&key(1), 4, 100));
        assert_eq!(lists.p(), 4);
        assert!(lists.ghost_hit(&key(2), 4, 100));
        assert_eq!(lists.p(), 0);
        assert!(!lists.ghost_hit(&key(3), 4, 100));
    }

    #[test]
    fn test_volatile_pieces_leave_no_ghost() {
        let mut lists = ArcLists::new(8);
        lists.remember(key(1), CacheList::Volatile);
        assert!(lists.mru_ghost.is_empty());
        assert!(lists.mfu_ghost.is_empty());
    }

    #[test]
    fn test_relink_moves_block_counts() {
        let now = Instant::now();
        let mut lists = ArcLists::new(8);
        lists.mru.insert(key(1), now);
        lists.mru.add_blocks(3);

        lists.relink(key(1), CacheList::Mru, CacheList::Mfu, 3, now);
        assert_eq!(lists.mru.blocks(), 0);
        assert_eq!(lists.mfu.blocks(), 3);
        assert!(lists.mfu.contains(&key(1)));
    }
}
