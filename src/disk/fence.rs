//! Per-storage fencing.
//!
//! A storage is `Open` while only ordinary jobs run on it. Admitting a fence
//! job moves it to `Draining` until every job admitted before the fence has
//! finished, then to `Exclusive` while the fence runs. Jobs arriving in
//! either state wait in the storage's blocked list and are re-admitted in
//! submission order once the fence completes.

use std::collections::{HashMap, VecDeque};

use super::job::{Job, JobKind};
use crate::storage::{StorageError, StorageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Open,
    Draining,
    Exclusive,
}

#[derive(Debug)]
struct StorageFence {
    state: FenceState,
    /// Admitted ordinary jobs that have not finished executing.
    in_flight: usize,
    /// Waiting jobs. While draining, the front is the fence being waited for.
    blocked: VecDeque<Job>,
}

impl StorageFence {
    fn new() -> Self {
        Self {
            state: FenceState::Open,
            in_flight: 0,
            blocked: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.state == FenceState::Open && self.in_flight == 0 && self.blocked.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct FenceTable {
    storages: HashMap<StorageId, StorageFence>,
    /// Fences that ran to completion.
    fences_run: u64,
}

impl FenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a job. Returns it if it may be dispatched now; otherwise it is
    /// kept until [`FenceTable::fence_complete`] releases it.
    pub fn admit(&mut self, job: Job) -> Option<Job> {
        let Some(storage) = job.storage_id() else {
            return Some(job);
        };
        let entry = self.storages.entry(storage).or_insert_with(StorageFence::new);
        if entry.state != FenceState::Open || !entry.blocked.is_empty() {
            tracing::trace!(job = job.id, kind = %job.kind(), %storage, "job blocked by fence");
            entry.blocked.push_back(job);
            return None;
        }
        Self::admit_open(storage, entry, job)
    }

    fn admit_open(storage: StorageId, entry: &mut StorageFence, job: Job) -> Option<Job> {
        if !job.is_fence() {
            entry.in_flight += 1;
            return Some(job);
        }
        if entry.in_flight == 0 {
            tracing::trace!(job = job.id, kind = %job.kind(), %storage, "fence exclusive");
            entry.state = FenceState::Exclusive;
            Some(job)
        } else {
            tracing::trace!(
                job = job.id,
                kind = %job.kind(),
                %storage,
                in_flight = entry.in_flight,
                "fence draining"
            );
            entry.state = FenceState::Draining;
            entry.blocked.push_front(job);
            None
        }
    }

    /// Records that an ordinary job finished executing. Returns the fence
    /// that may now run, if this was the last job it waited for.
    pub fn job_complete(&mut self, storage: StorageId) -> Option<Job> {
        let entry = self.storages.get_mut(&storage)?;
        debug_assert!(entry.in_flight > 0, "job completion without admission");
        entry.in_flight = entry.in_flight.saturating_sub(1);

        let mut ready = None;
        if entry.in_flight == 0 && entry.state == FenceState::Draining {
            ready = entry.blocked.pop_front();
            debug_assert!(
                ready.as_ref().is_some_and(|j| j.is_fence()),
                "draining storage without a fence"
            );
            entry.state = FenceState::Exclusive;
            tracing::trace!(%storage, "fence exclusive");
        }
        if entry.is_idle() {
            self.storages.remove(&storage);
        }
        ready
    }

    /// Reopens a storage after its fence finished and returns the jobs that
    /// may be dispatched, in submission order. Re-admission stops at the next
    /// fence, which then drains or runs exclusively itself.
    pub fn fence_complete(&mut self, storage: StorageId) -> Vec<Job> {
        let mut released = Vec::new();
        let Some(entry) = self.storages.get_mut(&storage) else {
            return released;
        };
        debug_assert_eq!(entry.state, FenceState::Exclusive, "fence completion while not exclusive");
        self.fences_run += 1;
        entry.state = FenceState::Open;

        while let Some(job) = entry.blocked.pop_front() {
            let fence = job.is_fence();
            if let Some(job) = Self::admit_open(storage, entry, job) {
                released.push(job);
            }
            if fence {
                break;
            }
        }
        tracing::trace!(%storage, released = released.len(), "fence released");
        if entry.is_idle() {
            self.storages.remove(&storage);
        }
        released
    }

    /// Removes blocked jobs of `kind` for a storage, failing each with
    /// [`StorageError::FencedOut`]. A fence being drained for is kept.
    pub fn drop_blocked(&mut self, storage: StorageId, kind: JobKind) -> Vec<Job> {
        let Some(entry) = self.storages.get_mut(&storage) else {
            return Vec::new();
        };
        let mut dropped = Vec::new();
        let mut kept = VecDeque::with_capacity(entry.blocked.len());
        for mut job in entry.blocked.drain(..) {
            if job.kind() == kind {
                job.fail(StorageError::FencedOut(storage));
                dropped.push(job);
            } else {
                kept.push_back(job);
            }
        }
        entry.blocked = kept;
        dropped
    }

    /// Takes every blocked job and forgets all fence state.
    pub fn drain(&mut self) -> Vec<Job> {
        self.storages
            .drain()
            .flat_map(|(_, entry)| entry.blocked)
            .collect()
    }

    #[cfg(test)]
    pub fn state(&self, storage: StorageId) -> FenceState {
        self.storages
            .get(&storage)
            .map_or(FenceState::Open, |entry| entry.state)
    }

    pub fn blocked_jobs(&self) -> usize {
        self.storages.values().map(|e| e.blocked.len()).sum()
    }

    pub fn fences_run(&self) -> u64 {
        self.fences_run
    }
}
