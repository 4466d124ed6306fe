use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use super::context::CompletionContext;
use super::fence::FenceTable;
use super::job::{Action, Job, JobFlags, JobId, JobKind, Op, PeerRequest, WriteArgs};
use super::settings::{DiskSettings, SettingsError};
use super::stats::{DiskCounters, DiskStats};
use super::thread_pool::{JobQueue, PoolKind};
use crate::cache::{
    BlockCache, BlockRef, BufferAllocator, CachedPieceInfo, DiskBuffer, DiskObserver,
};
use crate::constants::CACHE_TICK_INTERVAL;
use crate::storage::{
    CheckStatus, FileIndex, FilePool, MoveFlags, PieceIndex, ResumeData, Storage, StorageError,
    StorageHandle, StorageId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrimState {
    Idle,
    Queued,
    Running,
    /// Another trim was requested while one was running.
    Reinvoke,
}

/// Everything guarded by the job mutex.
pub(super) struct JobState {
    pub fences: FenceTable,
    generic: JobQueue,
    hash: JobQueue,
    trim: TrimState,
    aborting: bool,
    cleaned_up: bool,
}

impl JobState {
    fn queue_mut(&mut self, pool: PoolKind) -> &mut JobQueue {
        match pool {
            PoolKind::Generic => &mut self.generic,
            PoolKind::Hash => &mut self.hash,
        }
    }

    fn total_threads(&self) -> usize {
        self.generic.threads() + self.hash.threads()
    }
}

#[derive(Default)]
struct Completions {
    jobs: Vec<Job>,
    posted: bool,
}

enum Wake {
    Job(Job),
    Tick,
    Exit { cleanup: bool },
}

pub(super) struct Shared {
    pub settings: RwLock<DiskSettings>,
    pub cache: Arc<BlockCache>,
    pub allocator: Arc<BufferAllocator>,
    pub files: Arc<FilePool>,
    pub counters: DiskCounters,
    jobs: Mutex<JobState>,
    generic_ready: Condvar,
    hash_ready: Condvar,
    submitted: Mutex<Vec<Job>>,
    completions: Mutex<Completions>,
    context: Arc<dyn CompletionContext>,
    aborting: AtomicBool,
    next_job: AtomicU64,
    last_tick: Mutex<Instant>,
}

/// The disk I/O subsystem.
///
/// Jobs are queued with the `async_*` methods, handed to the worker pools by
/// [`DiskIoThread::submit_jobs`], and completed by calling their handler on
/// the [`CompletionContext`] given at construction. Every handler is called
/// exactly once, including for jobs cancelled by [`DiskIoThread::abort`].
///
/// Dropping the disk I/O thread aborts it and waits for its workers.
pub struct DiskIoThread {
    shared: Arc<Shared>,
    next_storage: AtomicU64,
}

impl DiskIoThread {
    pub fn new(
        settings: DiskSettings,
        context: Arc<dyn CompletionContext>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        let files = Arc::new(FilePool::new(settings.file_pool_size));
        let cache = BlockCache::new(
            files.clone(),
            settings.block_size,
            settings.cache_size,
            settings.ghost_limit(),
        );
        let allocator = BufferAllocator::new(settings.block_size, settings.cache_size);

        let shared = Arc::new(Shared {
            jobs: Mutex::new(JobState {
                fences: FenceTable::new(),
                generic: JobQueue::new(PoolKind::Generic, settings.aio_threads),
                hash: JobQueue::new(PoolKind::Hash, settings.hashing_threads),
                trim: TrimState::Idle,
                aborting: false,
                cleaned_up: false,
            }),
            settings: RwLock::new(settings),
            cache,
            allocator,
            files,
            counters: DiskCounters::default(),
            generic_ready: Condvar::new(),
            hash_ready: Condvar::new(),
            submitted: Mutex::new(Vec::new()),
            completions: Mutex::new(Completions::default()),
            context,
            aborting: AtomicBool::new(false),
            next_job: AtomicU64::new(1),
            last_tick: Mutex::new(Instant::now()),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        shared.allocator.budget().set_ready_hook(move || {
            if let Some(shared) = weak.upgrade() {
                shared.request_delivery();
            }
        });

        {
            let mut jobs = shared.jobs.lock();
            shared.spawn_minimum(&mut jobs);
        }
        tracing::debug!("disk I/O thread started");
        Ok(Self {
            shared,
            next_storage: AtomicU64::new(1),
        })
    }

    /// Registers a storage backend and returns the handle jobs are queued
    /// against.
    pub fn add_storage(&self, backend: impl Storage + 'static) -> StorageHandle {
        let id = StorageId(self.next_storage.fetch_add(1, Ordering::Relaxed));
        StorageHandle::new(id, backend)
    }

    pub fn block_size(&self) -> usize {
        self.shared.cache.block_size()
    }

    pub fn settings(&self) -> DiskSettings {
        self.shared.settings.read().clone()
    }

    /// Applies new settings. The block size is fixed at construction.
    pub fn set_settings(&self, settings: DiskSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        if settings.block_size != self.shared.cache.block_size() {
            return Err(SettingsError::BlockSizeFixed(self.shared.cache.block_size()));
        }

        self.shared
            .cache
            .set_capacity(settings.cache_size, settings.ghost_limit());
        self.shared.allocator.budget().set_limit(settings.cache_size);
        self.shared.files.set_capacity(settings.file_pool_size);
        {
            let mut jobs = self.shared.jobs.lock();
            jobs.generic.set_limits(settings.aio_threads);
            jobs.hash.set_limits(settings.hashing_threads);
            *self.shared.settings.write() = settings;
            if !jobs.aborting {
                self.shared.spawn_minimum(&mut jobs);
            }
        }
        // let surplus workers notice they should retire
        self.shared.generic_ready.notify_all();
        self.shared.hash_ready.notify_all();
        if self.shared.cache.is_over_capacity() {
            self.shared.trigger_trim();
        }
        Ok(())
    }

    /// Allocates a disk buffer for a write. When the budget is exhausted the
    /// observer is notified once, on the completion context, when a buffer
    /// may be available again.
    pub fn allocate_buffer(
        &self,
        category: &'static str,
        observer: Option<&Arc<dyn DiskObserver>>,
    ) -> Result<DiskBuffer, StorageError> {
        let result = self.shared.allocator.allocate(category, observer);
        if result.is_err() {
            self.shared.trigger_trim();
        }
        result
    }

    pub fn async_read(
        &self,
        storage: &StorageHandle,
        request: PeerRequest,
        flags: JobFlags,
        handler: impl FnOnce(Result<BlockRef, StorageError>) + Send + 'static,
    ) {
        self.shared
            .queue_job(Some(storage), flags, Action::Read(Op::new(request, handler)));
    }

    pub fn async_write(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        offset: u32,
        buffer: DiskBuffer,
        flags: JobFlags,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let args = WriteArgs {
            piece,
            offset,
            buffer,
        };
        self.shared
            .queue_job(Some(storage), flags, Action::Write(Op::new(args, handler)));
    }

    /// Hashes a piece. The result is the digest; if the storage knows the
    /// expected hash, a mismatch fails with [`StorageError::HashMismatch`].
    pub fn async_hash(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        flags: JobFlags,
        handler: impl FnOnce(Result<Vec<u8>, StorageError>) + Send + 'static,
    ) {
        self.shared
            .queue_job(Some(storage), flags, Action::Hash(Op::new(piece, handler)));
    }

    pub fn async_move_storage(
        &self,
        storage: &StorageHandle,
        dest: impl Into<PathBuf>,
        flags: MoveFlags,
        handler: impl FnOnce(Result<PathBuf, StorageError>) + Send + 'static,
    ) {
        let action = Action::MoveStorage(Op::new((dest.into(), flags), handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_release_files(
        &self,
        storage: &StorageHandle,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::ReleaseFiles(Op::new((), handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_delete_files(
        &self,
        storage: &StorageHandle,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::DeleteFiles(Op::new((), handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_check_files(
        &self,
        storage: &StorageHandle,
        resume: Option<ResumeData>,
        handler: impl FnOnce(Result<CheckStatus, StorageError>) + Send + 'static,
    ) {
        let action = Action::CheckFiles(Op::new(resume, handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_rename_file(
        &self,
        storage: &StorageHandle,
        index: FileIndex,
        name: impl Into<String>,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::RenameFile(Op::new((index, name.into()), handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    /// Stops a storage: hash jobs that have not started fail with
    /// [`StorageError::FencedOut`], then the write cache is flushed, cached
    /// pieces are dropped and files closed.
    pub fn async_stop_torrent(
        &self,
        storage: &StorageHandle,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::StopTorrent(Op::new((), handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_flush_piece(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::FlushPiece(Op::new(piece, handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_set_file_priority(
        &self,
        storage: &StorageHandle,
        priorities: Vec<u8>,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::SetFilePriority(Op::new(priorities, handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    pub fn async_clear_piece(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        handler: impl FnOnce(Result<(), StorageError>) + Send + 'static,
    ) {
        let action = Action::ClearPiece(Op::new(piece, handler));
        self.shared.queue_job(Some(storage), JobFlags::default(), action);
    }

    /// Drops a piece's cached blocks and hash state right away, without
    /// flushing. Meant for cleanup after a failed hash, when no job still
    /// references the piece. Returns false if pinned blocks keep part of the
    /// piece alive until they are released.
    pub fn clear_piece(&self, storage: &StorageHandle, piece: PieceIndex) -> bool {
        self.shared.cache.clear_piece(storage.id(), piece)
    }

    /// Hands every job queued since the last call to the worker pools.
    pub fn submit_jobs(&self) {
        self.shared.submit_jobs();
    }

    /// Shuts the disk I/O thread down. Queued jobs fail with
    /// [`StorageError::Cancelled`], as does every job queued afterwards.
    /// Running jobs finish normally. With `wait`, blocks until every worker
    /// has exited; must then not be called from a completion handler running
    /// on a worker-owned context.
    pub fn abort(&self, wait: bool) {
        self.shared.abort(wait);
    }

    /// Snapshot of the cache, queues and counters. Average times restart
    /// from zero after each call.
    pub fn stats(&self) -> DiskStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        let cache = shared.cache.stats();
        let pending_submissions = shared.submitted.lock().len();
        let jobs = shared.jobs.lock();
        DiskStats {
            blocks_written: cache.blocks_written,
            cache,
            buffers_in_use: shared.allocator.in_use(),
            buffer_limit: shared.allocator.budget().limit(),
            waiting_observers: shared.allocator.budget().waiting_observers(),
            queued_jobs: jobs.generic.len() + jobs.hash.len(),
            queued_hash_jobs: jobs.hash.len(),
            blocked_jobs: jobs.fences.blocked_jobs(),
            pending_submissions,
            peak_queued: jobs.generic.peak_queued().max(jobs.hash.peak_queued()),
            generic_threads: jobs.generic.threads(),
            hash_threads: jobs.hash.threads(),
            open_files: shared.files.len(),
            avg_job_time: counters.job_time.take_average(),
            avg_read_time: counters.read_time.take_average(),
            avg_write_time: counters.write_time.take_average(),
            avg_hash_time: counters.hash_time.take_average(),
            cumulative_job_time: counters.job_time.cumulative(),
            cumulative_read_time: counters.read_time.cumulative(),
            cumulative_write_time: counters.write_time.cumulative(),
            cumulative_hash_time: counters.hash_time.cumulative(),
            blocks_read: counters.blocks_read.load(Ordering::Relaxed),
            read_hits: counters.read_hits.load(Ordering::Relaxed),
            read_back: counters.read_back.load(Ordering::Relaxed),
            jobs: counters.jobs(),
            failed_jobs: counters.failed_jobs.load(Ordering::Relaxed),
            fences_run: jobs.fences.fences_run(),
        }
    }

    /// Per-piece view of the cache, for one storage or all of them.
    pub fn cache_info(&self, storage: Option<&StorageHandle>) -> Vec<CachedPieceInfo> {
        self.shared.cache.pieces_info(storage.map(|s| s.id()))
    }
}

impl Drop for DiskIoThread {
    fn drop(&mut self) {
        self.shared.abort(true);
    }
}

impl Shared {
    fn queue_job(self: &Arc<Self>, storage: Option<&StorageHandle>, flags: JobFlags, action: Action) {
        let id: JobId = self.next_job.fetch_add(1, Ordering::Relaxed);
        let mut job = Job::new(id, storage.cloned(), flags, action);
        if self.aborting.load(Ordering::Acquire) {
            job.fail(StorageError::Cancelled);
            self.push_completion(job);
            return;
        }
        tracing::trace!(job = id, kind = %job.kind(), storage = ?job.storage_id(), "job queued");
        self.submitted.lock().push(job);
    }

    fn submit_jobs(self: &Arc<Self>) {
        let submitted = std::mem::take(&mut *self.submitted.lock());
        if submitted.is_empty() {
            return;
        }
        let mut finished = Vec::new();
        {
            let mut jobs = self.jobs.lock();
            for mut job in submitted {
                if jobs.aborting {
                    job.fail(StorageError::Cancelled);
                    finished.push(job);
                    continue;
                }
                if job.kind() == JobKind::StopTorrent {
                    finished.extend(self.drop_queued_hashes(&mut jobs, &job));
                }
                if let Some(job) = jobs.fences.admit(job) {
                    self.dispatch(&mut jobs, job);
                }
            }
        }
        for job in finished {
            self.push_completion(job);
        }
    }

    /// Fails hash jobs of the stopping storage that have not started.
    fn drop_queued_hashes(self: &Arc<Self>, jobs: &mut JobState, stop: &Job) -> Vec<Job> {
        let Some(storage) = stop.storage_id() else {
            return Vec::new();
        };
        let is_hash = |job: &Job| job.kind() == JobKind::Hash && job.storage_id() == Some(storage);
        let mut dropped = jobs.generic.remove_where(is_hash);
        dropped.extend(jobs.hash.remove_where(is_hash));
        for job in &mut dropped {
            job.fail(StorageError::FencedOut(storage));
        }
        for _ in 0..dropped.len() {
            if let Some(fence) = jobs.fences.job_complete(storage) {
                self.dispatch(jobs, fence);
            }
        }
        dropped.extend(jobs.fences.drop_blocked(storage, JobKind::Hash));
        if !dropped.is_empty() {
            tracing::debug!(%storage, dropped = dropped.len(), "dropped queued hash jobs");
        }
        dropped
    }

    fn pool_for(&self, job: &Job) -> PoolKind {
        if job.kind() == JobKind::Hash && !self.settings.read().routes_hashes_to_generic() {
            PoolKind::Hash
        } else {
            PoolKind::Generic
        }
    }

    fn condvar(&self, pool: PoolKind) -> &Condvar {
        match pool {
            PoolKind::Generic => &self.generic_ready,
            PoolKind::Hash => &self.hash_ready,
        }
    }

    fn dispatch(self: &Arc<Self>, jobs: &mut JobState, job: Job) {
        let pool = self.pool_for(&job);
        tracing::trace!(job = job.id, kind = %job.kind(), ?pool, "job dispatched");
        jobs.queue_mut(pool).push(job);
        if jobs.queue_mut(pool).wants_worker() {
            self.spawn_worker(jobs, pool);
        }
        self.condvar(pool).notify_one();
    }

    fn spawn_worker(self: &Arc<Self>, jobs: &mut JobState, pool: PoolKind) {
        let shared = self.clone();
        if let Err(e) = jobs.queue_mut(pool).spawn(move || shared.worker_loop(pool)) {
            tracing::warn!(?pool, "failed to spawn disk thread: {}", e);
        }
    }

    fn spawn_minimum(self: &Arc<Self>, jobs: &mut JobState) {
        for pool in [PoolKind::Generic, PoolKind::Hash] {
            while jobs.queue_mut(pool).below_minimum() {
                let before = jobs.queue_mut(pool).threads();
                self.spawn_worker(jobs, pool);
                if jobs.queue_mut(pool).threads() == before {
                    break;
                }
            }
        }
    }

    fn worker_loop(self: Arc<Self>, pool: PoolKind) {
        let mut idle_since = Instant::now();
        loop {
            match self.next_job(pool, idle_since) {
                Wake::Job(job) => {
                    self.run_job(job);
                    idle_since = Instant::now();
                    if pool == PoolKind::Generic {
                        self.maybe_maintain();
                    }
                }
                Wake::Tick => {
                    if pool == PoolKind::Generic {
                        self.maybe_maintain();
                    }
                }
                Wake::Exit { cleanup } => {
                    tracing::debug!(?pool, "disk thread exiting");
                    if cleanup {
                        self.shutdown_cleanup();
                    }
                    return;
                }
            }
        }
    }

    fn next_job(&self, pool: PoolKind, idle_since: Instant) -> Wake {
        let timeout = self.settings.read().thread_idle_timeout;
        let mut jobs = self.jobs.lock();
        loop {
            if let Some(job) = jobs.queue_mut(pool).pop() {
                return Wake::Job(job);
            }
            let retire = jobs.aborting
                || jobs
                    .queue_mut(pool)
                    .should_retire(idle_since.elapsed(), timeout);
            if retire {
                jobs.queue_mut(pool).retire();
                let cleanup = jobs.aborting && jobs.total_threads() == 0 && !jobs.cleaned_up;
                if cleanup {
                    jobs.cleaned_up = true;
                }
                return Wake::Exit { cleanup };
            }

            jobs.queue_mut(pool).park();
            let wait = timeout.min(CACHE_TICK_INTERVAL);
            let timed_out = self.condvar(pool).wait_for(&mut jobs, wait).timed_out();
            jobs.queue_mut(pool).unpark();
            if timed_out {
                return Wake::Tick;
            }
        }
    }

    fn run_job(self: &Arc<Self>, mut job: Job) {
        let kind = job.kind();
        let storage = job.storage_id();
        let started = Instant::now();
        let waited = started.saturating_duration_since(job.queued_at);
        self.execute(&mut job);
        let elapsed = started.elapsed();
        self.counters
            .record_job(kind, elapsed, job.action.succeeded());
        tracing::trace!(job = job.id, %kind, ?waited, ?elapsed, "job executed");

        if kind == JobKind::TrimCache {
            self.trim_finished();
            return;
        }
        let fence = job.is_fence();
        self.push_completion(job);

        // fence jobs hold their storage until their handler has run
        if !fence {
            if let Some(storage) = storage {
                let mut jobs = self.jobs.lock();
                if let Some(fence) = jobs.fences.job_complete(storage) {
                    self.dispatch(&mut jobs, fence);
                }
            }
        }
    }

    /// Flushes expired write blocks and trims an over-full cache, at most
    /// once per tick.
    fn maybe_maintain(&self) {
        {
            let mut last = self.last_tick.lock();
            if last.elapsed() < CACHE_TICK_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let expiry = self.settings.read().cache_expiry;
        self.cache.flush_expired(expiry);
        if self.cache.is_over_capacity() {
            self.cache.trim();
        }
    }

    pub(super) fn trigger_trim(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock();
        if jobs.aborting {
            return;
        }
        match jobs.trim {
            TrimState::Idle => {
                jobs.trim = TrimState::Queued;
                let id = self.next_job.fetch_add(1, Ordering::Relaxed);
                let job = Job::new(id, None, JobFlags::default(), Action::TrimCache);
                self.dispatch(&mut jobs, job);
            }
            TrimState::Running => jobs.trim = TrimState::Reinvoke,
            TrimState::Queued | TrimState::Reinvoke => {}
        }
    }

    pub(super) fn trim_started(&self) {
        let mut jobs = self.jobs.lock();
        if jobs.trim == TrimState::Queued {
            jobs.trim = TrimState::Running;
        }
    }

    fn trim_finished(self: &Arc<Self>) {
        let reinvoke = {
            let mut jobs = self.jobs.lock();
            let reinvoke = jobs.trim == TrimState::Reinvoke;
            jobs.trim = TrimState::Idle;
            reinvoke
        };
        if reinvoke {
            self.trigger_trim();
        }
    }

    fn push_completion(self: &Arc<Self>, job: Job) {
        let post = {
            let mut completions = self.completions.lock();
            completions.jobs.push(job);
            !std::mem::replace(&mut completions.posted, true)
        };
        if post {
            self.post_delivery();
        }
    }

    /// Makes sure a delivery is posted, to hand out ready buffer observers.
    fn request_delivery(self: &Arc<Self>) {
        let post = !std::mem::replace(&mut self.completions.lock().posted, true);
        if post {
            self.post_delivery();
        }
    }

    fn post_delivery(self: &Arc<Self>) {
        let shared = self.clone();
        self.context.post(Box::new(move || shared.deliver()));
    }

    /// Runs on the completion context: calls the handlers of every finished
    /// job, then notifies buffer observers whose wait is over.
    fn deliver(self: &Arc<Self>) {
        let batch = {
            let mut completions = self.completions.lock();
            completions.posted = false;
            std::mem::take(&mut completions.jobs)
        };
        let observers = self.allocator.budget().take_ready();
        tracing::trace!(jobs = batch.len(), observers = observers.len(), "delivering completions");

        for job in batch {
            let fenced = if job.is_fence() { job.storage_id() } else { None };
            job.complete();
            if let Some(storage) = fenced {
                self.release_fence(storage);
            }
        }
        for observer in observers {
            observer.on_disk();
        }
    }

    fn release_fence(self: &Arc<Self>, storage: StorageId) {
        let mut jobs = self.jobs.lock();
        for job in jobs.fences.fence_complete(storage) {
            self.dispatch(&mut jobs, job);
        }
    }

    fn abort(self: &Arc<Self>, wait: bool) {
        let first = !self.aborting.swap(true, Ordering::AcqRel);
        let mut cancelled = std::mem::take(&mut *self.submitted.lock());
        let (handles, cleanup) = {
            let mut jobs = self.jobs.lock();
            jobs.aborting = true;
            cancelled.extend(jobs.generic.drain());
            cancelled.extend(jobs.hash.drain());
            cancelled.extend(jobs.fences.drain());
            let cleanup = jobs.total_threads() == 0 && !jobs.cleaned_up;
            if cleanup {
                jobs.cleaned_up = true;
            }
            let mut handles = Vec::new();
            if wait {
                handles.extend(jobs.generic.take_handles());
                handles.extend(jobs.hash.take_handles());
            }
            (handles, cleanup)
        };
        self.generic_ready.notify_all();
        self.hash_ready.notify_all();

        if first {
            tracing::info!(cancelled = cancelled.len(), "disk I/O aborting");
        }
        for mut job in cancelled {
            if job.kind() == JobKind::TrimCache {
                continue;
            }
            job.fail(StorageError::Cancelled);
            self.push_completion(job);
        }
        if cleanup {
            self.shutdown_cleanup();
        }

        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("disk thread panicked");
            }
        }
    }

    /// Runs once, after the last worker has exited.
    fn shutdown_cleanup(&self) {
        if let Err(e) = self.cache.flush_all() {
            tracing::warn!("flushing write cache at shutdown failed: {}", e);
        }
        self.cache.clear();
        self.files.release_all();
        tracing::debug!("disk I/O shut down");
    }
}
