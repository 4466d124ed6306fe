//! Queue and thread bookkeeping of one elastic worker pool.
//!
//! The queue lives under the job mutex together with the fence table. Workers
//! themselves are driven by the disk I/O thread, which owns the condition
//! variable each pool's workers park on.

use std::collections::VecDeque;
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use super::job::Job;
use super::settings::PoolSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Generic,
    Hash,
}

impl PoolKind {
    fn thread_prefix(self) -> &'static str {
        match self {
            PoolKind::Generic => "disk-io",
            PoolKind::Hash => "disk-hash",
        }
    }
}

pub(crate) struct JobQueue {
    kind: PoolKind,
    jobs: VecDeque<Job>,
    limits: PoolSettings,
    /// Live workers, including idle ones.
    threads: usize,
    /// Workers parked on the condition variable.
    idle: usize,
    peak_queued: usize,
    spawned: usize,
    handles: Vec<JoinHandle<()>>,
}

impl JobQueue {
    pub fn new(kind: PoolKind, limits: PoolSettings) -> Self {
        Self {
            kind,
            jobs: VecDeque::new(),
            limits,
            threads: 0,
            idle: 0,
            peak_queued: 0,
            spawned: 0,
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
        self.peak_queued = self.peak_queued.max(self.jobs.len());
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn peak_queued(&self) -> usize {
        self.peak_queued
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn set_limits(&mut self, limits: PoolSettings) {
        self.limits = limits;
    }

    /// Queued work exceeds the idle workers and the pool may still grow.
    pub fn wants_worker(&self) -> bool {
        self.threads < self.limits.max_threads && self.jobs.len() > self.idle
    }

    pub fn below_minimum(&self) -> bool {
        self.threads < self.limits.min_threads
    }

    /// Whether a worker idle for `idle_for` should exit.
    pub fn should_retire(&self, idle_for: Duration, timeout: Duration) -> bool {
        self.threads > self.limits.max_threads
            || (self.threads > self.limits.min_threads && idle_for >= timeout)
    }

    pub fn park(&mut self) {
        self.idle += 1;
    }

    pub fn unpark(&mut self) {
        self.idle -= 1;
    }

    /// Bookkeeping for a worker that returned from its loop.
    pub fn retire(&mut self) {
        debug_assert!(self.threads > 0, "retiring a worker that never started");
        self.threads -= 1;
    }

    /// Starts a worker thread running `body`.
    pub fn spawn(&mut self, body: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.handles.retain(|h| !h.is_finished());
        let name = format!("{}-{}", self.kind.thread_prefix(), self.spawned);
        let handle = std::thread::Builder::new().name(name).spawn(body)?;
        self.spawned += 1;
        self.threads += 1;
        self.handles.push(handle);
        tracing::debug!(pool = ?self.kind, threads = self.threads, "disk thread spawned");
        Ok(())
    }

    /// Removes queued jobs matching `pred`, keeping the order of the rest.
    pub fn remove_where(&mut self, pred: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.jobs.len());
        for job in self.jobs.drain(..) {
            if pred(&job) {
                removed.push(job);
            } else {
                kept.push_back(job);
            }
        }
        self.jobs = kept;
        removed
    }

    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    pub fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}
