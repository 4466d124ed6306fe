use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::job::JobKind;
use crate::cache::CacheStats;

/// Running average of a duration, reset each time it is read.
#[derive(Debug, Default)]
pub(crate) struct TimeAverage {
    total_us: AtomicU64,
    count: AtomicU64,
    cumulative_us: AtomicU64,
}

impl TimeAverage {
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.cumulative_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Average since the previous call.
    pub fn take_average(&self) -> Duration {
        let total = self.total_us.swap(0, Ordering::Relaxed);
        let count = self.count.swap(0, Ordering::Relaxed);
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(total / count)
        }
    }

    pub fn cumulative(&self) -> Duration {
        Duration::from_micros(self.cumulative_us.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub(crate) struct DiskCounters {
    jobs: [AtomicU64; JobKind::COUNT],
    pub failed_jobs: AtomicU64,
    pub blocks_read: AtomicU64,
    pub read_hits: AtomicU64,
    pub read_back: AtomicU64,
    pub job_time: TimeAverage,
    pub read_time: TimeAverage,
    pub write_time: TimeAverage,
    pub hash_time: TimeAverage,
}

impl DiskCounters {
    pub fn record_job(&self, kind: JobKind, elapsed: Duration, succeeded: bool) {
        self.jobs[kind.index()].fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed_jobs.fetch_add(1, Ordering::Relaxed);
        }
        self.job_time.record(elapsed);
        match kind {
            JobKind::Read => self.read_time.record(elapsed),
            JobKind::Write => self.write_time.record(elapsed),
            JobKind::Hash => self.hash_time.record(elapsed),
            _ => {}
        }
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn jobs(&self) -> [u64; JobKind::COUNT] {
        std::array::from_fn(|i| self.jobs[i].load(Ordering::Relaxed))
    }
}

/// Snapshot of the disk I/O thread.
///
/// Average times cover the period since the previous snapshot; cumulative
/// times and counters cover the whole lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub cache: CacheStats,
    pub buffers_in_use: usize,
    pub buffer_limit: usize,
    /// Observers waiting for buffer capacity.
    pub waiting_observers: usize,
    pub queued_jobs: usize,
    pub queued_hash_jobs: usize,
    /// Jobs held back by a fence.
    pub blocked_jobs: usize,
    /// Jobs queued but not yet passed to `submit_jobs`.
    pub pending_submissions: usize,
    pub peak_queued: usize,
    pub generic_threads: usize,
    pub hash_threads: usize,
    pub open_files: usize,
    pub avg_job_time: Duration,
    pub avg_read_time: Duration,
    pub avg_write_time: Duration,
    pub avg_hash_time: Duration,
    pub cumulative_job_time: Duration,
    pub cumulative_read_time: Duration,
    pub cumulative_write_time: Duration,
    pub cumulative_hash_time: Duration,
    pub blocks_read: u64,
    pub read_hits: u64,
    pub blocks_written: u64,
    /// Blocks a hash had to read back from storage.
    pub read_back: u64,
    pub jobs: [u64; JobKind::COUNT],
    pub failed_jobs: u64,
    pub fences_run: u64,
}

impl DiskStats {
    /// Executed jobs of one kind.
    pub fn jobs_of(&self, kind: JobKind) -> u64 {
        self.jobs[kind.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_resets_cumulative_does_not() {
        let avg = TimeAverage::default();
        avg.record(Duration::from_millis(10));
        avg.record(Duration::from_millis(30));

        assert_eq!(avg.take_average(), Duration::from_millis(20));
        assert_eq!(avg.take_average(), Duration::ZERO);
        assert_eq!(avg.cumulative(), Duration::from_millis(40));
    }

    #[test]
    fn test_record_job_by_kind() {
        let counters = DiskCounters::default();
        counters.record_job(JobKind::Read, Duration::from_millis(4), true);
        counters.record_job(JobKind::DeleteFiles, Duration::from_millis(2), false);

        let jobs = counters.jobs();
        assert_eq!(jobs[JobKind::Read.index()], 1);
        assert_eq!(jobs[JobKind::DeleteFiles.index()], 1);
        assert_eq!(counters.failed_jobs.load(Ordering::Relaxed), 1);
        assert_eq!(counters.read_time.take_average(), Duration::from_millis(4));
        assert_eq!(counters.job_time.take_average(), Duration::from_millis(3));
    }
}
