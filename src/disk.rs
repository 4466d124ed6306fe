//! The disk I/O thread: job queues, worker pools and completion delivery.
//!
//! # Overview
//!
//! [`DiskIoThread`] accepts disk jobs from the network side and runs them on
//! two elastic pools of OS threads, one for generic I/O and one for hashing.
//! Reads and writes go through the [`BlockCache`](crate::cache::BlockCache);
//! write buffers come from the [`BufferAllocator`](crate::cache::BufferAllocator)
//! shared with the cache, so a slow disk throttles the network side through
//! [`DiskObserver`](crate::cache::DiskObserver) backpressure.
//!
//! # Job ordering
//!
//! Jobs on the same storage may run concurrently and complete in any order,
//! except around fence jobs (move, release, delete, check, rename, stop, set
//! file priority, clear piece). A fence waits for every earlier job of its
//! storage, runs alone, and holds back later jobs until its handler has run.
//!
//! # Completions
//!
//! Handlers never run on worker threads. Finished jobs are batched and each
//! batch is posted as one task to the [`CompletionContext`]. Use
//! [`TokioContext`] inside a tokio runtime, or [`ManualContext`] to pump
//! completions from an event loop of your own.
//!
//! # Examples
//!
//! ```
//! use rbit_disk::disk::{DiskIoThread, DiskSettings, JobFlags, ManualContext, PeerRequest};
//! use rbit_disk::storage::ZeroStorage;
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let ctx = Arc::new(ManualContext::new());
//! let disk = DiskIoThread::new(DiskSettings::default(), ctx.clone()).unwrap();
//! let storage = disk.add_storage(ZeroStorage::new(32768, 65536));
//!
//! let result = Arc::new(Mutex::new(None));
//! let slot = result.clone();
//! disk.async_read(&storage, PeerRequest::new(0, 0, 16384), JobFlags::default(), move |r| {
//!     *slot.lock().unwrap() = Some(r.map(|block| block.len()));
//! });
//! disk.submit_jobs();
//!
//! while result.lock().unwrap().is_none() {
//!     ctx.run_one_timeout(Duration::from_secs(5));
//! }
//! assert_eq!(result.lock().unwrap().take(), Some(Ok(16384)));
//! ```

mod context;
mod execute;
mod fence;
mod io_thread;
mod job;
mod settings;
mod stats;
mod thread_pool;

pub use context::{CompletionContext, ManualContext, Task, TokioContext};
pub use io_thread::DiskIoThread;
pub use job::{Handler, JobFlags, JobId, JobKind, PeerRequest};
pub use settings::{DiskSettings, PoolSettings, SettingsError};
pub use stats::DiskStats;

#[cfg(test)]
mod tests;
