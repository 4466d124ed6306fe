//! Where completion handlers run.
//!
//! Workers never call handlers themselves. Finished jobs are batched and the
//! batch is posted, as one task, to the caller's [`CompletionContext`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send>;

pub trait CompletionContext: Send + Sync {
    /// Schedules `task` to run later on the context's own thread. Must not
    /// run it synchronously.
    fn post(&self, task: Task);
}

/// A context pumped by its owner, for callers that run their own event loop.
#[derive(Default)]
pub struct ManualContext {
    tasks: Mutex<VecDeque<Task>>,
    posted: Condvar,
}

impl ManualContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every task posted so far, including tasks posted while running.
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Waits up to `timeout` for a task and runs it. Returns false on timeout.
    pub fn run_one_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let task = {
            let mut tasks = self.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break task;
                }
                if self.posted.wait_until(&mut tasks, deadline).timed_out() {
                    match tasks.pop_front() {
                        Some(task) => break task,
                        None => return false,
                    }
                }
            }
        };
        task();
        true
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl CompletionContext for ManualContext {
    fn post(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.posted.notify_one();
    }
}

/// Runs completion batches as tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioContext {
    handle: tokio::runtime::Handle,
}

impl TokioContext {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl CompletionContext for TokioContext {
    fn post(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_manual_context_runs_in_order() {
        let ctx = ManualContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            ctx.post(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(ctx.pending(), 3);
        assert_eq!(ctx.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(ctx.run_pending(), 0);
    }

    #[test]
    fn test_run_one_timeout_waits_for_post() {
        let ctx = Arc::new(ManualContext::new());
        assert!(!ctx.run_one_timeout(Duration::from_millis(10)));

        let ran = Arc::new(AtomicUsize::new(0));
        let poster = {
            let ctx = ctx.clone();
            let ran = ran.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.post(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            })
        };
        assert!(ctx.run_one_timeout(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        poster.join().unwrap();
    }

    #[tokio::test]
    async fn test_tokio_context_runs_task() {
        let ctx = TokioContext::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.post(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
