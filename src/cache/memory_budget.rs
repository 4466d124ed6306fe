use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::constants::MAX_CACHE_BLOCKS;

/// Notified once when disk buffer capacity becomes available again after an
/// allocation was refused.
pub trait DiskObserver: Send + Sync {
    fn on_disk(&self);
}

type ReadyHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Observers {
    waiting: VecDeque<Arc<dyn DiskObserver>>,
    ready: Vec<Arc<dyn DiskObserver>>,
}

/// Counts disk buffers in use against a fixed block budget.
///
/// A refused allocation parks its observer. Each release moves at most one
/// parked observer (FIFO) to the ready list and fires the ready hook; the
/// owner of the budget drains ready observers and notifies them on its own
/// thread, so observers never run under a cache or job lock.
pub struct MemoryBudget {
    limit: AtomicUsize,
    in_use: AtomicUsize,
    observers: Mutex<Observers>,
    ready_hook: RwLock<Option<ReadyHook>>,
}

impl MemoryBudget {
    pub fn new(limit_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit_blocks.clamp(1, MAX_CACHE_BLOCKS)),
            in_use: AtomicUsize::new(0),
            observers: Mutex::new(Observers::default()),
            ready_hook: RwLock::new(None),
        })
    }

    fn try_take(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current >= limit {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Takes one block from the budget. On failure the observer, if any, is
    /// parked until a block is released.
    pub fn try_acquire(&self, observer: Option<&Arc<dyn DiskObserver>>) -> bool {
        if self.try_take() {
            return true;
        }
        let Some(observer) = observer else {
            return false;
        };

        let mut observers = self.observers.lock();
        // A release may have raced with the failed attempt above; it takes
        // this lock before looking for observers, so checking again here
        // cannot lose a wakeup.
        if self.try_take() {
            return true;
        }
        if !observers.waiting.iter().any(|o| Arc::ptr_eq(o, observer)) {
            observers.waiting.push_back(observer.clone());
        }
        false
    }

    /// Returns `n` blocks to the budget.
    pub fn release(&self, n: usize) {
        self.in_use.fetch_sub(n, Ordering::SeqCst);

        let became_ready = {
            let mut observers = self.observers.lock();
            if self.has_room() {
                match observers.waiting.pop_front() {
                    Some(observer) => {
                        observers.ready.push(observer);
                        true
                    }
                    None => false,
                }
            } else {
                false
            }
        };

        if became_ready {
            let hook = self.ready_hook.read().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Installs the callback fired whenever an observer becomes ready.
    pub fn set_ready_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.ready_hook.write() = Some(Arc::new(hook));
    }

    /// Drains observers whose wait is over. Each is returned exactly once.
    pub fn take_ready(&self) -> Vec<Arc<dyn DiskObserver>> {
        std::mem::take(&mut self.observers.lock().ready)
    }

    pub fn waiting_observers(&self) -> usize {
        self.observers.lock().waiting.len()
    }

    fn has_room(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) < self.limit.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit_blocks: usize) {
        self.limit
            .store(limit_blocks.clamp(1, MAX_CACHE_BLOCKS), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver(AtomicUsize);

    impl DiskObserver for CountingObserver {
        fn on_disk(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let budget = MemoryBudget::new(2);
        assert!(budget.try_acquire(None));
        assert!(budget.try_acquire(None));
        assert!(!budget.try_acquire(None));
        assert_eq!(budget.in_use(), 2);

        budget.release(1);
        assert!(budget.try_acquire(None));
    }

    #[test]
    fn test_observers_released_fifo_once() {
        let budget = MemoryBudget::new(1);
        assert!(budget.try_acquire(None));

        let first: Arc<dyn DiskObserver> = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let second: Arc<dyn DiskObserver> = Arc::new(CountingObserver(AtomicUsize::new(0)));
        assert!(!budget.try_acquire(Some(&first)));
        assert!(!budget.try_acquire(Some(&second)));
        // Registering twice does not queue a second notification.
        assert!(!budget.try_acquire(Some(&first)));
        assert_eq!(budget.waiting_observers(), 2);

        budget.release(1);
        let ready = budget.take_ready();
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &first));
        assert!(budget.take_ready().is_empty());
        assert_eq!(budget.waiting_observers(), 1);
    }

    #[test]
    fn test_ready_hook_fires() {
        let budget = MemoryBudget::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        budget.set_ready_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(budget.try_acquire(None));
        let observer: Arc<dyn DiskObserver> = Arc::new(CountingObserver(AtomicUsize::new(0)));
        assert!(!budget.try_acquire(Some(&observer)));

        budget.release(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Nothing waiting, so no further hook calls.
        assert!(budget.try_acquire(None));
        budget.release(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
