//! Acquire, track, and release block locks.
//!
//! The [LockRegistry] is owned by a single node and hands out a fresh [LockId] for every
//! acquisition attempt, so the same block may be locked by any number of concurrent readers.
//! Each acquisition is represented by a [LockHandle] that releases the lock exactly once:
//! explicitly via [LockHandle::release] or implicitly when dropped.
//!
//! A [Tracker] records which block indices of an open file are currently locked by it.

use crate::{BlockId, Error, LockId, Locker};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, warn};

/// Allocates lock ids and acquires locks from the node's [Locker].
pub struct LockRegistry {
    locker: Arc<dyn Locker>,
    next: AtomicU64,
    outstanding: Gauge,
}

impl LockRegistry {
    pub fn new(locker: Arc<dyn Locker>, outstanding: Gauge) -> Arc<Self> {
        Arc::new(Self {
            locker,
            next: AtomicU64::new(0),
            outstanding,
        })
    }

    /// Locks `block` under a newly allocated lock id.
    pub fn acquire(self: &Arc<Self>, block: BlockId) -> Result<LockHandle, Error> {
        let lock = self.next.fetch_add(1, Ordering::Relaxed);
        self.locker.lock(block, lock)?;
        self.outstanding.inc();
        debug!(block, lock, "acquired lock");
        Ok(LockHandle {
            registry: self.clone(),
            block,
            lock,
            tracked: None,
            released: false,
        })
    }

    /// Number of handles acquired and not yet released.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.get()
    }
}

/// An outstanding lock on a block.
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    block: BlockId,
    lock: LockId,
    tracked: Option<(Arc<Tracker>, usize)>,
    released: bool,
}

impl LockHandle {
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    pub fn lock_id(&self) -> LockId {
        self.lock
    }

    /// Records block `index` in `tracker` until this lock is released.
    pub fn track(mut self, tracker: Arc<Tracker>, index: usize) -> Self {
        tracker.track(index);
        self.tracked = Some((tracker, index));
        self
    }

    /// Releases the lock.
    pub fn release(mut self) -> Result<(), Error> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some((tracker, index)) = self.tracked.take() {
            tracker.untrack(index);
        }
        self.registry.outstanding.dec();
        debug!(block = self.block, lock = self.lock, "released lock");
        self.registry.locker.unlock(self.block, self.lock)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            warn!(?err, block = self.block, lock = self.lock, "failed to release lock");
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("block", &self.block)
            .field("lock", &self.lock)
            .finish()
    }
}

/// The block indices of one file that are currently locked through it.
///
/// An index stays tracked until every lock taken on it has been released.
#[derive(Debug, Default)]
pub struct Tracker {
    indices: Mutex<BTreeMap<usize, usize>>,
}

impl Tracker {
    /// Records one more lock on `index`. Returns true if `index` was not already tracked.
    pub fn track(&self, index: usize) -> bool {
        let mut indices = self.indices.lock().unwrap();
        let count = indices.entry(index).or_default();
        *count += 1;
        *count == 1
    }

    /// Records the release of one lock on `index`. Returns true if `index` was tracked.
    pub fn untrack(&self, index: usize) -> bool {
        let mut indices = self.indices.lock().unwrap();
        let Some(count) = indices.get_mut(&index) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            indices.remove(&index);
        }
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.lock().unwrap().contains_key(&index)
    }

    /// Number of distinct tracked indices.
    pub fn len(&self) -> usize {
        self.indices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the tracked indices in ascending order.
    pub fn snapshot(&self) -> Vec<usize> {
        self.indices.lock().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use std::thread;

    #[test]
    fn test_lock_ids_are_unique() {
        let locker = mocks::Locker::default();
        let registry = LockRegistry::new(Arc::new(locker.clone()), Gauge::default());
        let first = registry.acquire(7).unwrap();
        let second = registry.acquire(7).unwrap();
        assert_eq!(first.block_id(), second.block_id());
        assert_ne!(first.lock_id(), second.lock_id());
        assert_eq!(registry.outstanding(), 2);
        assert_eq!(locker.held().len(), 2);

        first.release().unwrap();
        drop(second);
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(locker.acquires(), 2);
        assert_eq!(locker.releases(), 2);
        assert!(locker.held().is_empty());
    }

    #[test]
    fn test_release_once() {
        let locker = mocks::Locker::default();
        let registry = LockRegistry::new(Arc::new(locker.clone()), Gauge::default());
        let handle = registry.acquire(1).unwrap();
        handle.release().unwrap();
        // Dropping after an explicit release must not unlock again
        assert_eq!(locker.releases(), 1);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_failed_acquire() {
        let locker = mocks::Locker::default();
        locker.fail(true);
        let registry = LockRegistry::new(Arc::new(locker.clone()), Gauge::default());
        assert!(matches!(registry.acquire(1), Err(Error::Lock(_))));
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(locker.releases(), 0);
    }

    #[test]
    fn test_tracked_until_release() {
        let locker = mocks::Locker::default();
        let registry = LockRegistry::new(Arc::new(locker), Gauge::default());
        let tracker = Arc::new(Tracker::default());
        let handle = registry.acquire(3).unwrap().track(tracker.clone(), 2);
        assert!(tracker.contains(2));
        drop(handle);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = Tracker::default();
        assert!(tracker.track(4));
        assert!(!tracker.track(4));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.untrack(4));
        assert!(tracker.contains(4));
        assert!(tracker.untrack(4));
        assert!(!tracker.untrack(4));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_shared_index_tracked_until_last_release() {
        let locker = mocks::Locker::default();
        let registry = LockRegistry::new(Arc::new(locker.clone()), Gauge::default());
        let tracker = Arc::new(Tracker::default());
        let first = registry.acquire(3).unwrap().track(tracker.clone(), 2);
        let second = registry.acquire(3).unwrap().track(tracker.clone(), 2);
        assert_eq!(tracker.snapshot(), vec![2]);

        first.release().unwrap();
        assert_eq!(tracker.snapshot(), vec![2]);
        assert_eq!(locker.held().len(), 1);

        drop(second);
        assert!(tracker.is_empty());
        assert!(locker.held().is_empty());
    }

    #[test]
    fn test_tracker_concurrent() {
        let tracker = Arc::new(Tracker::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        tracker.track(i);
                        if i % 2 == t % 2 {
                            tracker.untrack(i);
                        }
                        tracker.track(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.snapshot(), (0..100).collect::<Vec<_>>());
    }
}
