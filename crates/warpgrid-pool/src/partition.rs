//! One independent slice of the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::handle::{ConnectionHandle, HandleState};
use crate::stats::PartitionStats;

/// A partition owns its handles and a LIFO free list.
///
/// `created` counts every handle from the moment its creation is reserved
/// until it is destroyed, so at rest `leased + free == created`, and at
/// every instant `leased + free <= created <= max`. `leased` only changes
/// under the free-list lock, which keeps the two counts consistent for
/// readers of [`stats`](Self::stats).
pub(crate) struct Partition {
    index: usize,
    min: usize,
    max: usize,
    free: Mutex<Vec<Arc<ConnectionHandle>>>,
    handles: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    created: AtomicUsize,
    leased: AtomicUsize,
    /// Wakes this partition's refill watcher.
    watch: Notify,
}

impl Partition {
    pub(crate) fn new(index: usize, min: usize, max: usize) -> Self {
        Self {
            index,
            min,
            max,
            free: Mutex::new(Vec::with_capacity(max)),
            handles: Mutex::new(HashMap::with_capacity(max)),
            created: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            watch: Notify::new(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn min(&self) -> usize {
        self.min
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn has_headroom(&self) -> bool {
        self.created() < self.max
    }

    pub(crate) fn watch(&self) -> &Notify {
        &self.watch
    }

    /// Whether free connections have fallen to `threshold` percent of max.
    pub(crate) fn below_threshold(&self, threshold: u8) -> bool {
        self.free_count() * 100 / self.max <= threshold as usize
    }

    /// Reserve room for up to `wanted` new connections. Returns how many
    /// were reserved; the caller must `register` or `unreserve` each.
    pub(crate) fn try_reserve(&self, wanted: usize) -> usize {
        if wanted == 0 {
            return 0;
        }
        match self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < self.max).then(|| created + wanted.min(self.max - created))
            }) {
            Ok(previous) => wanted.min(self.max - previous),
            Err(_) => 0,
        }
    }

    pub(crate) fn unreserve(&self, count: usize) {
        if count > 0 {
            self.created.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Track a handle whose creation was reserved.
    pub(crate) fn register(&self, handle: Arc<ConnectionHandle>) {
        self.handles.lock().insert(handle.id(), handle);
    }

    /// Forget a handle and release its slot. `true` if it was tracked.
    pub(crate) fn unregister(&self, id: u64) -> bool {
        let removed = self.handles.lock().remove(&id).is_some();
        if removed {
            self.created.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Pop a free handle and lease it. Returns the handle and its lease.
    pub(crate) fn claim_free(&self) -> Option<(Arc<ConnectionHandle>, u64)> {
        let mut free = self.free.lock();
        while let Some(handle) = free.pop() {
            if let Some(lease) = handle.claim() {
                self.leased.fetch_add(1, Ordering::AcqRel);
                return Some((handle, lease));
            }
        }
        None
    }

    /// Count a handle that was created straight into a lease.
    pub(crate) fn add_leased(&self) {
        let _free = self.free.lock();
        self.leased.fetch_add(1, Ordering::AcqRel);
    }

    /// Put a FREE handle on top of the free list.
    pub(crate) fn push_free(&self, handle: Arc<ConnectionHandle>) {
        self.free.lock().push(handle);
    }

    /// Move a released handle from the leased count to the free list.
    pub(crate) fn return_free(&self, handle: Arc<ConnectionHandle>) {
        let mut free = self.free.lock();
        self.decrement_leased();
        free.push(handle);
    }

    /// Drop one lease from the count without freeing anything.
    pub(crate) fn forget_lease(&self) {
        let _free = self.free.lock();
        self.decrement_leased();
    }

    // Saturating: a release racing shutdown may land after `drain`.
    fn decrement_leased(&self) {
        let _ = self
            .leased
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Remove free handles matching `pick` from the free list, moving each
    /// to `to` first. Handles that lose the race stay untouched.
    pub(crate) fn take_free_where(
        &self,
        to: HandleState,
        mut pick: impl FnMut(&ConnectionHandle) -> bool,
    ) -> Vec<Arc<ConnectionHandle>> {
        let mut free = self.free.lock();
        let mut taken = Vec::new();
        free.retain(|handle| {
            if pick(handle.as_ref()) && handle.transition(HandleState::Free, to) {
                taken.push(handle.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Snapshot of every tracked handle.
    pub(crate) fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    /// Empty the partition for shutdown, returning every tracked handle.
    pub(crate) fn drain(&self) -> Vec<Arc<ConnectionHandle>> {
        let mut free = self.free.lock();
        free.clear();
        let drained: Vec<_> = self.handles.lock().drain().map(|(_, h)| h).collect();
        self.created.fetch_sub(drained.len(), Ordering::AcqRel);
        self.leased.store(0, Ordering::Release);
        drained
    }

    pub(crate) fn stats(&self) -> PartitionStats {
        let free = self.free.lock();
        PartitionStats {
            index: self.index,
            leased: self.leased.load(Ordering::Acquire),
            free: free.len(),
            created: self.created(),
            min: self.min,
            max: self.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Credentials, Driver};
    use crate::mock::MockDriver;
    use crate::statement_cache::{CacheBudget, StatementCache};

    fn handle(driver: &MockDriver, id: u64) -> Arc<ConnectionHandle> {
        let physical = driver.connect("mock:db", &Credentials::default()).unwrap();
        let cache = StatementCache::new(0, Arc::new(CacheBudget::new(0)));
        Arc::new(ConnectionHandle::new(id, 0, physical, cache, true))
    }

    fn filled(driver: &MockDriver, count: usize, max: usize) -> Partition {
        let partition = Partition::new(0, count, max);
        assert_eq!(partition.try_reserve(count), count);
        for id in 0..count as u64 {
            let h = handle(driver, id);
            partition.register(h.clone());
            partition.push_free(h);
        }
        partition
    }

    #[test]
    fn reserve_caps_at_max() {
        let partition = Partition::new(0, 0, 5);
        assert_eq!(partition.try_reserve(3), 3);
        assert_eq!(partition.try_reserve(3), 2);
        assert_eq!(partition.try_reserve(1), 0);
        partition.unreserve(2);
        assert_eq!(partition.created(), 3);
        assert!(partition.has_headroom());
    }

    #[test]
    fn free_list_is_lifo() {
        let driver = MockDriver::new();
        let partition = filled(&driver, 3, 3);
        let (top, lease) = partition.claim_free().unwrap();
        assert_eq!(top.id(), 2);
        assert_eq!(lease, 1);

        assert!(top.transition_lease(lease, HandleState::Leased, HandleState::Free));
        partition.return_free(top);
        assert_eq!(partition.claim_free().unwrap().0.id(), 2);
    }

    #[test]
    fn counts_stay_consistent() {
        let driver = MockDriver::new();
        let partition = filled(&driver, 4, 4);
        let (a, _) = partition.claim_free().unwrap();
        let (_b, _) = partition.claim_free().unwrap();

        let stats = partition.stats();
        assert_eq!((stats.leased, stats.free, stats.created), (2, 2, 4));

        partition.forget_lease();
        assert!(partition.unregister(a.id()));
        assert!(!partition.unregister(a.id()));
        let stats = partition.stats();
        assert_eq!((stats.leased, stats.free, stats.created), (1, 2, 3));
    }

    #[test]
    fn threshold_is_percent_of_max() {
        let driver = MockDriver::new();
        let partition = filled(&driver, 20, 100);
        assert!(partition.below_threshold(20));
        assert!(!partition.below_threshold(19));
    }

    #[test]
    fn take_free_where_skips_unmatched() {
        let driver = MockDriver::new();
        let partition = filled(&driver, 3, 3);
        let taken = partition.take_free_where(HandleState::Testing, |h| h.id() != 1);
        assert_eq!(taken.len(), 2);
        assert!(taken.iter().all(|h| h.state() == HandleState::Testing));
        assert_eq!(partition.free_count(), 1);
    }

    #[test]
    fn drain_resets_counts() {
        let driver = MockDriver::new();
        let partition = filled(&driver, 2, 4);
        partition.claim_free().unwrap();
        assert_eq!(partition.drain().len(), 2);
        let stats = partition.stats();
        assert_eq!((stats.leased, stats.free, stats.created), (0, 0, 0));
    }
}
