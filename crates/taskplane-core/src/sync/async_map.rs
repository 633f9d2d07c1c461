//! Refcounted storage with deferred asynchronous destruction.
//!
//! An [`AsyncMap`] owns cells of `T` keyed by `K`; [`AsyncPtr`] handles
//! keep a cell alive. Dropping the last handle does not free the cell —
//! it moves it onto the map's to-destroy list, where a driver awaits the
//! type's [`AsyncDestroy::destroy`] task before the storage is released.
//! That gap is the whole point: teardown of a cell may need real async
//! work (closing handles, reaping a child) and must finish before the
//! slot can be reused.
//!
//! # Invariants
//!
//! - A cell with any live handle is never destroyed.
//! - A cell on the to-destroy list has no live handles and its `destroy`
//!   has not completed yet.
//! - At most one `destroy` runs per driver at a time.
//! - [`AsyncMap::shutdown`] returns only once the list is empty and no
//!   `destroy` is in flight.
//!
//! Iteration order is key order (`BTreeMap`). Everything is
//! single-threaded; handles are `Rc` underneath.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Asynchronous teardown hook for cells stored in an [`AsyncMap`].
pub trait AsyncDestroy {
    /// Release the resources held by this cell.
    ///
    /// Runs exactly once, after the last [`AsyncPtr`] has dropped and
    /// before the storage is freed. Must be idempotent with respect to
    /// resources already torn down by an explicit cancel/abort path.
    fn destroy(&self) -> impl Future<Output = ()>;
}

struct MapShared<T> {
    to_del: RefCell<VecDeque<Rc<T>>>,
    wake: Notify,
    quiesce: Notify,
    in_flight: Cell<usize>,
}

impl<T> MapShared<T> {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            to_del: RefCell::new(VecDeque::new()),
            wake: Notify::new(),
            quiesce: Notify::new(),
            in_flight: Cell::new(0),
        })
    }
}

/// Refcounted handle into an [`AsyncMap`] cell.
///
/// Handles move but do not copy. The cell stays alive while any handle
/// exists; the last drop schedules deferred destruction on the owning
/// map.
pub struct AsyncPtr<T: AsyncDestroy> {
    cell: Option<Rc<T>>,
    shared: Rc<MapShared<T>>,
}

impl<T: AsyncDestroy> AsyncPtr<T> {
    fn new(cell: Rc<T>, shared: Rc<MapShared<T>>) -> Self {
        Self {
            cell: Some(cell),
            shared,
        }
    }

    fn duplicate(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: AsyncDestroy> Deref for AsyncPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.cell.as_ref().expect("handle accessed after drop")
    }
}

impl<T: AsyncDestroy> Drop for AsyncPtr<T> {
    fn drop(&mut self) {
        let Some(cell) = self.cell.take() else {
            return;
        };
        if Rc::strong_count(&cell) == 1 {
            // Last handle: hand the cell to the destruction driver
            // instead of freeing it inline.
            self.shared.to_del.borrow_mut().push_back(cell);
            self.shared.wake.notify_one();
        }
    }
}

/// Ordered map owning refcounted, asynchronously-destroyed cells.
pub struct AsyncMap<K, T: AsyncDestroy> {
    entries: RefCell<BTreeMap<K, AsyncPtr<T>>>,
    shared: Rc<MapShared<T>>,
}

impl<K: Ord + Clone, T: AsyncDestroy> AsyncMap<K, T> {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(BTreeMap::new()),
            shared: MapShared::new(),
        }
    }

    /// Insert a cell iff `key` is not present; returns a handle to it.
    pub fn try_insert(&self, key: K, value: T) -> Option<AsyncPtr<T>> {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&key) {
            return None;
        }
        let cell = Rc::new(value);
        let handle = AsyncPtr::new(cell.clone(), self.shared.clone());
        entries.insert(key, AsyncPtr::new(cell, self.shared.clone()));
        Some(handle)
    }

    /// Handle to the cell under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<AsyncPtr<T>> {
        self.entries.borrow().get(key).map(AsyncPtr::duplicate)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Drop the map's handle for `key`.
    ///
    /// The cell is destroyed once outstanding handles drop too. Returns
    /// whether the key was present.
    pub fn remove(&self, key: &K) -> bool {
        self.entries.borrow_mut().remove(key).is_some()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Drive deferred destruction until cancelled.
    ///
    /// Picks one cell at a time off the to-destroy list, awaits its
    /// `destroy`, then frees it. Spawn this next to the map on the local
    /// set.
    pub async fn run_destroyer(&self, cancel: CancellationToken) {
        loop {
            let cell = loop {
                let popped = self.shared.to_del.borrow_mut().pop_front();
                if let Some(cell) = popped {
                    break cell;
                }
                tokio::select! {
                    () = self.shared.wake.notified() => {}
                    () = cancel.cancelled() => return,
                }
            };
            self.destroy_one(cell).await;
        }
    }

    /// Clear the map and wait until every pending destruction finished.
    pub async fn shutdown(&self) {
        self.entries.borrow_mut().clear();
        loop {
            let popped = self.shared.to_del.borrow_mut().pop_front();
            if let Some(cell) = popped {
                self.destroy_one(cell).await;
                continue;
            }
            if self.shared.in_flight.get() == 0 {
                return;
            }
            self.shared.quiesce.notified().await;
        }
    }

    async fn destroy_one(&self, cell: Rc<T>) {
        self.shared.in_flight.set(self.shared.in_flight.get() + 1);
        cell.destroy().await;
        self.shared.in_flight.set(self.shared.in_flight.get() - 1);
        drop(cell);
        self.shared.quiesce.notify_waiters();
    }
}

impl<K: Ord + Clone, T: AsyncDestroy> Default for AsyncMap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
