//! Copy-and-swap growable slot arrays
//!
//! A [`SlotTable`] is an array of shared cells indexed by slot id. Readers
//! never lock: they pin an epoch, load the current array and index into it.
//! Growth copies the cell pointers into a strictly larger array and installs
//! it with a compare-and-swap; a loser of that race retries from the array the
//! winner installed. Cells are `Arc`-shared between the old and new arrays, so
//! a write made through a stale array is still visible through the new one.
//! Retired arrays are reclaimed once no pinned reader can observe them.

use crossbeam::epoch::{self, Atomic, Owned};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct SlotTable<T> {
    cells: Atomic<Vec<Arc<T>>>,
    expand: usize,
}

impl<T: Default> SlotTable<T> {
    /// Create a table of `expand` default cells that grows in steps of `expand`
    pub fn new(expand: usize) -> Self {
        let expand = expand.max(1);
        Self {
            cells: Atomic::new(Self::fresh(expand)),
            expand,
        }
    }

    fn fresh(len: usize) -> Vec<Arc<T>> {
        (0..len).map(|_| Arc::new(T::default())).collect()
    }

    /// Current array length
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        let shared = self.cells.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and is kept alive by `guard`
        unsafe { shared.as_ref() }.map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the cell at `index` without taking a reference count
    #[inline]
    pub fn with<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = epoch::pin();
        let shared = self.cells.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and is kept alive by `guard`
        let cells = unsafe { shared.as_ref() }?;
        cells.get(index).map(|cell| f(cell))
    }

    /// Shared handle to the cell at `index`
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        let guard = epoch::pin();
        let shared = self.cells.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and is kept alive by `guard`
        let cells = unsafe { shared.as_ref() }?;
        cells.get(index).cloned()
    }

    /// Grow until `min_len` cells exist.
    ///
    /// Returns `true` when this call installed a new array, `false` when the
    /// table was already large enough (possibly because a concurrent grower won).
    pub fn grow_to(&self, min_len: usize) -> bool {
        let guard = epoch::pin();
        loop {
            let current = self.cells.load(Ordering::Acquire, &guard);
            // SAFETY: the pointer is never null and is kept alive by `guard`
            let cells = match unsafe { current.as_ref() } {
                Some(cells) => cells,
                None => return false,
            };
            if cells.len() >= min_len {
                return false;
            }

            let mut new_len = cells.len() + self.expand;
            while new_len < min_len {
                new_len += self.expand;
            }

            let mut grown = Vec::with_capacity(new_len);
            grown.extend(cells.iter().cloned());
            grown.extend((cells.len()..new_len).map(|_| Arc::new(T::default())));

            match self.cells.compare_exchange(
                current,
                Owned::new(grown),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    // SAFETY: `current` is unlinked; readers still holding it are pinned
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Replace the whole array with `expand` fresh default cells
    pub fn reset(&self) {
        let guard = epoch::pin();
        let old = self
            .cells
            .swap(Owned::new(Self::fresh(self.expand)), Ordering::AcqRel, &guard);
        // SAFETY: `old` is unlinked; readers still holding it are pinned
        unsafe { guard.defer_destroy(old) };
    }

    /// Handles to every cell of the current array
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let guard = epoch::pin();
        let shared = self.cells.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and is kept alive by `guard`
        unsafe { shared.as_ref() }.cloned().unwrap_or_default()
    }
}

impl<T> Drop for SlotTable<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no other thread can reach the array
        unsafe {
            let guard = epoch::unprotected();
            let current = self.cells.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}
