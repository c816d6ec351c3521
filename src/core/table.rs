#[cfg(test)]
use std::cell::Cell;
use std::collections::TryReserveError;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Owned, Pointer, Shared};

use super::bin_entry::BinEntry;

#[cfg(test)]
thread_local! {
    static FAIL_ALLOCATIONS: Cell<bool> = const { Cell::new(false) };
}

/// Makes `try_new` on the calling thread fail until switched back off.
#[cfg(test)]
pub(crate) fn fail_allocations(fail: bool) {
    FAIL_ALLOCATIONS.with(|flag| flag.set(fail));
}

/// An array of bins. The length is always a power of two.
#[derive(Debug)]
pub struct Table<V> {
    bins: Box<[Atomic<BinEntry<V>>]>,
    // the single `Moved` entry every migrated bin of this table points at
    forwarding: Atomic<BinEntry<V>>,
}

impl<V> Table<V> {
    pub fn new(n: usize) -> Self {
        Table {
            bins: std::iter::repeat_with(Atomic::null).take(n).collect(),
            forwarding: Atomic::null(),
        }
    }

    /// Like `new`, but reports allocation failure instead of aborting.
    pub fn try_new(n: usize) -> Result<Self, TryReserveError> {
        let mut bins = Vec::new();
        #[cfg(test)]
        if FAIL_ALLOCATIONS.with(Cell::get) {
            bins.try_reserve_exact(usize::MAX)?;
        }
        bins.try_reserve_exact(n)?;
        bins.resize_with(n, Atomic::null);
        Ok(Table {
            bins: bins.into_boxed_slice(),
            forwarding: Atomic::null(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    #[inline]
    pub fn bini(&self, hash: i32) -> usize {
        debug_assert!(hash >= 0);
        (hash as usize) & (self.bins.len() - 1)
    }

    #[inline]
    pub fn bin<'g>(&self, i: usize, guard: &'g Guard) -> Shared<'g, BinEntry<V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub fn cas_bin<'g, P>(
        &self,
        i: usize,
        current: Shared<'_, BinEntry<V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<V>>, CompareExchangeError<'g, BinEntry<V>, P>>
    where
        P: Pointer<BinEntry<V>>,
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub fn store_bin<P: Pointer<BinEntry<V>>>(&self, i: usize, new: P) {
        self.bins[i].store(new, Ordering::Release)
    }

    /// Installs the forwarding entry pointing at `next`. Called once, by the
    /// thread that starts moving this table, before anyone can help.
    pub fn set_forwarding(&self, next: Shared<'_, Table<V>>, guard: &Guard) {
        let previous = self.forwarding.swap(
            Owned::new(BinEntry::Moved(next.as_raw())),
            Ordering::SeqCst,
            guard,
        );
        debug_assert!(previous.is_null());
    }

    #[inline]
    pub fn forwarding<'g>(&self, guard: &'g Guard) -> Shared<'g, BinEntry<V>> {
        self.forwarding.load(Ordering::SeqCst, guard)
    }

    /// Frees every node and value still reachable from the bins.
    pub fn drop_bins(&mut self) {
        // safety: we have `&mut self`, so no other thread can reach the bins.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in self.bins.iter() {
            let entry = bin.swap(Shared::null(), Ordering::Relaxed, guard);
            if entry.is_null() {
                continue;
            }

            let first = match *unsafe { entry.deref() } {
                // shared with every other migrated bin; freed in `drop`
                BinEntry::Moved(_) => continue,
                BinEntry::Node(_) => entry,
                BinEntry::Tree(ref tree) => tree.first.load(Ordering::Relaxed, guard),
                BinEntry::Reserved(_) => Shared::null(),
                BinEntry::TreeNode(_) => unreachable!("a tree node is never a bin head"),
            };

            let mut p = first;
            while let Some(node) = unsafe { p.as_ref() }.and_then(BinEntry::node) {
                let next = node.next.load(Ordering::Relaxed, guard);
                unsafe {
                    drop(node.value.load(Ordering::Relaxed, guard).into_owned());
                    drop(p.into_owned());
                }
                p = next;
            }

            if entry != first {
                drop(unsafe { entry.into_owned() });
            }
        }
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // safety: a table is dropped either through `&mut` access or once the epoch
        // has moved past every reader that could still see it.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let forwarding = self.forwarding.swap(Shared::null(), Ordering::Relaxed, guard);
        if forwarding.is_null() == false {
            drop(unsafe { forwarding.into_owned() });
        }
    }
}
