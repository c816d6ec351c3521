use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::util::ncpu;

/// Increment of the global probe seed sequence.
const PROBE_INCREMENT: u32 = 0x9e37_79b9;

static PROBE_SEEDER: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static PROBE: Cell<u32> = const { Cell::new(0) };
}

/// The calling thread's probe, seeding it on first use. Never zero.
fn probe() -> u32 {
    PROBE.with(|probe| {
        if probe.get() == 0 {
            let seed = PROBE_SEEDER
                .fetch_add(PROBE_INCREMENT, Ordering::Relaxed)
                .wrapping_add(PROBE_INCREMENT);
            probe.set(if seed == 0 { 1 } else { seed });
        }
        probe.get()
    })
}

/// Moves the calling thread to another cell after a collision.
fn advance_probe(mut h: u32) -> u32 {
    h ^= h << 13;
    h ^= h >> 17;
    h ^= h << 5;
    PROBE.with(|probe| probe.set(h));
    h
}

#[derive(Debug)]
#[repr(align(128))]
struct CounterCell {
    value: AtomicI64,
}

#[derive(Debug)]
struct CounterCells {
    cells: Box<[Atomic<CounterCell>]>,
}

impl CounterCells {
    fn new(n: usize) -> Self {
        CounterCells {
            cells: std::iter::repeat_with(Atomic::null).take(n).collect(),
        }
    }
}

/// How an addition landed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Added {
    /// On the base count, with no cells around. Carries the new sum.
    Base(i64),
    /// On the thread's cell at the first try.
    Cell,
    /// Only after retrying through the slow path.
    Contended,
}

/// A striped counter: a base count updated by CAS while uncontended, and an
/// array of cells that threads spread over once the base sees contention.
#[derive(Debug)]
pub struct Counter {
    base: AtomicI64,
    cells_busy: AtomicBool,
    cells: Atomic<CounterCells>,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    pub fn new() -> Self {
        Counter {
            base: AtomicI64::new(0),
            cells_busy: AtomicBool::new(false),
            cells: Atomic::null(),
        }
    }

    pub fn add(&self, x: i64, guard: &Guard) -> Added {
        let cells = self.cells.load(Ordering::Acquire, guard);
        if cells.is_null() {
            let b = self.base.load(Ordering::SeqCst);
            if self
                .base
                .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Added::Base(b + x);
            }
        }

        let mut uncontended = true;
        if let Some(cells_deref) = unsafe { cells.as_ref() } {
            let n = cells_deref.cells.len();
            let cell = cells_deref.cells[(probe() as usize) & (n - 1)].load(Ordering::Acquire, guard);
            if let Some(cell) = unsafe { cell.as_ref() } {
                let v = cell.value.load(Ordering::SeqCst);
                uncontended = cell
                    .value
                    .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                if uncontended {
                    return Added::Cell;
                }
            }
        }

        self.full_add(x, uncontended, guard);
        Added::Contended
    }

    fn full_add(&self, x: i64, mut was_uncontended: bool, guard: &Guard) {
        let mut h = probe();
        let mut collide = false;

        loop {
            let cells = self.cells.load(Ordering::Acquire, guard);
            if let Some(cells_deref) = unsafe { cells.as_ref() } {
                let n = cells_deref.cells.len();
                let slot = &cells_deref.cells[(n - 1) & h as usize];
                let cell = slot.load(Ordering::Acquire, guard);

                if cell.is_null() {
                    if self.cells_busy.load(Ordering::SeqCst) == false && self.try_lock_cells() {
                        let mut created = false;
                        // the array may have been replaced before we got the lock
                        if self.cells.load(Ordering::SeqCst, guard) == cells
                            && slot.load(Ordering::SeqCst, guard).is_null()
                        {
                            slot.store(
                                Owned::new(CounterCell {
                                    value: AtomicI64::new(x),
                                }),
                                Ordering::Release,
                            );
                            created = true;
                        }
                        self.unlock_cells();
                        if created {
                            return;
                        }
                        continue;
                    }
                    collide = false;
                } else {
                    let cell = unsafe { cell.deref() };
                    if was_uncontended == false {
                        // the CAS in `add` already failed on this cell
                        was_uncontended = true;
                    } else {
                        let v = cell.value.load(Ordering::SeqCst);
                        if cell
                            .value
                            .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                            .is_ok()
                        {
                            return;
                        }
                        if self.cells.load(Ordering::SeqCst, guard) != cells || n >= ncpu() {
                            collide = false;
                        } else if collide == false {
                            collide = true;
                        } else if self.cells_busy.load(Ordering::SeqCst) == false
                            && self.try_lock_cells()
                        {
                            if self.cells.load(Ordering::SeqCst, guard) == cells {
                                self.grow(cells, n << 1, guard);
                            }
                            self.unlock_cells();
                            collide = false;
                            continue;
                        }
                    }
                }
                h = advance_probe(h);
            } else if self.cells_busy.load(Ordering::SeqCst) == false
                && self.cells.load(Ordering::SeqCst, guard) == cells
                && self.try_lock_cells()
            {
                let mut init = false;
                if self.cells.load(Ordering::SeqCst, guard) == cells {
                    let fresh = CounterCells::new(2);
                    fresh.cells[(h & 1) as usize].store(
                        Owned::new(CounterCell {
                            value: AtomicI64::new(x),
                        }),
                        Ordering::Relaxed,
                    );
                    self.cells.store(Owned::new(fresh), Ordering::Release);
                    init = true;
                }
                self.unlock_cells();
                if init {
                    return;
                }
            } else {
                let b = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }

    /// Replaces `old` by an array of `n` slots holding the same cells. The
    /// caller holds the cells lock.
    fn grow(&self, old: Shared<'_, CounterCells>, n: usize, guard: &Guard) {
        let old_deref = unsafe { old.deref() };
        let fresh = CounterCells::new(n);
        for (to, from) in fresh.cells.iter().zip(old_deref.cells.iter()) {
            to.store(from.load(Ordering::SeqCst, guard), Ordering::Relaxed);
        }
        self.cells.store(Owned::new(fresh), Ordering::Release);
        // safety: cells are carried over by pointer and dropping the array
        // does not free them.
        unsafe { guard.defer_destroy(old) };
    }

    fn try_lock_cells(&self) -> bool {
        self.cells_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock_cells(&self) {
        self.cells_busy.store(false, Ordering::Release);
    }

    /// Base plus every cell. Not a snapshot while updates are in flight.
    pub fn sum(&self, guard: &Guard) -> i64 {
        let mut sum = self.base.load(Ordering::SeqCst);
        let cells = self.cells.load(Ordering::Acquire, guard);
        if let Some(cells) = unsafe { cells.as_ref() } {
            for cell in cells.cells.iter() {
                if let Some(cell) = unsafe { cell.load(Ordering::Acquire, guard).as_ref() } {
                    sum += cell.value.load(Ordering::SeqCst);
                }
            }
        }
        sum
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        // safety: we have `&mut self`.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::Relaxed, guard);
        if cells.is_null() {
            return;
        }
        let cells = unsafe { cells.into_owned() };
        for cell in cells.cells.iter() {
            let cell = cell.swap(Shared::null(), Ordering::Relaxed, guard);
            if cell.is_null() == false {
                drop(unsafe { cell.into_owned() });
            }
        }
    }
}
