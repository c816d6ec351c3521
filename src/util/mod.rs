use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Once,
};

pub mod dir;
pub mod state;

/// Largest table the map will allocate.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

/// Number of CPUs, queried once.
pub fn ncpu() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

/// Smallest power of two that is at least `c`, capped at `MAXIMUM_CAPACITY`.
#[inline]
pub fn table_size_for(c: usize) -> usize {
    c.max(1)
        .checked_next_power_of_two()
        .map_or(MAXIMUM_CAPACITY, |n| n.min(MAXIMUM_CAPACITY))
}
