//! A concurrent hash map from `i64` keys to values, built for many threads
//! reading and writing at once.
//!
//! [`ConcurrentLongMap`] follows the classic non-blocking table design:
//!
//!  - lookups never take a lock, and never wait for a resize;
//!  - updates lock a single bin, inserts into empty bins are a single CAS;
//!  - threads that run into a resize help moving bins to the new table;
//!  - bins overflowing with colliding keys become red-black trees;
//!  - the size is kept in a striped counter that spreads contention.
//!
//! Memory is reclaimed with [`crossbeam_epoch`]. Most operations pin the
//! current thread on their own; [`ConcurrentLongMap::get_ref`] takes a
//! [`Guard`] so the returned reference can outlive the call.
//!
//! ```
//! use concurrent_long_map::ConcurrentLongMap;
//!
//! let map = ConcurrentLongMap::new();
//! assert_eq!(map.put_if_absent(42, "a"), None);
//! assert_eq!(map.put_if_absent(42, "b"), Some("a"));
//! assert!(map.remove_if(42, &"a"));
//! assert_eq!(map.get(42), None);
//! ```
//!
//! Enable the `rayon` feature to fill a map from a parallel iterator. The
//! default `tracing` feature reports resizes and tree conversions.

mod config;
mod core;
mod error;
mod iter;
mod map;
#[cfg(feature = "rayon")]
mod rayon_impls;
mod util;

pub use config::{MapConfig, DEFAULT_CAPACITY, DEFAULT_CONCURRENCY_LEVEL, DEFAULT_LOAD_FACTOR};
pub use crossbeam_epoch::{pin, Guard};
pub use error::MapError;
pub use iter::Entries;
pub use map::ConcurrentLongMap;
