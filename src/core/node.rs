use crossbeam_epoch::Atomic;
use parking_lot::Mutex;

use super::bin_entry::BinEntry;

/// Usable bits of a normal node hash. The sign bit stays clear so that real
/// entries never collide with the sentinel codes.
pub const HASH_BITS: i32 = 0x7fff_ffff;

/// Folds the high half of the key into the low half, then the upper 16 bits
/// of the result into the lower 16, so that keys which only differ in high
/// bits do not all land in the same bin of a power-of-two table.
#[inline]
pub fn spread(key: i64) -> i32 {
    let h = (key ^ ((key as u64) >> 32) as i64) as i32;
    (h ^ ((h as u32) >> 16) as i32) & HASH_BITS
}

#[derive(Debug)]
pub struct Node<V> {
    pub hash: i32,
    pub key: i64,
    pub value: Atomic<V>,
    pub next: Atomic<BinEntry<V>>,
    pub lock: Mutex<()>,
}

impl<V> Node<V> {
    pub fn new<AV>(hash: i32, key: i64, value: AV, next: Atomic<BinEntry<V>>) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Node {
            hash,
            key,
            value: value.into(),
            next,
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn matches(&self, hash: i32, key: i64) -> bool {
        self.hash == hash && self.key == key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_is_non_negative() {
        for key in [0, 1, -1, i64::MIN, i64::MAX, 0x7fff_ffff_0000_0000, -42] {
            assert!(spread(key) >= 0, "spread({}) was negative", key);
        }
    }

    #[test]
    fn spread_mixes_high_bits() {
        // keys that only differ above bit 32 must not share the low bits
        let a = spread(1);
        let b = spread(1 | (1 << 33));
        assert_ne!(a & 0xf, b & 0xf);
    }

    #[test]
    fn spread_of_small_keys_is_identity() {
        for key in 0..1024 {
            assert_eq!(spread(key), key as i32);
        }
    }
}
