use std::sync::atomic::{AtomicUsize, Ordering};

use concurrent_long_map::{ConcurrentLongMap, MapConfig, MapError};

#[test]
fn put_if_absent_then_conditional_remove() {
    let map = ConcurrentLongMap::new();
    assert_eq!(map.put_if_absent(42, "a"), None);
    assert_eq!(map.put_if_absent(42, "b"), Some("a"));
    assert_eq!(map.get(42), Some("a"));
    assert!(map.remove_if(42, &"wrong") == false);
    assert_eq!(map.get(42), Some("a"));
    assert!(map.remove_if(42, &"a"));
    assert_eq!(map.get(42), None);
    assert!(map.is_empty());
}

#[test]
fn read_your_write() {
    let map = ConcurrentLongMap::new();
    for key in [0, 1, -1, i64::MIN, i64::MAX, 1 << 40] {
        assert_eq!(map.put(key, key.wrapping_mul(3)), None);
        assert_eq!(map.get(key), Some(key.wrapping_mul(3)));
        assert!(map.contains_key(key));
    }
    assert_eq!(map.size(), 6);
}

#[test]
fn put_returns_previous_value() {
    let map = ConcurrentLongMap::new();
    assert_eq!(map.put(7, String::from("one")), None);
    assert_eq!(map.put(7, String::from("two")), Some(String::from("one")));
    assert_eq!(map.get(7).as_deref(), Some("two"));
    assert_eq!(map.size(), 1);
}

#[test]
fn remove_round_trip() {
    let map = ConcurrentLongMap::new();
    map.put(5, 50);
    assert_eq!(map.remove(5), Some(50));
    assert_eq!(map.get(5), None);
    assert_eq!(map.remove(5), None);
    assert_eq!(map.size(), 0);
}

#[test]
fn operations_on_an_empty_map() {
    let map = ConcurrentLongMap::<u8>::new();
    assert_eq!(map.get(1), None);
    assert_eq!(map.remove(1), None);
    assert_eq!(map.replace(1, 1), None);
    assert!(map.replace_if(1, &0, 1) == false);
    assert!(map.keys().is_empty());
    assert_eq!(map.entries().count(), 0);
    map.clear();
    assert!(map.is_empty());
}

#[test]
fn replace_only_touches_present_keys() {
    let map = ConcurrentLongMap::new();
    assert_eq!(map.replace(1, 10), None);
    assert!(map.contains_key(1) == false);

    map.put(1, 10);
    assert_eq!(map.replace(1, 11), Some(10));
    assert!(map.replace_if(1, &10, 12) == false);
    assert!(map.replace_if(1, &11, 12));
    assert_eq!(map.get(1), Some(12));
    assert_eq!(map.size(), 1);
}

#[test]
fn compute_if_absent_runs_once() {
    let map = ConcurrentLongMap::new();
    let calls = AtomicUsize::new(0);
    let compute = || {
        calls.fetch_add(1, Ordering::SeqCst);
        99
    };

    assert_eq!(map.compute_if_absent(3, compute), 99);
    assert_eq!(map.compute_if_absent(3, || 0), 99);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // in a chain rather than an empty bin
    map.put(3 + 16, 1);
    assert_eq!(map.compute_if_absent(3 + 32, || 2), 2);
    assert_eq!(map.compute_if_absent(3 + 16, || 3), 1);
    assert_eq!(map.size(), 3);
}

#[test]
fn get_or_default_does_not_insert() {
    let map = ConcurrentLongMap::new();
    assert_eq!(map.get_or_default(1, 5), 5);
    assert!(map.contains_key(1) == false);
    map.put(1, 6);
    assert_eq!(map.get_or_default(1, 5), 6);
}

#[test]
fn snapshots() {
    let map: ConcurrentLongMap<i64> = (0..100).map(|k| (k, k * 10)).collect();
    let mut keys = map.keys();
    keys.sort_unstable();
    assert_eq!(keys, (0..100).collect::<Vec<_>>());

    let mut values = map.values();
    values.sort_unstable();
    assert_eq!(values, (0..100).map(|k| k * 10).collect::<Vec<_>>());

    assert!(map.contains_value(&990));
    assert!(map.contains_value(&991) == false);
    assert_eq!(map.mapping_count(), 100);
}

#[test]
fn clear_removes_everything() {
    let map = ConcurrentLongMap::new();
    for key in 0..1_000 {
        map.put(key, key);
    }
    map.clear();
    assert_eq!(map.size(), 0);
    assert!(map.keys().is_empty());
    assert_eq!(map.get(500), None);

    map.put(500, 1);
    assert_eq!(map.size(), 1);
}

#[test]
fn entries_remove_last_returned() {
    let map = ConcurrentLongMap::new();
    for key in 0..64 {
        map.put(key, key);
    }

    let mut entries = map.entries();
    assert_eq!(entries.remove(), None);
    let mut removed = 0;
    while let Some((key, value)) = entries.next() {
        assert_eq!(key, value);
        if key % 2 == 0 {
            assert_eq!(entries.remove(), Some(value));
            assert_eq!(entries.remove(), None);
            removed += 1;
        }
    }
    drop(entries);

    assert_eq!(removed, 32);
    assert_eq!(map.size(), 32);
    assert!((0..64).all(|key| map.contains_key(key) == (key % 2 == 1)));
}

#[test]
fn extend_through_shared_reference() {
    let map = ConcurrentLongMap::new();
    (&map).extend((0..10).map(|k| (k, k)));
    (&map).extend(vec![(0, 100)]);
    assert_eq!(map.size(), 10);
    assert_eq!(map.get(0), Some(100));
}

#[test]
fn debug_lists_entries() {
    let map = ConcurrentLongMap::new();
    assert_eq!(format!("{:?}", map), "{}");
    map.put(1, "a");
    assert_eq!(format!("{:?}", map), r#"{1: "a"}"#);
}

#[test]
fn get_ref_is_tied_to_the_guard() {
    let map = ConcurrentLongMap::new();
    map.put(1, vec![1, 2, 3]);
    let guard = concurrent_long_map::pin();
    let value = map.get_ref(1, &guard).unwrap();
    map.put(1, vec![4]);
    // the replaced vector stays readable until the guard is dropped
    assert_eq!(value, &vec![1, 2, 3]);
    assert_eq!(map.get_ref(1, &guard), Some(&vec![4]));
}

#[test]
fn construction_errors() {
    assert_eq!(
        ConcurrentLongMap::<u8>::with_capacity_and_load_factor(16, 0.0).err(),
        Some(MapError::InvalidLoadFactor(0.0))
    );
    assert!(ConcurrentLongMap::<u8>::with_capacity_and_load_factor(16, f32::NAN).is_err());
    assert_eq!(
        ConcurrentLongMap::<u8>::with_config(MapConfig::new().concurrency_level(0)).err(),
        Some(MapError::InvalidConcurrencyLevel)
    );

    let map = ConcurrentLongMap::with_config(MapConfig::new().initial_capacity(1_000).load_factor(0.5)).unwrap();
    map.put(1, 1);
    assert_eq!(map.get(1), Some(1));
}

#[test]
fn values_are_dropped_exactly_once() {
    use std::sync::Arc;

    let tracker = Arc::new(());
    {
        let map = ConcurrentLongMap::new();
        for key in 0..200 {
            map.put(key, Arc::clone(&tracker));
        }
        for key in 0..50 {
            map.remove(key);
        }
        for key in 50..100 {
            map.put(key, Arc::clone(&tracker));
        }
        map.clear();
        for key in 0..20 {
            map.put(key, Arc::clone(&tracker));
        }
    }

    // retired values are freed once the epoch moves on
    for _ in 0..10_000 {
        if Arc::strong_count(&tracker) == 1 {
            break;
        }
        crossbeam_epoch::pin().flush();
        std::thread::yield_now();
    }
    assert_eq!(Arc::strong_count(&tracker), 1);
}
