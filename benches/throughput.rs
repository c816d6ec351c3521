use std::{hint::black_box, sync::Arc, thread};

use concurrent_long_map::ConcurrentLongMap;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const KEYS: i64 = 100_000;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(KEYS as u64));

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let map = ConcurrentLongMap::new();
            for key in 0..KEYS {
                black_box(map.put(key, key));
            }
        });
    });

    group.bench_function("single_thread_presized", |b| {
        b.iter(|| {
            let map = ConcurrentLongMap::with_capacity(KEYS as usize);
            for key in 0..KEYS {
                black_box(map.put(key, key));
            }
        });
    });

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                let map = Arc::new(ConcurrentLongMap::new());
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let map = Arc::clone(&map);
                        thread::spawn(move || {
                            for key in (t..KEYS).step_by(threads as usize) {
                                black_box(map.put(key, key));
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(KEYS as u64));
    let map: Arc<ConcurrentLongMap<i64>> = Arc::new((0..KEYS).map(|k| (k, k)).collect());

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            for key in 0..KEYS {
                black_box(map.get(key));
            }
        });
    });

    group.bench_function("single_thread_one_guard", |b| {
        b.iter(|| {
            let guard = concurrent_long_map::pin();
            for key in 0..KEYS {
                black_box(map.get_ref(key, &guard));
            }
        });
    });

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let map = Arc::clone(&map);
                        thread::spawn(move || {
                            let guard = concurrent_long_map::pin();
                            for key in 0..KEYS {
                                black_box(map.get_ref(key, &guard));
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(KEYS as u64));

    group.bench_function("read_mostly_4_threads", |b| {
        let map: Arc<ConcurrentLongMap<i64>> = Arc::new((0..1_024).map(|k| (k, k)).collect());
        b.iter(|| {
            let handles: Vec<_> = (0..4i64)
                .map(|t| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for i in 0..KEYS / 4 {
                            let key = (i * 7 + t) % 1_024;
                            if i % 10 == 0 {
                                black_box(map.put(key, i));
                            } else {
                                black_box(map.get(key));
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_get, bench_mixed);
criterion_main!(benches);
