//! Store benchmarks: point writes, point reads, seeks and sessions.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use ordstore_state::{SeekDirection, Store};

const PRELOAD: u64 = 10_000;

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn preloaded() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    for i in 0..PRELOAD {
        store.put(&key(i), &[0xAB; 64]).unwrap();
    }
    (store, dir)
}

fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let mut i = 0u64;

    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));
    group.bench_function("buffered_64b", |b| {
        b.iter(|| {
            i += 1;
            store.put(&key(i), &[0xCD; 64]).unwrap();
        })
    });
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let (store, _dir) = preloaded();
    let mut rng = StdRng::seed_from_u64(7);

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hit", |b| {
        b.iter(|| {
            let k = key(rng.gen_range(0..PRELOAD));
            black_box(store.try_get(&k).unwrap())
        })
    });
    group.bench_function("miss", |b| {
        b.iter(|| {
            let k = key(PRELOAD + rng.gen_range(0..PRELOAD));
            black_box(store.try_get(&k).unwrap())
        })
    });
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let (store, _dir) = preloaded();
    let mut rng = StdRng::seed_from_u64(11);

    let mut group = c.benchmark_group("seek");
    group.throughput(Throughput::Elements(100));
    group.bench_function("forward_100", |b| {
        b.iter(|| {
            let start = key(rng.gen_range(0..PRELOAD));
            black_box(store.seek(&start, SeekDirection::Forward).take(100).count())
        })
    });
    group.bench_function("backward_100", |b| {
        b.iter(|| {
            let start = key(rng.gen_range(0..PRELOAD));
            black_box(store.seek(&start, SeekDirection::Backward).take(100).count())
        })
    });
    group.bench_function("range_100", |b| {
        b.iter(|| {
            let lo = rng.gen_range(0..PRELOAD - 100);
            black_box(store.find_range(&key(lo), &key(lo + 99)).count())
        })
    });
    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let (store, _dir) = preloaded();
    let mut next = PRELOAD;

    c.bench_function("session_commit_16", |b| {
        b.iter_batched(
            || store.get_snapshot().unwrap(),
            |mut session| {
                for _ in 0..16 {
                    next += 1;
                    session.put(&key(next), &[0xEF; 64]);
                }
                session.commit().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_put, bench_get, bench_seek, bench_session);
criterion_main!(benches);
