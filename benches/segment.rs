// SPDX-License-Identifier: Apache-2.0

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tempfile::tempdir;
use vtrie::{Store, StoreOptions};

fn fresh_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("bench.db"), StoreOptions::default()).unwrap();
    (dir, store)
}

fn segment_allocate(c: &mut Criterion) {
    c.bench_function("store/create", |b| b.iter_batched(
        tempdir,
        |dir| { Store::create(dir.path().join("bench.db"), StoreOptions::default()).unwrap(); },
        BatchSize::PerIteration,
    ));
}

fn segment_sync(c: &mut Criterion) {
    let (_dir, store) = fresh_store();
    for i in 0..1000u32 {
        store.insert(&i.to_be_bytes(), b"v").unwrap();
    }
    c.bench_function("store/sync", |b| b.iter(|| store.sync().unwrap()));
}

fn segment_reopen(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    {
        let store = Store::create(&path, StoreOptions::default()).unwrap();
        for i in 0..1000u32 {
            store.insert(&i.to_be_bytes(), b"v").unwrap();
        }
        store.sync().unwrap();
    }
    c.bench_function("store/open_existing", |b| b.iter(|| {
        Store::open(&path, StoreOptions::default()).unwrap();
    }));
}

criterion_group!(benches, segment_allocate, segment_sync, segment_reopen);
criterion_main!(benches);
