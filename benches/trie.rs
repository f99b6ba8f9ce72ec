// SPDX-License-Identifier: Apache-2.0

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tempfile::tempdir;
use vtrie::{Store, StoreOptions};

const KEY_COUNT: u32 = 2000;

fn keys() -> Vec<[u8; 4]> {
    (0..KEY_COUNT).map(|i| i.to_be_bytes()).collect()
}

fn populated_store() -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("bench.db"), StoreOptions::default()).unwrap();
    for k in keys() {
        store.insert(&k, b"value").unwrap();
    }
    (dir, store)
}

fn insert(c: &mut Criterion) {
    let ks = keys();
    c.bench_function("trie/insert_sequential", |b| b.iter_batched(
        || {
            let dir = tempdir().unwrap();
            let store = Store::create(dir.path().join("bench.db"), StoreOptions::default()).unwrap();
            (dir, store)
        },
        |(_dir, store)| {
            for k in &ks {
                store.insert(k, b"value").unwrap();
            }
        },
        BatchSize::PerIteration,
    ));
}

fn find(c: &mut Criterion) {
    let (_dir, store) = populated_store();
    let ks = keys();
    c.bench_function("trie/find_existing", |b| b.iter(|| {
        for k in &ks {
            store.get(k).unwrap();
        }
    }));
}

fn range_scan(c: &mut Criterion) {
    let (_dir, store) = populated_store();
    c.bench_function("trie/range_full_scan", |b| b.iter(|| {
        let mut cursor = store.range(None).unwrap();
        let mut n = 0;
        while cursor.next().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, KEY_COUNT as usize);
    }));
}

fn prefixed_erase(c: &mut Criterion) {
    c.bench_function("trie/prefixed_erase_all", |b| b.iter_batched(
        populated_store,
        |(_dir, store)| {
            let removed = store.remove_prefixed(&[0, 0]).unwrap();
            assert!(removed > 0);
        },
        BatchSize::PerIteration,
    ));
}

criterion_group!(benches, insert, find, range_scan, prefixed_erase);
criterion_main!(benches);
