// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios against the top-level [`vtrie::Store`] façade.

use pretty_assertions::assert_eq as assert_eq_pretty;
use tempfile::tempdir;
use vtrie::{Store, StoreOptions};

fn open_store(dir: &tempfile::TempDir, name: &str) -> Store {
    let _ = env_logger::builder().is_test(true).try_init();
    Store::create(dir.path().join(name), StoreOptions::default()).expect("create store")
}

/// S1: insert a handful of keys, read them all back.
#[test]
fn basic_insert_and_find() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "s1.db");

    assert_eq!(store.nodes_count().unwrap(), 0);
    assert!(store.insert(b"alpha", b"1").unwrap());
    // One chain node holds "alpha" whole (it fits the inline stem capacity).
    assert_eq!(store.nodes_count().unwrap(), 1);
    assert!(store.insert(b"beta", b"2").unwrap());
    // "beta" shares no prefix with "alpha": the existing node is reused
    // (re-stemmed, not reallocated) as a child of a fresh empty-stem root,
    // alongside a fresh chain node for "beta" -- two more allocations.
    assert_eq!(store.nodes_count().unwrap(), 3);
    assert!(store.insert(b"gamma", b"3").unwrap());
    // "gamma" only needs a new child hung off the existing root.
    assert_eq!(store.nodes_count().unwrap(), 4);

    assert_eq!(store.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"beta").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.get(b"gamma").unwrap(), Some(b"3".to_vec()));
    assert_eq!(store.get(b"delta").unwrap(), None);
    assert_eq!(store.len().unwrap(), 3);
}

/// S2: a duplicate `insert` is a no-op; `upsert` replaces.
#[test]
fn duplicate_insert_is_rejected_upsert_replaces() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "s2.db");

    assert!(store.insert(b"key", b"first").unwrap());
    assert!(!store.insert(b"key", b"second").unwrap());
    assert_eq!(store.get(b"key").unwrap(), Some(b"first".to_vec()));

    assert!(store.upsert(b"key", b"second").unwrap());
    assert_eq!(store.get(b"key").unwrap(), Some(b"second".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
}

/// S3: two keys sharing a prefix but diverging mid-stem force a node split;
/// both keys and their shared ancestor prefix keys must remain reachable.
#[test]
fn diverging_keys_split_shared_stem() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "s3.db");

    assert!(store.insert(b"application", b"a").unwrap());
    assert!(store.insert(b"apple", b"b").unwrap());
    assert!(store.insert(b"app", b"c").unwrap());

    assert_eq!(store.get(b"application").unwrap(), Some(b"a".to_vec()));
    assert_eq!(store.get(b"apple").unwrap(), Some(b"b".to_vec()));
    assert_eq!(store.get(b"app").unwrap(), Some(b"c".to_vec()));
    assert_eq!(store.len().unwrap(), 3);
    // "application" (1) splits against "apple" into a shared "appl" node plus
    // the re-stemmed original and a new leaf for "e" (+2 = 3), then "app"
    // splits that shared node again into "app"/"l" (+1 = 4).
    assert_eq!(store.nodes_count().unwrap(), 4);

    let keys: Vec<_> = collect(&store, None);
    assert_eq_pretty!(keys, vec![b"app".to_vec(), b"apple".to_vec(), b"application".to_vec()]);
}

/// S4: prefixed erase removes every key under a prefix, whether or not the
/// prefix itself is a stored terminal, and leaves unrelated keys intact.
#[test]
fn prefixed_erase_removes_subtree_only() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "s4.db");

    for k in [b"car".as_slice(), b"card", b"care", b"careful", b"cat"] {
        store.insert(k, b"v").unwrap();
    }

    let removed = store.remove_prefixed(b"car").unwrap();
    assert_eq!(removed, 4);
    assert_eq!(store.get(b"car").unwrap(), None);
    assert_eq!(store.get(b"card").unwrap(), None);
    assert_eq!(store.get(b"care").unwrap(), None);
    assert_eq!(store.get(b"careful").unwrap(), None);
    assert_eq!(store.get(b"cat").unwrap(), Some(b"v".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
}

/// S5: a lower-bound cursor started from a key that falls in a gap between
/// two stored keys resumes at the next key in order.
#[test]
fn lower_bound_resumes_after_gap() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "s5.db");

    for k in [b"b".as_slice(), b"d", b"f"] {
        store.insert(k, b"v").unwrap();
    }

    let mut cursor = store.range(Some(b"c")).unwrap();
    let (key, _) = cursor.next().unwrap().expect("a key at or after 'c'");
    assert_eq!(key, b"d");
    let (key, _) = cursor.next().unwrap().expect("next key");
    assert_eq!(key, b"f");
    assert!(cursor.next().unwrap().is_none());
}

/// S6: a second writer on another thread is refused the write lock while the
/// first transaction is still open, per the default `Prevent` isolation
/// policy — it must not silently interleave.
#[test]
fn concurrent_writers_are_serialized() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let dir = tempdir().unwrap();
    let store = Arc::new(open_store(&dir, "s6.db"));

    let manager = store.manager().clone();
    let txn = manager.begin_transaction().expect("first writer starts");

    let saw_conflict = Arc::new(AtomicBool::new(false));
    let saw_conflict2 = saw_conflict.clone();
    let manager2 = manager.clone();
    let handle = std::thread::spawn(move || {
        if manager2.begin_transaction().is_err() {
            saw_conflict2.store(true, Ordering::SeqCst);
        }
    });
    handle.join().unwrap();

    assert!(saw_conflict.load(Ordering::SeqCst), "a second writer must be rejected while one is open");
    txn.rollback();
}

fn collect(store: &Store, start: Option<&[u8]>) -> Vec<Vec<u8>> {
    let mut cursor = store.range(start).unwrap();
    let mut out = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        out.push(k);
    }
    out
}

#[test]
fn range_yields_all_keys_in_order() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "range.db");

    let mut expected: Vec<&[u8]> = vec![b"zeta", b"alpha", b"mu", b"beta", b"omega"];
    for k in &expected {
        store.insert(k, b"v").unwrap();
    }
    expected.sort();

    let keys = collect(&store, None);
    assert_eq!(keys, expected.iter().map(|k| k.to_vec()).collect::<Vec<_>>());
}

#[test]
fn prefixed_range_is_bounded_to_prefix() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "prefixed_range.db");

    for k in [b"dog".as_slice(), b"door", b"dot", b"cat"] {
        store.insert(k, b"v").unwrap();
    }

    let mut cursor = store.prefixed_range(b"do").unwrap();
    let mut out = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        out.push(k);
    }
    assert_eq!(out, vec![b"dog".to_vec(), b"door".to_vec(), b"dot".to_vec()]);
}

#[test]
fn reopening_an_existing_store_preserves_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");

    {
        let store = Store::create(&path, StoreOptions::default()).unwrap();
        store.insert(b"persisted", b"value").unwrap();
        store.sync().unwrap();
    }

    let store = Store::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(store.get(b"persisted").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn remove_returns_prior_value_and_shrinks_len() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "remove.db");

    store.insert(b"k1", b"v1").unwrap();
    store.insert(b"k2", b"v2").unwrap();
    assert_eq!(store.len().unwrap(), 2);

    let removed = store.remove(b"k1").unwrap();
    assert_eq!(removed, Some(b"v1".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.remove(b"k1").unwrap(), None);
}

#[test]
fn empty_store_reports_empty() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir, "empty.db");
    assert!(store.is_empty().unwrap());
    store.insert(b"x", b"y").unwrap();
    assert!(!store.is_empty().unwrap());
}
