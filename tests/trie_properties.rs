// SPDX-License-Identifier: Apache-2.0

//! Property tests for round-trip insert/find and prefixed-erase completeness,
//! over arbitrary small keysets.

use quickcheck_macros::quickcheck;
use tempfile::tempdir;
use vtrie::{Store, StoreOptions};

fn unique_keys(raw: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut seen = std::collections::HashSet::new();
    raw.into_iter().filter(|k| !k.is_empty() && seen.insert(k.clone())).take(64).collect()
}

#[quickcheck]
fn insert_then_find_round_trips(raw_keys: Vec<Vec<u8>>, raw_values: Vec<Vec<u8>>) -> bool {
    let keys = unique_keys(raw_keys);
    if keys.is_empty() {
        return true;
    }
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("prop.db"), StoreOptions::default()).unwrap();

    for (i, key) in keys.iter().enumerate() {
        let value = raw_values.get(i % raw_values.len().max(1)).cloned().unwrap_or_default();
        store.upsert(key, &value).unwrap();
    }

    keys.iter().enumerate().all(|(i, key)| {
        let expected = raw_values.get(i % raw_values.len().max(1)).cloned().unwrap_or_default();
        store.get(key).unwrap() == Some(expected)
    })
}

#[quickcheck]
fn prefixed_erase_removes_exactly_the_subtree(suffixes: Vec<Vec<u8>>) -> bool {
    let suffixes = unique_keys(suffixes);
    if suffixes.is_empty() {
        return true;
    }
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("prop2.db"), StoreOptions::default()).unwrap();

    let prefix = b"pfx-";
    for s in &suffixes {
        let mut key = prefix.to_vec();
        key.extend_from_slice(s);
        store.upsert(&key, b"v").unwrap();
    }
    store.upsert(b"outside", b"v").unwrap();

    let removed = store.remove_prefixed(prefix).unwrap();
    if removed as usize != suffixes.len() {
        return false;
    }

    let mut all_gone = true;
    for s in &suffixes {
        let mut key = prefix.to_vec();
        key.extend_from_slice(s);
        all_gone &= store.get(&key).unwrap().is_none();
    }
    all_gone && store.get(b"outside").unwrap() == Some(b"v".to_vec())
}

#[quickcheck]
fn free_list_conserves_block_count_across_insert_erase(raw_keys: Vec<Vec<u8>>) -> bool {
    let keys = unique_keys(raw_keys);
    if keys.is_empty() {
        return true;
    }
    let dir = tempdir().unwrap();
    let store = Store::create(dir.path().join("prop3.db"), StoreOptions::default()).unwrap();

    for key in &keys {
        store.upsert(key, b"v").unwrap();
    }
    assert_eq!(store.len().unwrap(), keys.len() as u64);

    for key in &keys {
        store.remove(key).unwrap();
    }
    store.is_empty().unwrap()
}
