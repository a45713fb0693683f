use regex::Regex;
use tempfile::tempdir;

use crate::{KvStore, StoreError};

#[test]
fn open_creates_parent_directories() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("moustique.db");

    let store = KvStore::open(&path).unwrap();
    assert!(path.exists());
    assert_eq!(store.count(), 0);
}

#[test]
fn put_get_has_count() {
    let dir = tempdir().unwrap();
    let store = KvStore::open(dir.path().join("moustique.db")).unwrap();

    store.put("/a/b", "one");
    store.put("/a/c", "two");
    store.put("/a/b", "one-rewritten");

    assert_eq!(store.count(), 2);
    assert!(store.has("/a/b"));
    assert!(!store.has("/missing"));
    assert_eq!(store.get("/a/b").unwrap(), "one-rewritten");
}

#[test]
fn get_missing_key_is_not_found() {
    let dir = tempdir().unwrap();
    let store = KvStore::open(dir.path().join("moustique.db")).unwrap();

    match store.get("/nope") {
        Err(StoreError::NotFound(key)) => assert_eq!(key, "/nope"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn keys_matching_filters_by_regex() {
    let dir = tempdir().unwrap();
    let store = KvStore::open(dir.path().join("moustique.db")).unwrap();

    store.put("/sensors/temp", "21");
    store.put("/sensors/humidity", "40");
    store.put("/actuators/fan", "on");

    let re = Regex::new("^/sensors/").unwrap();
    let mut keys = store.keys_matching(&re);
    keys.sort();
    assert_eq!(keys, ["/sensors/humidity", "/sensors/temp"]);

    assert_eq!(store.keys().len(), 3);
}

#[test]
fn save_all_then_load_all_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("moustique.db");

    {
        let store = KvStore::open(&path).unwrap();
        store.put("k1", "v1");
        store.put("k2", "v2");
        store.put("k1", "v1-final");
        assert_eq!(store.save_all().unwrap(), 2);
    }

    let fresh = KvStore::open(&path).unwrap();
    assert_eq!(fresh.count(), 0);
    assert_eq!(fresh.load_all().unwrap(), 2);
    assert_eq!(fresh.get("k1").unwrap(), "v1-final");
    assert_eq!(fresh.get("k2").unwrap(), "v2");
}

#[test]
fn save_all_overwrites_previous_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("moustique.db");

    let store = KvStore::open(&path).unwrap();
    store.put("k", "first");
    store.save_all().unwrap();
    store.put("k", "second");
    store.save_all().unwrap();

    let fresh = KvStore::open(&path).unwrap();
    fresh.load_all().unwrap();
    assert_eq!(fresh.get("k").unwrap(), "second");
}

#[test]
fn load_all_on_empty_table_is_zero() {
    let dir = tempdir().unwrap();
    let store = KvStore::open(dir.path().join("moustique.db")).unwrap();
    assert_eq!(store.load_all().unwrap(), 0);
}
