use tempfile::TempDir;

use super::helpers::{disk_config, flush_and_wait, memory_only_config, open, sv};
use crate::engine::{Engine, EngineError};

#[test]
fn set_then_get_from_memory() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("v")).unwrap();
    assert_eq!(engine.get(0, b"k").unwrap(), Some(&sv("v")));
    assert_eq!(engine.db_size(0).unwrap(), 1);
}

#[test]
fn get_missing_key_returns_none() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());
    assert_eq!(engine.get(0, b"nope").unwrap(), None);
    assert_eq!(engine.stats().keyspace_misses, 1);
}

#[test]
fn read_through_loads_flushed_key_back_into_memory() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"cold", sv("value")).unwrap();
    flush_and_wait(&mut engine);

    // Simulate eviction-by-restart: drop and reopen the engine so the
    // dictionary is empty but the disk copy exists.
    engine.close().unwrap();
    let mut engine = open(tmp.path());
    assert_eq!(engine.db_size(0).unwrap(), 0);

    let misses_before = engine.stats().cache_misses;
    assert_eq!(engine.get(0, b"cold").unwrap(), Some(&sv("value")));
    assert_eq!(engine.stats().cache_misses, misses_before + 1);

    // Resident now; the second read is a cache hit.
    let hits_before = engine.stats().cache_hits;
    assert_eq!(engine.get(0, b"cold").unwrap(), Some(&sv("value")));
    assert_eq!(engine.stats().cache_hits, hits_before + 1);
    assert_eq!(engine.db_size(0).unwrap(), 1);
}

#[test]
fn dirty_deleted_key_is_never_served_from_disk() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("v")).unwrap();
    flush_and_wait(&mut engine);

    // Delete but do not flush: the key is dirty and non-resident, and
    // the stale disk copy must stay invisible.
    assert!(engine.delete(0, b"k").unwrap());
    let reads_before = engine.stats().disk_reads;
    assert_eq!(engine.get(0, b"k").unwrap(), None);
    assert!(!engine.exists(0, b"k").unwrap());
    assert_eq!(engine.stats().disk_reads, reads_before);
}

#[test]
fn key_length_validation_at_the_boundary() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    assert!(matches!(
        engine.set(0, b"", sv("v")),
        Err(EngineError::InvalidKey)
    ));
    assert!(matches!(engine.get(0, b""), Err(EngineError::InvalidKey)));

    let key_511 = vec![b'x'; 511];
    engine.set(0, &key_511, sv("fits")).unwrap();
    assert_eq!(engine.get(0, &key_511).unwrap(), Some(&sv("fits")));

    let key_512 = vec![b'x'; 512];
    assert!(matches!(
        engine.set(0, &key_512, sv("v")),
        Err(EngineError::InvalidKey)
    ));
    assert!(matches!(
        engine.delete(0, &key_512),
        Err(EngineError::InvalidKey)
    ));
}

#[test]
fn memory_only_mode_skips_validation_and_disk() {
    let tmp = TempDir::new().unwrap();
    let mut engine = Engine::open(tmp.path(), memory_only_config()).unwrap();

    // No length limits without the disk store.
    engine.set(0, b"", sv("empty key")).unwrap();
    let long_key = vec![b'x'; 4096];
    engine.set(0, &long_key, sv("long")).unwrap();
    assert_eq!(engine.get(0, &long_key).unwrap(), Some(&sv("long")));

    assert!(engine.delete(0, &long_key).unwrap());
    assert!(!engine.delete(0, &long_key).unwrap());

    engine.close().unwrap();
    // Nothing ever touched disk.
    assert!(!tmp.path().join("data.mdb").exists());
}

#[test]
fn databases_are_independent() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("zero")).unwrap();
    engine.set(1, b"k", sv("one")).unwrap();
    assert_eq!(engine.get(0, b"k").unwrap(), Some(&sv("zero")));
    assert_eq!(engine.get(1, b"k").unwrap(), Some(&sv("one")));

    assert!(engine.delete(0, b"k").unwrap());
    assert_eq!(engine.get(0, b"k").unwrap(), None);
    assert_eq!(engine.get(1, b"k").unwrap(), Some(&sv("one")));
}

#[test]
fn bad_database_index_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut engine = Engine::open(tmp.path(), disk_config()).unwrap();
    assert!(matches!(
        engine.get(99, b"k"),
        Err(EngineError::BadDatabase)
    ));
    assert!(matches!(
        engine.set(4, b"k", sv("v")),
        Err(EngineError::BadDatabase)
    ));
    assert!(matches!(engine.mem_keys(17), Err(EngineError::BadDatabase)));
}

#[test]
fn value_kind_reports_the_stored_type() {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::value::{Value, ValueKind};

    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"s", sv("x")).unwrap();
    engine
        .set(0, b"l", Value::List(vec![b"a".to_vec()]))
        .unwrap();
    engine
        .set(0, b"set", Value::Set(BTreeSet::from([b"m".to_vec()])))
        .unwrap();
    engine
        .set(0, b"z", Value::ZSet(BTreeMap::from([(b"m".to_vec(), 1.5)])))
        .unwrap();
    engine
        .set(
            0,
            b"h",
            Value::Hash(BTreeMap::from([(b"f".to_vec(), b"v".to_vec())])),
        )
        .unwrap();

    assert_eq!(engine.value_kind(0, b"s").unwrap(), Some(ValueKind::Str));
    assert_eq!(engine.value_kind(0, b"l").unwrap(), Some(ValueKind::List));
    assert_eq!(engine.value_kind(0, b"set").unwrap(), Some(ValueKind::Set));
    assert_eq!(engine.value_kind(0, b"z").unwrap(), Some(ValueKind::ZSet));
    assert_eq!(engine.value_kind(0, b"h").unwrap(), Some(ValueKind::Hash));
    assert_eq!(engine.value_kind(0, b"missing").unwrap(), None);
}

#[test]
fn non_string_values_survive_the_disk_round_trip() {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::value::Value;

    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    let list = Value::List(vec![b"a".to_vec(), b"b".to_vec()]);
    let set = Value::Set(BTreeSet::from([b"x".to_vec(), b"y".to_vec()]));
    let zset = Value::ZSet(BTreeMap::from([
        (b"one".to_vec(), 1.0),
        (b"two".to_vec(), 2.0),
    ]));
    let hash = Value::Hash(BTreeMap::from([(b"f".to_vec(), b"v".to_vec())]));

    engine.set(0, b"l", list.clone()).unwrap();
    engine.set(0, b"s", set.clone()).unwrap();
    engine.set(0, b"z", zset.clone()).unwrap();
    engine.set(0, b"h", hash.clone()).unwrap();
    flush_and_wait(&mut engine);

    engine.close().unwrap();
    let mut engine = open(tmp.path());
    assert_eq!(engine.get(0, b"l").unwrap(), Some(&list));
    assert_eq!(engine.get(0, b"s").unwrap(), Some(&set));
    assert_eq!(engine.get(0, b"z").unwrap(), Some(&zset));
    assert_eq!(engine.get(0, b"h").unwrap(), Some(&hash));
}
