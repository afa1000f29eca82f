use std::fs;

use tempfile::TempDir;

use super::helpers::{flush_and_wait, open, sv};

/// Make the next environment open fail by putting a directory where the
/// data file belongs. Root-proof, unlike permission tricks.
fn sabotage_data_file(dir: &std::path::Path) {
    let data = dir.join("data.mdb");
    fs::rename(&data, dir.join("data.bak")).expect("stash data file");
    fs::create_dir(&data).expect("plant directory");
}

fn repair_data_file(dir: &std::path::Path) {
    let data = dir.join("data.mdb");
    fs::remove_dir(&data).expect("remove planted directory");
    fs::rename(dir.join("data.bak"), &data).expect("restore data file");
}

#[test]
fn failed_flush_merges_keys_back_and_a_retry_succeeds() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("old")).unwrap();
    flush_and_wait(&mut engine);

    engine.set(0, b"k", sv("new")).unwrap();
    assert_eq!(engine.dirty_key_count(), 1);

    sabotage_data_file(tmp.path());
    engine.flush().unwrap();
    let done = engine.wait_flush().expect("completion");
    assert!(done.outcome.is_err());

    // The key rotated into flushing must be back in dirty for retry.
    assert_eq!(engine.stats().flush_failure, 1);
    assert_eq!(engine.dirty_key_count(), 1);
    assert_eq!(engine.flushing_key_count(), 0);

    // The unflushed value is still served from memory.
    assert_eq!(engine.get(0, b"k").unwrap(), Some(&sv("new")));

    repair_data_file(tmp.path());
    flush_and_wait(&mut engine);
    assert_eq!(engine.dirty_key_count(), 0);

    engine.close().unwrap();
    let mut engine = open(tmp.path());
    assert_eq!(engine.get(0, b"k").unwrap(), Some(&sv("new")));
}

#[test]
fn failed_flush_retries_deletions_too() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"doomed", sv("v")).unwrap();
    flush_and_wait(&mut engine);
    assert!(engine.delete(0, b"doomed").unwrap());

    sabotage_data_file(tmp.path());
    engine.flush().unwrap();
    assert!(engine.wait_flush().unwrap().outcome.is_err());
    assert_eq!(engine.dirty_key_count(), 1);

    repair_data_file(tmp.path());
    flush_and_wait(&mut engine);

    engine.close().unwrap();
    let mut engine = open(tmp.path());
    assert_eq!(engine.get(0, b"doomed").unwrap(), None);
    assert_eq!(engine.disk_key_count(0).unwrap(), 0);
}

#[test]
fn dirty_and_flushing_stay_disjoint_through_failures() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"a", sv("1")).unwrap();
    sabotage_data_file_if_present(tmp.path());

    engine.flush().unwrap();
    // New write while the (failing) flush runs.
    engine.set(0, b"b", sv("2")).unwrap();
    let _ = engine.wait_flush().unwrap();

    // No worker live: the flushing sets must be empty again, whatever
    // happened — merged back on failure, cleared on success.
    assert!(!engine.flush_active());
    assert_eq!(engine.flushing_key_count(), 0);
    assert!(engine.dirty_key_count() >= 1);
}

fn sabotage_data_file_if_present(dir: &std::path::Path) {
    if dir.join("data.mdb").exists() {
        sabotage_data_file(dir);
    }
}
