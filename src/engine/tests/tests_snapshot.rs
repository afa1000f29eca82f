use std::fs;
use std::io;

use tempfile::TempDir;

use super::helpers::{disk_config, flush_and_wait, open, sv};
use crate::engine::flush::BackgroundKind;
use crate::engine::{Engine, EngineConfig, EngineError};

#[test]
fn snapshot_copies_the_environment() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"a", sv("1")).unwrap();
    engine.set(0, b"b", sv("2")).unwrap();

    engine.snapshot().unwrap();
    let done = engine.wait_flush().expect("completion");
    assert_eq!(done.kind, BackgroundKind::Snapshot);
    done.outcome.expect("snapshot ok");

    let snap_dir = tmp.path().join("snapshot");
    assert!(snap_dir.join("data.mdb").exists());

    // The copy is a fully usable store with the post-flush state.
    let mut copy = open(&snap_dir);
    assert_eq!(copy.get(0, b"a").unwrap(), Some(&sv("1")));
    assert_eq!(copy.get(0, b"b").unwrap(), Some(&sv("2")));
    copy.close().unwrap();
}

#[test]
fn snapshot_queued_behind_a_running_flush() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    for i in 0..32u32 {
        engine.set(0, format!("k{i:02}").as_bytes(), sv("v")).unwrap();
    }

    // An internally-started flush has no requestor, so the snapshot can
    // queue behind it rather than being rejected.
    engine.flush_cycle().unwrap();
    engine.snapshot().unwrap();

    let first = engine.wait_flush().expect("flush completion");
    assert_eq!(first.kind, BackgroundKind::Flush);
    first.outcome.expect("flush ok");

    // The completion handler dispatched the queued snapshot.
    assert!(engine.flush_active());
    let second = engine.wait_flush().expect("snapshot completion");
    assert_eq!(second.kind, BackgroundKind::Snapshot);
    second.outcome.expect("snapshot ok");

    let mut copy = open(&tmp.path().join("snapshot"));
    let keys = copy.keys(0, "*").unwrap();
    assert_eq!(keys.len(), 32);
    copy.close().unwrap();
}

#[test]
fn snapshot_reentry_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());
    engine.set(0, b"k", sv("v")).unwrap();

    engine.flush_cycle().unwrap();
    engine.snapshot().unwrap();
    assert!(matches!(engine.snapshot(), Err(EngineError::SnapshotBusy)));

    // Deferred flush requestors also block new background commands.
    assert!(matches!(engine.flush(), Err(EngineError::BackgroundBusy)));

    engine.wait_flush().unwrap().outcome.unwrap();
    engine.wait_flush().unwrap().outcome.unwrap();
}

#[test]
fn snapshot_with_zero_dirty_keys_still_produces_a_copy() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("v")).unwrap();
    flush_and_wait(&mut engine);

    // Nothing dirty: the worker never opens the store for the flush leg,
    // and the copy path must open it transiently itself.
    engine.snapshot().unwrap();
    engine.wait_flush().unwrap().outcome.expect("snapshot ok");
    assert!(tmp.path().join("snapshot").join("data.mdb").exists());
}

#[test]
fn snapshot_replaces_a_previous_snapshot() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    engine.set(0, b"k", sv("first")).unwrap();
    engine.snapshot().unwrap();
    engine.wait_flush().unwrap().outcome.unwrap();

    engine.set(0, b"k", sv("second")).unwrap();
    engine.snapshot().unwrap();
    engine.wait_flush().unwrap().outcome.unwrap();

    let mut copy = open(&tmp.path().join("snapshot"));
    assert_eq!(copy.get(0, b"k").unwrap(), Some(&sv("second")));
    copy.close().unwrap();
}

#[test]
fn compressed_snapshot_gzips_the_data_file() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        snapshot_compression: true,
        ..disk_config()
    };
    let mut engine = Engine::open(tmp.path(), config).unwrap();
    engine.set(0, b"k", sv("v")).unwrap();

    engine.snapshot().unwrap();
    engine.wait_flush().unwrap().outcome.expect("snapshot ok");

    let snap_dir = tmp.path().join("snapshot");
    assert!(snap_dir.join("data.mdb.gz").exists());
    assert!(!snap_dir.join("data.mdb").exists());

    // The archive decompresses back into a usable store.
    let restore = TempDir::new().unwrap();
    let gz = fs::File::open(snap_dir.join("data.mdb.gz")).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(gz);
    let mut out = fs::File::create(restore.path().join("data.mdb")).unwrap();
    io::copy(&mut decoder, &mut out).unwrap();
    drop(out);

    let mut restored = open(restore.path());
    assert_eq!(restored.get(0, b"k").unwrap(), Some(&sv("v")));
    restored.close().unwrap();
}
