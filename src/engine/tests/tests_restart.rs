use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use super::helpers::{flush_and_wait, open, sv};
use crate::value::Value;

/// Every key whose latest mutation was a write is retrievable with its
/// latest value, and every deleted key stays gone — across flushes and
/// restarts, in whatever order they interleave.
#[test]
fn random_workload_against_a_model_survives_flushes_and_restarts() {
    let tmp = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: HashMap<Vec<u8>, Value> = HashMap::new();

    for round in 0..4 {
        let mut engine = open(tmp.path());

        // Everything the model remembers must be there after reopen.
        for (key, value) in &model {
            assert_eq!(
                engine.get(0, key).unwrap(),
                Some(value),
                "lost key {:?} in round {round}",
                String::from_utf8_lossy(key)
            );
        }

        for _ in 0..150 {
            let key = format!("key:{:02}", rng.random_range(0..32)).into_bytes();
            if rng.random_bool(0.65) {
                let value = sv(&format!("v{}", rng.random_range(0..100_000)));
                engine.set(0, &key, value.clone()).unwrap();
                model.insert(key, value);
            } else {
                let removed = engine.delete(0, &key).unwrap();
                assert_eq!(removed, model.remove(&key).is_some());
            }
        }

        // Mid-round spot checks.
        for (key, value) in &model {
            assert_eq!(engine.get(0, key).unwrap(), Some(value));
        }
        for i in 0..32 {
            let key = format!("key:{i:02}").into_bytes();
            if !model.contains_key(&key) {
                assert_eq!(engine.get(0, &key).unwrap(), None);
            }
        }

        // Alternate between explicit flushes and relying on the
        // graceful-close flush.
        if round % 2 == 0 {
            flush_and_wait(&mut engine);
            assert_eq!(engine.dirty_key_count(), 0);
            assert_eq!(engine.flushing_key_count(), 0);
        }
        engine.close().unwrap();
    }

    // Final verification pass.
    let mut engine = open(tmp.path());
    for (key, value) in &model {
        assert_eq!(engine.get(0, key).unwrap(), Some(value));
    }
    assert_eq!(engine.db_size(0).unwrap(), model.len());
    engine.close().unwrap();
}

#[test]
fn interleaved_flush_cycles_keep_the_latest_value() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open(tmp.path());

    for generation in 0..5u32 {
        for i in 0..10u32 {
            engine
                .set(0, format!("k{i}").as_bytes(), sv(&format!("gen{generation}")))
                .unwrap();
        }
        flush_and_wait(&mut engine);
    }

    engine.close().unwrap();
    let mut engine = open(tmp.path());
    for i in 0..10u32 {
        assert_eq!(
            engine.get(0, format!("k{i}").as_bytes()).unwrap(),
            Some(&sv("gen4"))
        );
    }
    assert_eq!(engine.disk_key_count(0).unwrap(), 10);
}
