use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};
use crate::value::Value;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Standard disk-backed config: 4 databases, keycache off.
pub fn disk_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        databases: 4,
        disk_store: true,
        keycache: false,
        snapshot_compression: false,
        walk_yield_every: 1000,
    }
}

/// Disk-backed config with the negative-lookup keycache enabled.
pub fn keycache_config() -> EngineConfig {
    EngineConfig {
        keycache: true,
        ..disk_config()
    }
}

/// Plain in-memory config: the disk store disabled entirely.
pub fn memory_only_config() -> EngineConfig {
    EngineConfig {
        disk_store: false,
        ..disk_config()
    }
}

/// Opens an engine over `dir` with the standard disk-backed config.
pub fn open(dir: &Path) -> Engine {
    Engine::open(dir, disk_config()).expect("engine open")
}

/// Runs a background flush to completion and asserts it succeeded.
pub fn flush_and_wait(engine: &mut Engine) {
    engine.flush().expect("flush start");
    let done = engine.wait_flush().expect("flush completion");
    done.outcome.expect("flush outcome");
}

/// Shorthand for a string value.
pub fn sv(s: &str) -> Value {
    Value::string(s)
}
