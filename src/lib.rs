//! # FreezerDB
//!
//! An embeddable **write-behind disk store**: an in-memory key/value
//! database backed by an LMDB "freezer" holding the authoritative copy of
//! every key, so the working set no longer has to fit in memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Engine                            │
//! │  ┌───────────────┐  ┌───────────────┐  ┌─────────────┐   │
//! │  │  dict/expires │  │ dirty+flushing│  │   freezer   │   │
//! │  │  (in memory)  │  │ sets, keycache│  │  (on disk)  │   │
//! │  └──────┬────────┘  └──────┬────────┘  └──────┬──────┘   │
//! │         │  read-through    │  rotate/merge    │          │
//! │         └────────►─────────┴───────►──────────┘          │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  Background flush worker  (+ optional snapshot)    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The cache engine — lookups, mutations, expiry, flush/snapshot control, admin commands |
//! | [`freezer`] | Disk store adapter over LMDB — refcounted handles, transaction batching, keyspace walks |
//! | [`payload`] | Self-describing value payloads with expiry trailer and CRC32 footer |
//! | [`dirty`] | Per-database dirty/flushing key sets and the negative-lookup keycache |
//! | [`db`] | Per-database in-memory state (dict, expires) |
//! | [`value`] | Value objects: strings, lists, sets, sorted sets, hashes |
//!
//! ## Key Guarantees
//!
//! - **Write-behind** — mutations are acknowledged from memory and
//!   persisted in batches by a background worker; a failed flush merges
//!   its keys back for retry, so nothing is silently dropped.
//! - **Read-through** — misses fall through to disk and install the
//!   loaded value (and expiry) back into the cache.
//! - **Dirty-key authority** — a dirty key that is not resident has been
//!   deleted; the stale disk copy is never served.
//! - **Bounded transactions** — flush writes commit every 50,000
//!   mutations, keeping LMDB transaction bookkeeping flat.
//! - **Consistent snapshots** — `NDS SNAPSHOT` copies the environment
//!   from inside the flush cycle, capturing exactly the post-flush state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use freezerdb::{Engine, EngineConfig, Value};
//!
//! let mut engine = Engine::open("/tmp/my_cache", EngineConfig::default()).unwrap();
//!
//! // Write — stays in memory, marked dirty.
//! engine.set(0, b"hello", Value::string("world")).unwrap();
//!
//! // Read — falls through to disk on a miss.
//! assert!(engine.get(0, b"hello").unwrap().is_some());
//!
//! // Persist all dirty keys in the background.
//! engine.flush().unwrap();
//! while engine.flush_active() {
//!     engine.poll_flush();
//! }
//!
//! // Graceful shutdown flushes whatever is still dirty.
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod db;
pub mod dirty;
pub mod engine;
pub mod freezer;
pub mod payload;
pub mod value;

pub use engine::flush::{BackgroundKind, FlushCompletion, FlushError};
pub use engine::{Engine, EngineConfig, EngineError, EngineStats, KeyspaceEvents, NdsReply};
pub use value::{Value, ValueKind};
