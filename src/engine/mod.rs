//! # Write-behind cache engine
//!
//! The [`Engine`] glues the in-memory databases, the dirty-key registry,
//! the payload codec, and the disk store adapter into one write-behind
//! cache:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  ┌─────────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │  │  dict +     │   │ dirty/flushing│   │  freezer_<id>  │   │
//! │  │  expires    │   │ sets+keycache │   │  (LMDB)        │   │
//! │  └──────┬──────┘   └───────┬───────┘   └───────┬────────┘   │
//! │         │  read-through    │   rotate / merge  │            │
//! │         └───────►──────────┴────────►──────────┘            │
//! │                                                             │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Flush worker (background thread): drain flushing     │  │
//! │  │  sets → disk, then optional environment snapshot      │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Semantics
//!
//! - Reads fall through to disk on a dictionary miss and install the
//!   loaded value (and its expiry) back into memory.
//! - Writes only touch memory; the key is marked *dirty* and persisted by
//!   the next flush cycle.
//! - A key that is dirty but not resident has been deleted: lookups must
//!   never resurrect the stale disk copy.
//! - The engine is single-threaded by design — every command runs to
//!   completion on the caller's thread. The only parallelism is the flush
//!   worker, which owns an immutable snapshot of the work.
//!
//! ## Completion polling
//!
//! Background flushes report through [`Engine::poll_flush`], which the
//! host's event loop must call periodically (the reaper). Replies to
//! `NDS FLUSH` / `NDS SNAPSHOT` are deferred until that point.

pub mod flush;
mod keyspace;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;

use crate::db::Db;
use crate::freezer::{AccessMode, Freezer, FreezerEnv, FreezerError, WalkControl};
use flush::{FlushError, FlushState};

/// Directory (under the data dir) snapshots are written to.
pub const SNAPSHOT_DIR: &str = "snapshot";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Key empty or longer than the disk store allows.
    #[error("invalid key")]
    InvalidKey,

    /// The named key does not exist.
    #[error("no such key")]
    NoSuchKey,

    /// Source and destination of a rename are the same key.
    #[error("source and destination objects are the same")]
    SameObject,

    /// Database index out of range.
    #[error("invalid DB index")]
    BadDatabase,

    /// A deferred background operation is already pending a reply.
    #[error("background operation in progress")]
    BackgroundBusy,

    /// A snapshot is already queued or running.
    #[error("snapshot already in progress")]
    SnapshotBusy,

    /// Flush requested while the previous cycle's keys are still rotated
    /// into the flushing sets.
    #[error("keys are still being flushed from the previous cycle")]
    FlushPending,

    /// NDS subcommand called with the wrong number of arguments.
    #[error("wrong number of arguments for NDS {0}")]
    WrongArity(String),

    /// Unrecognised NDS subcommand.
    #[error("NDS subcommand must be one of: SNAPSHOT FLUSH CLEARSTATS PRELOAD MEMKEYS")]
    UnknownSubcommand,

    /// Disk store failure.
    #[error(transparent)]
    Freezer(#[from] FreezerError),

    /// Background or synchronous flush failure.
    #[error("flush error: {0}")]
    Flush(#[from] FlushError),

    /// Filesystem-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed `KEYS` pattern.
    #[error("bad key pattern: {0}")]
    BadPattern(#[from] glob::PatternError),
}

// ------------------------------------------------------------------------------------------------
// Configuration and statistics
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance. Passed to [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of logical databases (and disk sub-databases).
    pub databases: usize,

    /// Master enable for the write-behind disk store. When off, the
    /// engine degrades to a plain in-memory dictionary: no key-length
    /// validation, no disk traffic, no dirty tracking.
    pub disk_store: bool,

    /// Carry an in-memory set of every key known to exist on disk, used
    /// to answer negative lookups without disk I/O. Loaded from disk at
    /// startup.
    pub keycache: bool,

    /// Gzip the snapshot data file after the environment copy.
    pub snapshot_compression: bool,

    /// During keyspace walks, yield to the host event loop every this
    /// many records. 0 disables yielding.
    pub walk_yield_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            disk_store: true,
            keycache: false,
            snapshot_compression: false,
            walk_yield_every: 1000,
        }
    }
}

/// Counters kept by the engine. `NDS CLEARSTATS` zeroes the cache-hit,
/// cache-miss, and disk-timing counters and leaves the rest.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Lookups answered from the in-memory dictionary.
    pub cache_hits: u64,
    /// Lookups that had to consult the disk store.
    pub cache_misses: u64,
    /// Lookups that found a key, by any route.
    pub keyspace_hits: u64,
    /// Lookups that found nothing.
    pub keyspace_misses: u64,
    /// Keys removed by TTL expiry.
    pub expired_keys: u64,
    /// Completed background flushes.
    pub flush_success: u64,
    /// Failed background flushes (keys were merged back for retry).
    pub flush_failure: u64,
    /// Payload reads issued to the disk store.
    pub disk_reads: u64,
    /// Accumulated wall-clock microseconds spent in disk operations.
    pub disk_micros: u64,
    /// Unix timestamp of the last successful flush.
    pub last_save_unix: Option<u64>,
}

/// Hooks into the surrounding system's keyspace machinery.
///
/// `key_modified` feeds the watch/notify mechanism and save scheduling;
/// `key_expired` is where the replication/AOF `DEL` feed hangs off.
pub trait KeyspaceEvents {
    /// A key was mutated by a command.
    fn key_modified(&mut self, _db: u32, _key: &[u8]) {}
    /// A key was actively expired by the engine.
    fn key_expired(&mut self, _db: u32, _key: &[u8]) {}
}

/// Reply of [`Engine::nds_command`].
#[derive(Debug, PartialEq, Eq)]
pub enum NdsReply {
    /// Immediate success.
    Ok,
    /// The operation started; the reply arrives with the matching
    /// [`poll_flush`](Engine::poll_flush) completion.
    Deferred,
    /// Key listing.
    Keys(Vec<Vec<u8>>),
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The write-behind cache engine. See the [module docs](self).
pub struct Engine {
    dir: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) dbs: Vec<Db>,
    pub(crate) freezer: Freezer,
    pub(crate) env: Arc<FreezerEnv>,
    pub(crate) stats: EngineStats,
    pub(crate) flush: FlushState,
    /// Global mutation counter consumed by external save scheduling.
    pub(crate) dirty: u64,
    pub(crate) loading: bool,
    pub(crate) replica: bool,
    preload_in_progress: bool,
    preload_complete: bool,
    pub(crate) events: Option<Box<dyn KeyspaceEvents>>,
}

impl Engine {
    /// Opens (or creates) an engine rooted at the given directory.
    ///
    /// The disk environment itself is created lazily on first use; with
    /// the keycache enabled, the on-disk keyspace is walked once here to
    /// seed it.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let env = Arc::new(FreezerEnv::new(&dir, config.databases as u32));
        let freezer = Freezer::new(Arc::clone(&env));
        let dbs = (0..config.databases)
            .map(|id| Db::new(id as u32, config.disk_store && config.keycache))
            .collect();

        let mut engine = Self {
            dir,
            config,
            dbs,
            freezer,
            env,
            stats: EngineStats::default(),
            flush: FlushState::default(),
            dirty: 0,
            loading: false,
            replica: false,
            preload_in_progress: false,
            preload_complete: false,
            events: None,
        };

        if engine.config.disk_store && engine.config.keycache {
            engine.load_keycache()?;
        }
        Ok(engine)
    }

    /// Gracefully shuts the engine down: drains any running flush, writes
    /// the remaining dirty keys, and closes the disk environment.
    pub fn close(mut self) -> Result<(), EngineError> {
        while self.flush_active() {
            if self.poll_flush().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        if self.config.disk_store {
            self.flush_dirty_sync()?;
        }
        self.env.close()?;
        Ok(())
    }

    /// Populates every database's keycache from the on-disk keyspace.
    fn load_keycache(&mut self) -> Result<(), EngineError> {
        info!("loading all keys from the disk store");
        let Self { freezer, dbs, .. } = self;
        for db in dbs.iter_mut() {
            let tracker = &mut db.tracker;
            freezer.walk(db.id, 0, || {}, |key| {
                tracker.seed_keycache(key);
                WalkControl::Continue
            })?;
        }
        info!("key cache loaded");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Admin commands
    // --------------------------------------------------------------------------------------------

    /// Dispatches an `NDS` subcommand. `db` is the caller's selected
    /// database (used by `MEMKEYS`); `args` are the arguments after the
    /// command name itself.
    pub fn nds_command(&mut self, db: usize, args: &[&str]) -> Result<NdsReply, EngineError> {
        let Some(sub) = args.first() else {
            return Err(EngineError::UnknownSubcommand);
        };
        let name = sub.to_ascii_lowercase();
        if !matches!(
            name.as_str(),
            "snapshot" | "flush" | "clearstats" | "preload" | "memkeys"
        ) {
            return Err(EngineError::UnknownSubcommand);
        }
        if args.len() != 1 {
            return Err(EngineError::WrongArity(sub.to_ascii_uppercase()));
        }
        match name.as_str() {
            "snapshot" => {
                info!("NDS SNAPSHOT requested");
                self.snapshot()?;
                Ok(NdsReply::Deferred)
            }
            "flush" => {
                info!("NDS FLUSH requested");
                self.flush()?;
                Ok(NdsReply::Deferred)
            }
            "clearstats" => {
                info!("NDS CLEARSTATS requested");
                self.clear_stats();
                Ok(NdsReply::Ok)
            }
            "preload" => {
                info!("NDS PRELOAD requested");
                self.preload()?;
                Ok(NdsReply::Ok)
            }
            "memkeys" => {
                info!("NDS MEMKEYS requested");
                Ok(NdsReply::Keys(self.mem_keys(db)?))
            }
            _ => unreachable!("subcommand name already validated"),
        }
    }

    /// Faults every on-disk key of every database into memory. Idempotent:
    /// repeated calls after a completed preload are no-ops.
    pub fn preload(&mut self) -> Result<(), EngineError> {
        if self.preload_in_progress || self.preload_complete {
            return Ok(());
        }
        info!("preloading all keys from the disk store");
        self.preload_in_progress = true;
        let result = self.preload_all();
        self.preload_in_progress = false;
        if result.is_ok() {
            self.preload_complete = true;
            info!("preload complete");
        }
        result
    }

    fn preload_all(&mut self) -> Result<(), EngineError> {
        for i in 0..self.dbs.len() {
            let id = self.dbs[i].id;
            let yield_every = self.config.walk_yield_every;
            let mut keys = Vec::new();
            self.freezer.walk(id, yield_every, || {}, |key| {
                keys.push(key.to_vec());
                WalkControl::Continue
            })?;
            for key in keys {
                if !self.dbs[i].dict.contains_key(&key) {
                    self.ensure_resident(i, &key)?;
                }
            }
        }
        Ok(())
    }

    /// Keys currently resident in memory for one database.
    pub fn mem_keys(&self, db: usize) -> Result<Vec<Vec<u8>>, EngineError> {
        Ok(self.db_ref(db)?.dict.keys().cloned().collect())
    }

    /// Zeroes the cache-hit, cache-miss, and disk-timing counters.
    pub fn clear_stats(&mut self) {
        self.stats.cache_hits = 0;
        self.stats.cache_misses = 0;
        self.stats.disk_micros = 0;
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Engine counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Keys pending persist, across all databases.
    pub fn dirty_key_count(&self) -> u64 {
        self.dbs.iter().map(|db| db.tracker.dirty_len() as u64).sum()
    }

    /// Keys currently being persisted, across all databases.
    pub fn flushing_key_count(&self) -> u64 {
        self.dbs
            .iter()
            .map(|db| db.tracker.flushing_len() as u64)
            .sum()
    }

    /// Global mutation counter used by external save scheduling.
    pub fn mutation_count(&self) -> u64 {
        self.dirty
    }

    /// Resident key count of one database.
    pub fn db_size(&self, db: usize) -> Result<usize, EngineError> {
        Ok(self.db_ref(db)?.len())
    }

    /// Number of keys in one database's on-disk freezer.
    pub fn disk_key_count(&mut self, db: usize) -> Result<u64, EngineError> {
        let id = self.db_ref(db)?.id;
        let guard = self.freezer.open(id, AccessMode::Read)?;
        Ok(guard.key_count()?)
    }

    /// Data directory this engine is rooted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // --------------------------------------------------------------------------------------------
    // External collaborator seams
    // --------------------------------------------------------------------------------------------

    /// Installs the watch/notify and expiry-propagation hooks.
    pub fn set_event_hook(&mut self, hook: Box<dyn KeyspaceEvents>) {
        self.events = Some(hook);
    }

    /// While loading, nothing is actively expired.
    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// In replica mode the engine answers expiry questions logically but
    /// never deletes — the master sends explicit `DEL`s.
    pub fn set_replica(&mut self, replica: bool) {
        self.replica = replica;
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    pub(crate) fn db_ref(&self, db: usize) -> Result<&Db, EngineError> {
        self.dbs.get(db).ok_or(EngineError::BadDatabase)
    }

    pub(crate) fn check_db(&self, db: usize) -> Result<(), EngineError> {
        if db >= self.dbs.len() {
            return Err(EngineError::BadDatabase);
        }
        Ok(())
    }

    pub(crate) fn signal_modified(&mut self, db: usize, key: &[u8]) {
        if self.config.disk_store {
            self.dbs[db]
                .tracker
                .notify(key, crate::dirty::KeyChange::Change);
        }
        if let Some(events) = self.events.as_mut() {
            events.key_modified(self.dbs[db].id, key);
        }
        self.dirty += 1;
    }
}

/// Current wall clock in milliseconds since the epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}
