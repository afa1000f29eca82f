//! Disk store adapter.
//!
//! Wraps an LMDB environment (via [`heed`]) behind the narrow surface the
//! cache needs: per-database open/get/set/del/exists, bulk cursor walks,
//! drop-all, environment snapshot copies, and bounded write-transaction
//! batching.
//!
//! ## Environment lifecycle
//!
//! The environment is process-wide state owned by a [`FreezerEnv`] and
//! created lazily on first use. The map size is taken from the capacity of
//! the filesystem holding the data directory, rounded down to a page-size
//! multiple — LMDB maps the whole region up front, so "as big as the
//! partition" is the least-worst bound.
//!
//! The environment itself is always opened read-write (the store owns its
//! directory, and LMDB serves read transactions from a read-write
//! environment concurrently with one writer); read and write access modes
//! are enforced per handle. [`FreezerEnv::close`] tears the environment
//! down entirely so the flush worker can reopen it as its own; no
//! transaction may straddle that hand-off.
//!
//! ## Handles
//!
//! [`Freezer::open`] returns a [`FreezerDb`] guard over one sub-database
//! (`freezer_<id>`) and one transaction. Nested opens in the same access
//! mode share the handle and its transaction via a refcount; requesting a
//! different mode or database while the handle is live is rejected. The
//! guard decrements on drop and the transaction commits when the last
//! reference goes.
//!
//! Write handles transparently commit and restart their transaction every
//! [`TXN_BATCH_LIMIT`] mutations — LMDB's dirty-page tracking scales with
//! transaction size, so unbounded flush transactions are not an option.


use std::cell::RefCell;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use heed::types::Bytes;
use heed::{CompactionOption, Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Longest key LMDB will index.
pub const MAX_KEY_LEN: usize = 511;

/// Largest value a single put may carry.
pub const MAX_VALUE_LEN: u64 = u32::MAX as u64;

/// Mutations per write transaction before an intermediate commit.
pub const TXN_BATCH_LIMIT: usize = 50_000;

/// LMDB data file name, relative to the data directory.
pub const DATA_FILE: &str = "data.mdb";

/// LMDB lock file name, relative to the data directory.
pub const LOCK_FILE: &str = "lock.mdb";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the disk store adapter.
#[derive(Debug, Error)]
pub enum FreezerError {
    /// Error from the underlying LMDB engine.
    #[error("disk store error: {0}")]
    Env(#[from] heed::Error),

    /// Filesystem-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key longer than [`MAX_KEY_LEN`] bytes.
    #[error("key exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLong,

    /// Value longer than [`MAX_VALUE_LEN`] bytes.
    #[error("value exceeds {MAX_VALUE_LEN} bytes")]
    ValueTooLarge,

    /// The live handle or environment is open in the other access mode.
    #[error("freezer is already open for {0}")]
    ModeConflict(&'static str),

    /// A handle for a different database is already live.
    #[error("freezer database {0} is already open")]
    DatabaseBusy(u32),

    /// The environment cannot be torn down while handles are live.
    #[error("disk environment is still in use")]
    EnvBusy,

    /// Write operation issued through a read handle.
    #[error("write operation on a read-only freezer handle")]
    ReadOnlyHandle,

    /// Invariant violation inside the adapter.
    #[error("internal freezer error: {0}")]
    Internal(&'static str),
}

/// Access mode requested when opening the environment or a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only transaction.
    Read,
    /// Read-write transaction; creates missing sub-databases.
    Write,
}

fn mode_name(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::Read => "reading",
        AccessMode::Write => "writing",
    }
}

/// Sub-database name for a logical database id.
fn freezer_name(db_id: u32) -> String {
    format!("freezer_{db_id}")
}

// ------------------------------------------------------------------------------------------------
// Shared environment
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct EnvState {
    env: Option<Env>,
    users: usize,
}

/// Process-wide LMDB environment slot, shared between the command path and
/// the background flush worker.
pub struct FreezerEnv {
    dir: PathBuf,
    max_dbs: u32,
    state: Mutex<EnvState>,
}

impl FreezerEnv {
    /// Creates the slot; the environment itself is opened lazily.
    pub fn new(dir: impl Into<PathBuf>, max_dbs: u32) -> Self {
        Self {
            dir: dir.into(),
            max_dbs,
            state: Mutex::new(EnvState::default()),
        }
    }

    /// Data directory this environment lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Takes a use of the environment, creating it lazily. The data file
    /// is created on first use.
    fn acquire(&self) -> Result<Env, FreezerError> {
        let mut st = self.lock()?;

        if let Some(env) = st.env.as_ref() {
            let env = env.clone();
            st.users += 1;
            return Ok(env);
        }

        if !fs::exists(self.dir.join(DATA_FILE))? {
            debug!("data file does not exist; creating");
        }
        let map_size = filesystem_map_size(&self.dir)?;
        let mut opts = EnvOpenOptions::new();
        opts.map_size(map_size);
        opts.max_dbs(self.max_dbs);
        let env = unsafe { opts.open(&self.dir) }.map_err(|e| {
            warn!(error = %e, "failed to open disk environment");
            e
        })?;
        info!(map_size, "disk environment opened");

        st.users = 1;
        st.env = Some(env.clone());
        Ok(env)
    }

    /// Returns a use taken with [`acquire`](Self::acquire). The
    /// environment stays cached for the next open.
    fn release(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.users = st.users.saturating_sub(1);
        }
    }

    /// Fully tears down the environment so another owner — the flush
    /// worker, or a recreation in the other mode — can reopen it.
    ///
    /// Fails while any handle is live: a transaction must never straddle
    /// the hand-off.
    pub fn close(&self) -> Result<(), FreezerError> {
        let mut st = self.lock()?;
        if st.users > 0 {
            return Err(FreezerError::EnvBusy);
        }
        if st.env.take().is_some() {
            debug!("disk environment closed");
        }
        Ok(())
    }

    /// Copies the environment into `dest_file` — an atomic snapshot of the
    /// data file. Opens the environment transiently if it is not open
    /// (a flush with zero dirty keys never touched it).
    pub fn copy_to(&self, dest_file: &Path) -> Result<(), FreezerError> {
        let env = self.acquire()?;
        let result = env.copy_to_file(dest_file, CompactionOption::Disabled);
        self.release();
        result?;
        Ok(())
    }

    /// Removes the data and lock files outright. The environment must be
    /// closed; missing files are not an error.
    pub fn destroy_files(&self) -> Result<(), FreezerError> {
        self.close()?;
        for name in [DATA_FILE, LOCK_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EnvState>, FreezerError> {
        self.state
            .lock()
            .map_err(|_| FreezerError::Internal("environment lock poisoned"))
    }
}

/// Map size for a fresh environment: the capacity of the filesystem the
/// data directory sits on, rounded down to a page-size multiple.
fn filesystem_map_size(dir: &Path) -> Result<usize, FreezerError> {
    let path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| FreezerError::Internal("data directory path contains a NUL byte"))?;
    let mut vfs = unsafe { std::mem::zeroed::<libc::statvfs>() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut vfs) } != 0 {
        let err = io::Error::last_os_error();
        warn!(error = %err, "statvfs on data directory failed");
        return Err(err.into());
    }
    // sysconf reports -1 on failure; no page is smaller than 4 KiB.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as u64;
    let total = (vfs.f_blocks as u64).saturating_mul(vfs.f_frsize as u64);
    Ok(((total / page) * page) as usize)
}

// ------------------------------------------------------------------------------------------------
// Leaked environment clone
// ------------------------------------------------------------------------------------------------

/// An `Env` clone promoted to `'static` so a transaction can live beside
/// it in one struct. The clone is reclaimed on drop; owners declare their
/// transaction field *before* this one so the borrow ends first.
struct LeakedEnv(&'static Env);

impl LeakedEnv {
    fn new(env: Env) -> Self {
        Self(Box::leak(Box::new(env)))
    }

    fn env(&self) -> &'static Env {
        self.0
    }
}

impl Drop for LeakedEnv {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0 as *const Env as *mut Env)) };
    }
}

// ------------------------------------------------------------------------------------------------
// Refcounted handle
// ------------------------------------------------------------------------------------------------

enum TxnKind {
    Read(RoTxn<'static>),
    Write(RwTxn<'static>),
}

struct OpenDb {
    db_id: u32,
    mode: AccessMode,
    refs: usize,
    name: String,
    // `txn` borrows from `leaked` and must be declared before it.
    txn: Option<TxnKind>,
    db: Option<Database<Bytes, Bytes>>,
    leaked: LeakedEnv,
    writes: usize,
    batch_commits: u64,
}

/// One side's view of the disk store: a slot holding at most one open
/// sub-database + transaction, shared by nested opens.
///
/// The command path owns one `Freezer`; the flush worker builds its own
/// over the same [`FreezerEnv`] — the same separation the original
/// parent/child processes had.
pub struct Freezer {
    env: Arc<FreezerEnv>,
    slot: RefCell<Option<OpenDb>>,
}

impl Freezer {
    /// Creates an empty handle slot over a shared environment.
    pub fn new(env: Arc<FreezerEnv>) -> Self {
        Self {
            env,
            slot: RefCell::new(None),
        }
    }

    /// Opens database `db_id` in the given mode.
    ///
    /// If a handle is already live it is shared (refcounted) when the mode
    /// and database match, and rejected otherwise. In write mode the
    /// sub-database is created if missing; in read mode a missing
    /// sub-database yields an empty view.
    pub fn open(&self, db_id: u32, mode: AccessMode) -> Result<FreezerDb<'_>, FreezerError> {
        let mut slot = self.slot.borrow_mut();

        if let Some(open) = slot.as_mut() {
            if open.mode != mode {
                warn!(
                    "cannot reopen active freezer handle for {}",
                    mode_name(mode)
                );
                return Err(FreezerError::ModeConflict(mode_name(open.mode)));
            }
            if open.db_id != db_id {
                warn!(
                    open = open.db_id,
                    requested = db_id,
                    "a different freezer database is already open"
                );
                return Err(FreezerError::DatabaseBusy(open.db_id));
            }
            open.refs += 1;
            trace!(db = db_id, refs = open.refs, "freezer handle shared");
            return Ok(FreezerDb {
                freezer: self,
                db_id,
            });
        }

        let env = self.env.acquire()?;
        let leaked = LeakedEnv::new(env);
        let name = freezer_name(db_id);
        match Self::begin(leaked.env(), mode, &name) {
            Ok((txn, db)) => {
                *slot = Some(OpenDb {
                    db_id,
                    mode,
                    refs: 1,
                    name,
                    txn: Some(txn),
                    db,
                    leaked,
                    writes: 0,
                    batch_commits: 0,
                });
                trace!(db = db_id, write = mode == AccessMode::Write, "freezer opened");
                Ok(FreezerDb {
                    freezer: self,
                    db_id,
                })
            }
            Err(e) => {
                warn!(db = db_id, error = %e, "failed to open freezer database");
                drop(leaked);
                self.env.release();
                Err(e)
            }
        }
    }

    fn begin(
        env: &'static Env,
        mode: AccessMode,
        name: &str,
    ) -> Result<(TxnKind, Option<Database<Bytes, Bytes>>), FreezerError> {
        match mode {
            AccessMode::Write => {
                let mut wtxn = env.write_txn()?;
                let db = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(name))?;
                Ok((TxnKind::Write(wtxn), Some(db)))
            }
            AccessMode::Read => {
                let rtxn = env.read_txn()?;
                let db = env.open_database::<Bytes, Bytes>(&rtxn, Some(name))?;
                Ok((TxnKind::Read(rtxn), db))
            }
        }
    }

    /// Drops one reference; at zero, commits the transaction and empties
    /// the slot. `propagate` controls whether a commit failure is returned
    /// or merely logged (the guard's `Drop` cannot propagate).
    fn close_one(&self, propagate: bool) -> Result<(), FreezerError> {
        let mut slot = self.slot.borrow_mut();
        let Some(open) = slot.as_mut() else {
            return Ok(());
        };
        open.refs -= 1;
        trace!(db = open.db_id, refs = open.refs, "freezer handle released");
        if open.refs > 0 {
            return Ok(());
        }

        let mut open = slot.take().ok_or(FreezerError::Internal("open state vanished"))?;
        let result = match open.txn.take() {
            Some(TxnKind::Read(t)) => t.commit(),
            Some(TxnKind::Write(t)) => t.commit(),
            None => Ok(()),
        };
        drop(open);
        self.env.release();

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to commit freezer transaction");
                if propagate { Err(e.into()) } else { Ok(()) }
            }
        }
    }

    /// Commits the current write transaction and starts a fresh one,
    /// reopening the sub-database handle.
    fn rotate_txn(open: &mut OpenDb) -> Result<(), FreezerError> {
        info!(db = open.db_id, "transaction batch full; performing intermediate commit");
        match open.txn.take() {
            Some(TxnKind::Write(t)) => t.commit().map_err(|e| {
                warn!(error = %e, "failed to commit intermediate transaction");
                FreezerError::from(e)
            })?,
            Some(TxnKind::Read(_)) | None => return Err(FreezerError::ReadOnlyHandle),
        }
        open.batch_commits += 1;
        open.writes = 0;

        let env = open.leaked.env();
        let mut wtxn = env.write_txn()?;
        open.db = Some(env.create_database::<Bytes, Bytes>(&mut wtxn, Some(&open.name))?);
        open.txn = Some(TxnKind::Write(wtxn));
        Ok(())
    }

    /// Walks every key of `db_id` in natural (lexicographic) order.
    ///
    /// `visit` may stop the walk early; the return value is `false` when
    /// it did. Every `yield_every` records (0 disables) `on_yield` is
    /// invoked so the host can service its event loop mid-walk.
    ///
    /// The walk holds its own read transaction, independent of the shared
    /// handle slot. `visit` must not open the freezer itself — collect
    /// keys and act after the walk returns.
    pub fn walk(
        &self,
        db_id: u32,
        yield_every: usize,
        mut on_yield: impl FnMut(),
        mut visit: impl FnMut(&[u8]) -> WalkControl,
    ) -> Result<bool, FreezerError> {
        let env = self.env.acquire()?;
        let result = (|| {
            let rtxn = env.read_txn()?;
            let Some(db) =
                env.open_database::<Bytes, Bytes>(&rtxn, Some(&freezer_name(db_id)))?
            else {
                return Ok(true);
            };

            debug!(db = db_id, "walking the disk keyspace");
            let mut counter = 0usize;
            for item in db.iter(&rtxn)? {
                let (key, _value) = item?;
                if let WalkControl::Stop = visit(key) {
                    debug!(db = db_id, "walk terminated early at callback's request");
                    return Ok(false);
                }
                counter += 1;
                if yield_every > 0 && counter % yield_every == 0 {
                    on_yield();
                }
            }
            Ok(true)
        })();
        self.env.release();
        result
    }
}

/// Callback verdict for [`Freezer::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking.
    Continue,
    /// Terminate the walk early.
    Stop,
}

// ------------------------------------------------------------------------------------------------
// Handle guard
// ------------------------------------------------------------------------------------------------

/// Guard over one open freezer database. Dropping releases the reference;
/// the last reference commits the transaction. Use [`FreezerDb::close`]
/// where a commit failure must not be swallowed.
pub struct FreezerDb<'f> {
    freezer: &'f Freezer,
    db_id: u32,
}

impl FreezerDb<'_> {
    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut OpenDb) -> Result<R, FreezerError>,
    ) -> Result<R, FreezerError> {
        let mut slot = self.freezer.slot.borrow_mut();
        let open = slot
            .as_mut()
            .ok_or(FreezerError::Internal("handle outlived its open state"))?;
        debug_assert_eq!(open.db_id, self.db_id);
        f(open)
    }

    /// Fetches the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FreezerError> {
        if key.len() > MAX_KEY_LEN {
            warn!("excessively long key passed to freezer get");
            return Err(FreezerError::KeyTooLong);
        }
        self.with_open(|open| {
            let Some(db) = open.db else {
                return Ok(None);
            };
            let value = match txn(open)? {
                TxnKind::Read(t) => db.get(t, key)?,
                TxnKind::Write(t) => db.get(t, key)?,
            };
            trace!(db = open.db_id, found = value.is_some(), "freezer get");
            Ok(value.map(|v| v.to_vec()))
        })
    }

    /// True iff `key` exists on disk.
    pub fn exists(&self, key: &[u8]) -> Result<bool, FreezerError> {
        if key.len() > MAX_KEY_LEN {
            warn!("excessively long key passed to freezer exists");
            return Err(FreezerError::KeyTooLong);
        }
        self.with_open(|open| {
            let Some(db) = open.db else {
                return Ok(false);
            };
            let found = match txn(open)? {
                TxnKind::Read(t) => db.get(t, key)?.is_some(),
                TxnKind::Write(t) => db.get(t, key)?.is_some(),
            };
            Ok(found)
        })
    }

    /// Stores `value` under `key`, committing the transaction batch
    /// transparently when it fills up.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), FreezerError> {
        if key.len() > MAX_KEY_LEN {
            warn!("excessively long key passed to freezer set");
            return Err(FreezerError::KeyTooLong);
        }
        if value.len() as u64 > MAX_VALUE_LEN {
            warn!("excessively long value passed to freezer set");
            return Err(FreezerError::ValueTooLarge);
        }
        self.with_open(|open| {
            let db = open.db.ok_or(FreezerError::ReadOnlyHandle)?;
            match txn_mut(open)? {
                TxnKind::Write(t) => db.put(t, key, value)?,
                TxnKind::Read(_) => return Err(FreezerError::ReadOnlyHandle),
            }
            open.writes += 1;
            if open.writes > TXN_BATCH_LIMIT {
                Freezer::rotate_txn(open)?;
            }
            Ok(())
        })
    }

    /// Removes `key`; returns whether a key was actually deleted.
    pub fn del(&self, key: &[u8]) -> Result<bool, FreezerError> {
        if key.len() > MAX_KEY_LEN {
            warn!("excessively long key passed to freezer del");
            return Err(FreezerError::KeyTooLong);
        }
        self.with_open(|open| {
            let Some(db) = open.db else {
                return Ok(false);
            };
            let deleted = match txn_mut(open)? {
                TxnKind::Write(t) => db.delete(t, key)?,
                TxnKind::Read(_) => return Err(FreezerError::ReadOnlyHandle),
            };
            trace!(db = open.db_id, deleted, "freezer del");
            open.writes += 1;
            if open.writes > TXN_BATCH_LIMIT {
                Freezer::rotate_txn(open)?;
            }
            Ok(deleted)
        })
    }

    /// Removes every key in the sub-database.
    pub fn drop_all(&self) -> Result<(), FreezerError> {
        self.with_open(|open| {
            let Some(db) = open.db else {
                return Ok(());
            };
            match txn_mut(open)? {
                TxnKind::Write(t) => db.clear(t)?,
                TxnKind::Read(_) => return Err(FreezerError::ReadOnlyHandle),
            }
            Ok(())
        })
    }

    /// Number of keys in the sub-database.
    pub fn key_count(&self) -> Result<u64, FreezerError> {
        self.with_open(|open| {
            let Some(db) = open.db else {
                return Ok(0);
            };
            let count = match txn(open)? {
                TxnKind::Read(t) => db.len(t)?,
                TxnKind::Write(t) => db.len(t)?,
            };
            Ok(count)
        })
    }

    /// Intermediate commits performed by this handle's batching.
    pub fn intermediate_commits(&self) -> Result<u64, FreezerError> {
        self.with_open(|open| Ok(open.batch_commits))
    }

    /// Releases the handle, surfacing any commit error. Prefer this over
    /// plain drop wherever losing a commit must fail the caller — the
    /// flush loop in particular.
    pub fn close(self) -> Result<(), FreezerError> {
        let freezer = self.freezer;
        std::mem::forget(self);
        freezer.close_one(true)
    }
}

impl Drop for FreezerDb<'_> {
    fn drop(&mut self) {
        let _ = self.freezer.close_one(false);
    }
}

fn txn(open: &OpenDb) -> Result<&TxnKind, FreezerError> {
    open.txn
        .as_ref()
        .ok_or(FreezerError::Internal("transaction lost after failed commit"))
}

fn txn_mut(open: &mut OpenDb) -> Result<&mut TxnKind, FreezerError> {
    open.txn
        .as_mut()
        .ok_or(FreezerError::Internal("transaction lost after failed commit"))
}
