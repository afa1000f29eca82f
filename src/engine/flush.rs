//! Flush and snapshot controller.
//!
//! One state machine drives background persistence: `Idle`, flushing, or
//! flushing-then-snapshot. A flush cycle:
//!
//! 1. *Start* — preconditions: no worker is live and every database's
//!    flushing set is empty. The engine captures the global mutation
//!    counter, tears the disk environment down (no transaction may
//!    straddle the hand-off), rotates `dirty` → `flushing` in every
//!    database, and captures a **flush plan**: for each flushing key,
//!    either its encoded payload or a deletion marker. The plan is the
//!    immutable snapshot the worker owns — parent mutations after this
//!    point land in the fresh dirty sets and are invisible to the worker.
//! 2. *Worker* — reopens the environment for writing and drains the plan
//!    one database at a time, batching commits through the adapter. For a
//!    snapshot cycle it then recreates the snapshot directory and copies
//!    the environment. The result is sent over a channel.
//! 3. *Completion* — [`Engine::poll_flush`] reaps the worker. Success
//!    empties the flushing sets and settles the mutation counter; failure
//!    merges every flushing key back into dirty so the next cycle retries
//!    it. A queued snapshot is dispatched afterwards.
//!
//! A `NDS SNAPSHOT` issued while a flush runs is queued, not rejected;
//! its reply stays deferred until its own cycle completes.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, TryRecvError, bounded};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Engine, EngineError, SNAPSHOT_DIR, now_ms};
use crate::freezer::{AccessMode, DATA_FILE, Freezer, FreezerEnv, FreezerError, MAX_KEY_LEN};
use crate::payload;

// ------------------------------------------------------------------------------------------------
// Error and completion types
// ------------------------------------------------------------------------------------------------

/// Errors a flush cycle can fail with.
#[derive(Debug, Error)]
pub enum FlushError {
    /// Disk store failure while draining the plan.
    #[error(transparent)]
    Freezer(#[from] FreezerError),

    /// Filesystem failure, typically during the snapshot copy.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker died without reporting a result.
    #[error("flush worker disappeared without reporting")]
    WorkerLost,
}

/// Which background operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundKind {
    /// Plain dirty-key flush.
    Flush,
    /// Flush followed by an environment snapshot.
    Snapshot,
}

/// Outcome of a finished background cycle, delivered by
/// [`Engine::poll_flush`].
#[derive(Debug)]
pub struct FlushCompletion {
    /// What kind of cycle finished.
    pub kind: BackgroundKind,
    /// How it went. On error the flushing keys were already merged back.
    pub outcome: Result<(), FlushError>,
}

// ------------------------------------------------------------------------------------------------
// Controller state
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FlushState {
    worker: Option<Worker>,
    snapshot_pending: bool,
    snapshot_in_progress: bool,
    requestor: Option<BackgroundKind>,
    dirty_before: u64,
}

struct Worker {
    rx: Receiver<Result<(), FlushError>>,
    handle: JoinHandle<()>,
    snapshot: bool,
}

/// What a flush plan is captured from.
#[derive(Clone, Copy)]
enum PlanSource {
    /// The live dirty sets (synchronous flush).
    Dirty,
    /// The rotated flushing sets (background flush).
    Flushing,
}

pub(crate) struct DbPlan {
    db_id: u32,
    ops: Vec<FlushOp>,
}

enum FlushOp {
    /// Key was alive at capture time; persist this payload.
    Put { key: Vec<u8>, payload: Vec<u8> },
    /// Key was deleted after being dirtied; remove it from disk.
    Del { key: Vec<u8> },
}

struct SnapshotJob {
    dir: PathBuf,
    compress: bool,
}

// ------------------------------------------------------------------------------------------------
// Engine-side control
// ------------------------------------------------------------------------------------------------

impl Engine {
    /// Starts a background flush (`NDS FLUSH`). The reply is deferred:
    /// the matching [`FlushCompletion`] arrives via
    /// [`poll_flush`](Self::poll_flush). If a flush is already running,
    /// this call just attaches to it.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.flush.requestor.is_some() {
            return Err(EngineError::BackgroundBusy);
        }
        if !self.flush_active() {
            self.start_flush(false)?;
        }
        self.flush.requestor = Some(BackgroundKind::Flush);
        Ok(())
    }

    /// Starts (or queues) a flush-then-snapshot cycle (`NDS SNAPSHOT`).
    /// If a flush is already running the snapshot is queued behind it and
    /// dispatched by the completion handler.
    pub fn snapshot(&mut self) -> Result<(), EngineError> {
        if self.flush.snapshot_pending || self.flush.snapshot_in_progress {
            return Err(EngineError::SnapshotBusy);
        }
        if self.flush.requestor.is_some() {
            return Err(EngineError::BackgroundBusy);
        }
        if self.flush_active() {
            self.flush.snapshot_pending = true;
        } else {
            self.flush.snapshot_in_progress = true;
            if let Err(e) = self.start_flush(true) {
                self.flush.snapshot_in_progress = false;
                return Err(e);
            }
        }
        self.flush.requestor = Some(BackgroundKind::Snapshot);
        Ok(())
    }

    /// Starts a background flush cycle without attaching a deferred
    /// requestor — the entry point periodic save scheduling uses.
    pub fn flush_cycle(&mut self) -> Result<(), EngineError> {
        self.start_flush(false)
    }

    /// True while a background worker is live.
    pub fn flush_active(&self) -> bool {
        self.flush.worker.is_some()
    }

    /// Rotates the dirty sets, captures the plan, and hands it to a fresh
    /// worker thread.
    pub(crate) fn start_flush(&mut self, snapshot: bool) -> Result<(), EngineError> {
        if self.flush.worker.is_some() {
            return Err(EngineError::BackgroundBusy);
        }
        for db in &self.dbs {
            if db.tracker.flushing_len() > 0 {
                warn!("flush requested while keys from the previous cycle are still flushing");
                return Err(EngineError::FlushPending);
            }
        }

        self.flush.dirty_before = self.dirty;
        self.env.close()?;
        for db in &mut self.dbs {
            db.tracker.rotate();
        }
        let plan = self.build_plan(PlanSource::Flushing);
        let job = snapshot.then(|| SnapshotJob {
            dir: self.dir().join(SNAPSHOT_DIR),
            compress: self.config.snapshot_compression,
        });

        let env = Arc::clone(&self.env);
        let (tx, rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name("freezer-flush".into())
            .spawn(move || {
                let result = run_flush(&env, plan, job);
                if let Err(e) = &result {
                    warn!(error = %e, "background flush failed");
                }
                let _ = tx.send(result);
            });

        match spawned {
            Ok(handle) => {
                debug!("dirty key flush started");
                self.flush.worker = Some(Worker {
                    rx,
                    handle,
                    snapshot,
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not spawn flush worker");
                for db in &mut self.dbs {
                    db.tracker.merge_back();
                }
                Err(e.into())
            }
        }
    }

    /// The reaper: collects a finished worker, reconciles the dirty
    /// bookkeeping, and dispatches any queued snapshot. Call this from
    /// the host's periodic cron.
    pub fn poll_flush(&mut self) -> Option<FlushCompletion> {
        let result = match self.flush.worker.as_ref()?.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(FlushError::WorkerLost),
        };
        let worker = self.flush.worker.take()?;
        let _ = worker.handle.join();
        info!(
            success = result.is_ok(),
            snapshot = worker.snapshot,
            "background flush completed"
        );

        self.flush.snapshot_in_progress = false;
        match &result {
            Ok(()) => {
                self.post_flush_cleanup();
                self.dirty = self.dirty.saturating_sub(self.flush.dirty_before);
            }
            Err(_) => {
                self.stats.flush_failure += 1;
                for db in &mut self.dbs {
                    debug!(
                        db = db.id,
                        keys = db.tracker.flushing_len(),
                        "merging flushing keys back into dirty keys"
                    );
                    db.tracker.merge_back();
                }
            }
        }

        // Settle the deferred reply. A queued snapshot keeps its token:
        // its reply belongs to the cycle about to start.
        if result.is_err() || !self.flush.snapshot_pending {
            self.flush.requestor = None;
        }

        if self.flush.snapshot_pending {
            self.flush.snapshot_pending = false;
            self.flush.snapshot_in_progress = true;
            if let Err(e) = self.start_flush(true) {
                warn!(error = %e, "queued snapshot failed to start");
                self.flush.snapshot_in_progress = false;
                self.flush.requestor = None;
            }
        }

        let kind = if worker.snapshot {
            BackgroundKind::Snapshot
        } else {
            BackgroundKind::Flush
        };
        Some(FlushCompletion {
            kind,
            outcome: result,
        })
    }

    /// Blocks until the running background cycle completes. `None` when
    /// nothing is running.
    pub fn wait_flush(&mut self) -> Option<FlushCompletion> {
        loop {
            if !self.flush_active() {
                return None;
            }
            if let Some(done) = self.poll_flush() {
                return Some(done);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Writes every currently-dirty key straight to disk on the calling
    /// thread. Used by the `KEYS` path and graceful shutdown; the caller
    /// is responsible for the surrounding flushing-set bookkeeping.
    pub(crate) fn flush_dirty_sync(&mut self) -> Result<(), EngineError> {
        let plan = self.build_plan(PlanSource::Dirty);
        if plan.is_empty() {
            return Ok(());
        }
        debug!("flushing dirty keys synchronously");
        apply_plan(&self.freezer, &plan)?;
        Ok(())
    }

    /// Bookkeeping after a successful flush: the flushing keys are
    /// durable now.
    pub(crate) fn post_flush_cleanup(&mut self) {
        for db in &mut self.dbs {
            db.tracker.clear_flushing();
        }
        self.stats.last_save_unix = Some((now_ms() / 1000) as u64);
        self.stats.flush_success += 1;
    }

    /// Captures the work for one flush cycle: every tracked key becomes
    /// either an encoded payload (alive at capture time) or a deletion.
    fn build_plan(&self, source: PlanSource) -> Vec<DbPlan> {
        let mut plan = Vec::new();
        for db in &self.dbs {
            let keys: Vec<&Vec<u8>> = match source {
                PlanSource::Dirty => db.tracker.dirty_keys().collect(),
                PlanSource::Flushing => db.tracker.flushing_keys().collect(),
            };
            if keys.is_empty() {
                continue;
            }
            debug!(db = db.id, keys = keys.len(), "capturing keys for flush");
            let mut ops = Vec::with_capacity(keys.len());
            for key in keys {
                if key.len() > MAX_KEY_LEN {
                    warn!("refusing to flush excessively long key");
                    continue;
                }
                match db.dict.get(key.as_slice()) {
                    None => ops.push(FlushOp::Del { key: key.clone() }),
                    Some(slot) => {
                        let expire = db.expires.get(key.as_slice()).copied();
                        ops.push(FlushOp::Put {
                            key: key.clone(),
                            payload: payload::encode(&slot.value, expire),
                        });
                    }
                }
            }
            plan.push(DbPlan { db_id: db.id, ops });
        }
        plan
    }
}

// ------------------------------------------------------------------------------------------------
// Worker body
// ------------------------------------------------------------------------------------------------

/// Drains a flush plan through a freezer handle, one database at a time.
/// Any disk error aborts the whole flush; the completion handler will
/// merge the flushing keys back for retry.
pub(crate) fn apply_plan(freezer: &Freezer, plan: &[DbPlan]) -> Result<(), FlushError> {
    for db_plan in plan {
        debug!(
            db = db_plan.db_id,
            keys = db_plan.ops.len(),
            "flushing keys to the disk store"
        );
        let guard = freezer.open(db_plan.db_id, AccessMode::Write)?;
        for op in &db_plan.ops {
            match op {
                FlushOp::Del { key } => {
                    guard.del(key)?;
                }
                FlushOp::Put { key, payload } => {
                    guard.set(key, payload)?;
                }
            }
        }
        guard.close()?;
    }
    Ok(())
}

/// Body of the background worker thread.
fn run_flush(
    env: &Arc<FreezerEnv>,
    plan: Vec<DbPlan>,
    snapshot: Option<SnapshotJob>,
) -> Result<(), FlushError> {
    let freezer = Freezer::new(Arc::clone(env));
    apply_plan(&freezer, &plan)?;
    debug!("flush complete");

    if let Some(job) = snapshot {
        info!("commencing snapshot");
        match fs::remove_dir_all(&job.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&job.dir)?;
        let data = job.dir.join(DATA_FILE);
        // With zero dirty keys the environment was never reopened; the
        // copy path opens it transiently itself.
        env.copy_to(&data)?;
        if job.compress {
            gzip_file(&data)?;
        }
        info!("snapshot completed successfully");
    }
    Ok(())
}

/// Compresses `path` to `<path>.gz` and removes the original.
fn gzip_file(path: &Path) -> Result<(), FlushError> {
    let gz_path = path.with_extension("mdb.gz");
    let mut reader = io::BufReader::new(fs::File::open(path)?);
    let writer = io::BufWriter::new(fs::File::create(&gz_path)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut inner = encoder.finish()?;
    inner.flush()?;
    drop(inner);
    fs::remove_file(path)?;
    Ok(())
}
