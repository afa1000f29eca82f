//! Lookup and mutation path.
//!
//! Read-through, write-behind semantics over the per-database state:
//! lookups fall through to the disk store on a dictionary miss; mutations
//! stay in memory and mark their key dirty. The rules that keep the cache
//! coherent:
//!
//! - A key in `dirty ∪ flushing` that is not resident has been deleted;
//!   the stale disk copy must never be served.
//! - With the keycache on, a negative keycache answer is authoritative
//!   and short-circuits all disk I/O.
//! - Deletion counts logical removal over the union of in-memory and
//!   on-disk presence, so `DEL` answers correctly across cache misses.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{Engine, EngineError, now_ms};
use crate::dirty::KeyChange;
use crate::freezer::{AccessMode, MAX_KEY_LEN, WalkControl};
use crate::payload;
use crate::value::{Value, ValueKind};

impl Engine {
    /// Rejects empty keys and keys the disk store cannot index. With the
    /// disk store off, any key the dictionary can hold is fine.
    pub(crate) fn validate_key(&self, key: &[u8]) -> Result<(), EngineError> {
        if !self.config.disk_store {
            return Ok(());
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(EngineError::InvalidKey);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    /// Read-path lookup: expiry check, then dictionary, then disk.
    /// Keyspace hit/miss statistics are recorded.
    pub fn get(&mut self, db: usize, key: &[u8]) -> Result<Option<&Value>, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        self.expire_if_needed(db, key)?;
        let present = self.ensure_resident(db, key)?;
        if present {
            self.stats.keyspace_hits += 1;
        } else {
            self.stats.keyspace_misses += 1;
        }
        Ok(self.dbs[db].dict.get(key).map(|slot| &slot.value))
    }

    /// Read-through existence check. Does not fault the value in.
    pub fn exists(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        self.expire_if_needed(db, key)?;
        if self.dbs[db].dict.contains_key(key) {
            return Ok(true);
        }
        if self.config.disk_store {
            return self.exists_disk(db, key);
        }
        Ok(false)
    }

    /// Type of the value stored at `key`, faulting it in if needed.
    pub fn value_kind(&mut self, db: usize, key: &[u8]) -> Result<Option<ValueKind>, EngineError> {
        Ok(self.get(db, key)?.map(|v| v.kind()))
    }

    // --------------------------------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------------------------------

    /// High-level set: add or overwrite, then make the key persistent and
    /// signal the modification.
    pub fn set(&mut self, db: usize, key: &[u8], value: Value) -> Result<(), EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        self.expire_if_needed(db, key)?;
        if self.ensure_resident(db, key)? {
            self.overwrite(db, key, value)?;
        } else {
            self.insert(db, key, value)?;
        }
        if self.dbs[db].mem_expire(key).is_some() {
            self.dbs[db].remove_expire(key);
        }
        self.signal_modified(db, key);
        Ok(())
    }

    /// Adds a key that must not exist yet. Low-level: the caller signals
    /// the modification.
    pub fn insert(&mut self, db: usize, key: &[u8], value: Value) -> Result<(), EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        self.dbs[db].dict_add(key.to_vec(), value, now_ms() as u64);
        if self.config.disk_store {
            self.dbs[db].tracker.notify(key, KeyChange::Add);
        }
        Ok(())
    }

    /// Replaces the value of a key that must exist, preserving its expiry.
    /// Low-level: the caller signals the modification.
    pub fn overwrite(&mut self, db: usize, key: &[u8], value: Value) -> Result<(), EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        if self.config.disk_store {
            self.dbs[db].tracker.notify(key, KeyChange::Change);
        }
        self.dbs[db].dict_overwrite(key, value, now_ms() as u64);
        Ok(())
    }

    /// Deletes a key. The returned flag is the logical removal count over
    /// the union of in-memory and on-disk presence, so the answer is
    /// right even when the key was never resident.
    pub fn delete(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        let removed = self.delete_internal(db, key)?;
        if removed {
            self.signal_modified(db, key);
        }
        Ok(removed)
    }

    pub(crate) fn delete_internal(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.dbs[db].clear_expire(key);
        let mut removed = false;
        if self.config.disk_store && self.exists_disk(db, key)? {
            removed = true;
        }
        if self.dbs[db].dict_remove(key) {
            removed = true;
        }
        if self.config.disk_store {
            self.dbs[db].tracker.notify(key, KeyChange::Delete);
        }
        Ok(removed)
    }

    /// Renames `src` to `dst`, forcing `src` through the cache first so a
    /// disk-only key renames correctly. With `nx`, an existing `dst`
    /// aborts the rename and `Ok(false)` is returned.
    pub fn rename(
        &mut self,
        db: usize,
        src: &[u8],
        dst: &[u8],
        nx: bool,
    ) -> Result<bool, EngineError> {
        self.check_db(db)?;
        self.validate_key(src)?;
        self.validate_key(dst)?;
        if src == dst {
            return Err(EngineError::SameObject);
        }

        self.expire_if_needed(db, src)?;
        if !self.ensure_resident(db, src)? {
            return Err(EngineError::NoSuchKey);
        }
        let value = self.dbs[db]
            .dict
            .get(src)
            .map(|slot| slot.value.clone())
            .ok_or(EngineError::NoSuchKey)?;
        let expire = self.dbs[db].mem_expire(src);

        self.expire_if_needed(db, dst)?;
        if self.ensure_resident(db, dst)? {
            if nx {
                return Ok(false);
            }
            self.delete_internal(db, dst)?;
        }

        self.insert(db, dst, value)?;
        if let Some(when) = expire {
            self.dbs[db].set_expire(dst, when);
        }
        self.delete_internal(db, src)?;
        self.signal_modified(db, src);
        self.signal_modified(db, dst);
        Ok(true)
    }

    /// Empties one database: dictionary, expires, the on-disk freezer,
    /// and the pending-persist bookkeeping. Returns the number of
    /// resident keys removed.
    pub fn flush_db(&mut self, db: usize) -> Result<usize, EngineError> {
        self.check_db(db)?;
        let removed = self.dbs[db].dict.len();
        self.dirty += removed as u64;
        self.dbs[db].dict.clear();
        self.dbs[db].expires.clear();
        if self.config.disk_store {
            let id = self.dbs[db].id;
            let guard = self.freezer.open(id, AccessMode::Write)?;
            guard.drop_all()?;
            guard.close()?;
            self.dbs[db].tracker.clear_for_empty();
        }
        debug!(db, removed, "database emptied");
        Ok(removed)
    }

    // --------------------------------------------------------------------------------------------
    // Expiry
    // --------------------------------------------------------------------------------------------

    /// Sets an absolute millisecond expiry. A deadline already in the
    /// past deletes the key immediately (except while loading or in
    /// replica mode, where the master drives deletion). Returns `false`
    /// if the key does not exist.
    pub fn expire_at(&mut self, db: usize, key: &[u8], when_ms: i64) -> Result<bool, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        if self.get(db, key)?.is_none() {
            return Ok(false);
        }
        if when_ms <= now_ms() && !self.loading && !self.replica {
            let removed = self.delete(db, key)?;
            assert!(removed, "resident key vanished during immediate expiry");
            Ok(true)
        } else {
            self.dbs[db].set_expire(key, when_ms);
            self.signal_modified(db, key);
            Ok(true)
        }
    }

    /// Remaining time to live in milliseconds, or `None` when the key has
    /// no expiry (or does not exist). Faults the key in first so the
    /// answer is correct for non-resident keys.
    pub fn ttl_ms(&mut self, db: usize, key: &[u8]) -> Result<Option<i64>, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        if self.config.disk_store {
            self.ensure_resident(db, key)?;
        }
        match self.get_expire(db, key)? {
            Some(when) => {
                let ttl = when - now_ms();
                Ok(if ttl >= 0 { Some(ttl) } else { None })
            }
            None => Ok(None),
        }
    }

    /// Drops the expiry of a key, faulting it in first. Returns whether
    /// an expiry was removed.
    pub fn persist(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        self.check_db(db)?;
        self.validate_key(key)?;
        if self.config.disk_store {
            self.ensure_resident(db, key)?;
        }
        if !self.dbs[db].dict.contains_key(key) {
            return Ok(false);
        }
        if self.dbs[db].remove_expire(key) {
            if self.config.disk_store {
                self.dbs[db].tracker.notify(key, KeyChange::Change);
            }
            self.dirty += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Expiry deadline of a key, consulting disk when the key is not
    /// resident so TTL questions are answered without faulting it in.
    pub(crate) fn get_expire(&mut self, db: usize, key: &[u8]) -> Result<Option<i64>, EngineError> {
        if self.dbs[db].dict.contains_key(key) {
            return Ok(self.dbs[db].mem_expire(key));
        }
        if self.config.disk_store {
            return Ok(self.fetch_payload(db, key)?.and_then(|(_, expire)| expire));
        }
        Ok(None)
    }

    /// Deletes the key if its deadline has passed. Returns whether the
    /// key is expired from the caller's point of view.
    ///
    /// Nothing expires while loading; in replica mode the logical answer
    /// is returned but the deletion is left to the master's `DEL`.
    pub(crate) fn expire_if_needed(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        let Some(when) = self.get_expire(db, key)? else {
            return Ok(false);
        };
        if self.loading {
            return Ok(false);
        }
        let now = now_ms();
        if self.replica {
            return Ok(now > when);
        }
        if now <= when {
            return Ok(false);
        }

        trace!(db, "expiring key past its deadline");
        if self.config.disk_store {
            self.dbs[db].tracker.notify(key, KeyChange::Expired);
        }
        self.stats.expired_keys += 1;
        if let Some(events) = self.events.as_mut() {
            events.key_expired(self.dbs[db].id, key);
        }
        self.delete_internal(db, key)?;
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Key listing
    // --------------------------------------------------------------------------------------------

    /// Lists keys matching a glob pattern.
    ///
    /// With the disk store on this is the documented slow path: wait out
    /// any running flush, push every remaining dirty key to disk
    /// synchronously, then walk the whole on-disk keyspace so one pass
    /// sees every key. Matches are expiry-checked before being returned.
    pub fn keys(&mut self, db: usize, pattern: &str) -> Result<Vec<Vec<u8>>, EngineError> {
        self.check_db(db)?;
        let compiled = if pattern == "*" {
            None
        } else {
            Some(glob::Pattern::new(pattern)?)
        };

        let mut matched = Vec::new();
        if self.config.disk_store {
            while self.flush_active() {
                if self.poll_flush().is_none() {
                    std::thread::sleep(Duration::from_micros(100));
                }
            }
            self.flush_dirty_sync()?;
            self.post_flush_cleanup();

            let id = self.dbs[db].id;
            self.freezer.walk(id, 0, || {}, |key| {
                if key_matches(&compiled, key) {
                    matched.push(key.to_vec());
                }
                WalkControl::Continue
            })?;
        } else {
            matched = self.dbs[db]
                .dict
                .keys()
                .filter(|key| key_matches(&compiled, key))
                .cloned()
                .collect();
        }

        let mut out = Vec::with_capacity(matched.len());
        for key in matched {
            if !self.expire_if_needed(db, &key)? {
                out.push(key);
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Disk paths
    // --------------------------------------------------------------------------------------------

    /// Makes `key` resident if it exists anywhere, returning whether it
    /// does. Records cache hit/miss statistics and refreshes the access
    /// stamp on hits.
    pub(crate) fn ensure_resident(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        if self.dbs[db].dict.contains_key(key) {
            if self.config.disk_store {
                self.stats.cache_hits += 1;
            }
            // No access-stamp refresh while a flush worker shares these
            // pages.
            if !self.flush_active() {
                if let Some(slot) = self.dbs[db].dict.get_mut(key) {
                    slot.last_access = now_ms() as u64;
                }
            }
            return Ok(true);
        }
        if !self.config.disk_store {
            return Ok(false);
        }

        self.stats.cache_misses += 1;
        match self.fetch_payload(db, key)? {
            Some((value, expire)) => {
                trace!(db, "key loaded from the disk store");
                self.dbs[db].dict_add(key.to_vec(), value, now_ms() as u64);
                if let Some(when) = expire {
                    self.dbs[db].set_expire(key, when);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads and decodes the disk payload for `key`, without installing
    /// it. The dirty and keycache short-circuits apply; a corrupt payload
    /// is logged and treated as absent.
    fn fetch_payload(
        &mut self,
        db: usize,
        key: &[u8],
    ) -> Result<Option<(Value, Option<i64>)>, EngineError> {
        {
            let tracker = &self.dbs[db].tracker;
            if tracker.is_dirty(key) {
                // A dirty key still alive would be resident; absent means
                // deleted, and the disk copy is stale.
                trace!(db, "dirty key is not resident; treating as absent");
                return Ok(None);
            }
            if tracker.cached_absent(key) {
                return Ok(None);
            }
        }

        let id = self.dbs[db].id;
        self.stats.disk_reads += 1;
        let started = Instant::now();
        let bytes = {
            let guard = self.freezer.open(id, AccessMode::Read)?;
            guard.get(key)?
        };
        self.stats.disk_micros += started.elapsed().as_micros() as u64;

        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match payload::verify(&bytes).and_then(|()| payload::decode(&bytes)) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                warn!(db, error = %e, "bad payload format for key; ignoring");
                Ok(None)
            }
        }
    }

    /// On-disk existence check with the same dirty/keycache
    /// short-circuits as [`fetch_payload`](Self::fetch_payload).
    pub(crate) fn exists_disk(&mut self, db: usize, key: &[u8]) -> Result<bool, EngineError> {
        {
            let tracker = &self.dbs[db].tracker;
            if tracker.is_dirty(key) {
                return Ok(false);
            }
            if tracker.cached_absent(key) {
                return Ok(false);
            }
        }
        let id = self.dbs[db].id;
        self.stats.disk_reads += 1;
        let started = Instant::now();
        let found = {
            let guard = self.freezer.open(id, AccessMode::Read)?;
            guard.exists(key)?
        };
        self.stats.disk_micros += started.elapsed().as_micros() as u64;
        Ok(found)
    }
}

fn key_matches(pattern: &Option<glob::Pattern>, key: &[u8]) -> bool {
    match pattern {
        None => true,
        Some(p) => p.matches(&String::from_utf8_lossy(key)),
    }
}
