//! Dirty-key registry.
//!
//! Each logical database owns a [`DirtyTracker`] holding three key sets:
//!
//! - `dirty` — keys whose authoritative state lives only in memory; the
//!   on-disk copy, if any, is stale.
//! - `flushing` — the previous dirty set, currently being persisted by the
//!   background flush worker.
//! - an optional [`KeyCache`] — every key known to exist on disk, used to
//!   answer negative lookups without touching the disk store.
//!
//! ## Invariants
//!
//! - `dirty ∩ flushing = ∅` whenever no flush is running.
//! - [`DirtyTracker::rotate`] requires the flushing set to be empty; the
//!   flush controller rejects reentrant flush starts to honor this.
//! - On flush failure every flushing key is merged back into the dirty set
//!   so it will be retried on the next cycle.
//!
//! The sets own their key bytes outright — entries are deep copies,
//! independent of the strings held by the in-memory dictionary.

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use tracing::trace;

/// The kind of mutation being reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// A key that did not exist was created.
    Add,
    /// An existing key's value was replaced or modified in place.
    Change,
    /// A key was removed.
    Delete,
    /// A key was removed because its TTL elapsed.
    Expired,
}

/// Optional set of every key known to exist on disk.
///
/// Whether the cache is enabled is encoded in the type, so a disabled
/// cache can never give a false "absent" answer.
#[derive(Debug)]
pub enum KeyCache {
    /// Keycache disabled; membership queries are never authoritative.
    Disabled,
    /// Keycache enabled and holding the on-disk key set.
    Enabled(HashSet<Vec<u8>>),
}

impl KeyCache {
    fn insert(&mut self, key: &[u8]) {
        if let KeyCache::Enabled(keys) = self {
            if !keys.contains(key) {
                keys.insert(key.to_vec());
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        if let KeyCache::Enabled(keys) = self {
            keys.remove(key);
        }
    }

    fn clear(&mut self) {
        if let KeyCache::Enabled(keys) = self {
            keys.clear();
        }
    }

    /// True iff the cache is enabled and *knows* the key is not on disk.
    pub fn cached_absent(&self, key: &[u8]) -> bool {
        match self {
            KeyCache::Disabled => false,
            KeyCache::Enabled(keys) => !keys.contains(key),
        }
    }
}

/// Per-database dirty/flushing sets plus the optional keycache.
#[derive(Debug)]
pub struct DirtyTracker {
    dirty: HashSet<Vec<u8>>,
    flushing: HashSet<Vec<u8>>,
    keycache: KeyCache,
}

impl DirtyTracker {
    /// Creates an empty tracker; `keycache` controls whether the negative
    /// lookup cache is carried.
    pub fn new(keycache: bool) -> Self {
        Self {
            dirty: HashSet::new(),
            flushing: HashSet::new(),
            keycache: if keycache {
                KeyCache::Enabled(HashSet::new())
            } else {
                KeyCache::Disabled
            },
        }
    }

    /// Records a mutation: marks the key dirty (duplicate-safe) and keeps
    /// the keycache in step with the key's on-disk destiny.
    pub fn notify(&mut self, key: &[u8], change: KeyChange) {
        if !self.dirty.contains(key) {
            self.dirty.insert(key.to_vec());
        }
        match change {
            KeyChange::Add => self.keycache.insert(key),
            KeyChange::Delete | KeyChange::Expired => self.keycache.remove(key),
            KeyChange::Change => {}
        }
        trace!(change = ?change, "key marked dirty");
    }

    /// True iff the key is pending persist — dirty or mid-flush.
    pub fn is_dirty(&self, key: &[u8]) -> bool {
        self.dirty.contains(key) || self.flushing.contains(key)
    }

    /// Fast negative answer: the keycache is on and does not know the key.
    pub fn cached_absent(&self, key: &[u8]) -> bool {
        self.keycache.cached_absent(key)
    }

    /// Seeds the keycache with a key discovered on disk at startup.
    pub fn seed_keycache(&mut self, key: &[u8]) {
        self.keycache.insert(key);
    }

    /// Swaps the dirty set into the flushing slot, leaving a fresh empty
    /// dirty set. O(1); no allocation.
    ///
    /// The flushing set must be empty — a rotation on top of an unfinished
    /// flush would lose keys, so this is an invariant violation.
    pub fn rotate(&mut self) {
        assert!(
            self.flushing.is_empty(),
            "rotated dirty keys on top of an unfinished flush"
        );
        std::mem::swap(&mut self.dirty, &mut self.flushing);
    }

    /// Flush failed: move every flushing key back into the dirty set so it
    /// is retried on the next cycle.
    pub fn merge_back(&mut self) {
        for key in self.flushing.drain() {
            self.dirty.insert(key);
        }
    }

    /// Flush succeeded: the flushing keys are now durable.
    pub fn clear_flushing(&mut self) {
        self.flushing.clear();
    }

    /// The database was emptied: nothing is pending persist and the disk
    /// holds no keys.
    pub fn clear_for_empty(&mut self) {
        self.dirty.clear();
        self.keycache.clear();
    }

    /// Number of keys pending persist.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Number of keys currently being persisted.
    pub fn flushing_len(&self) -> usize {
        self.flushing.len()
    }

    /// Iterates the keys captured by the last [`rotate`](Self::rotate).
    pub fn flushing_keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.flushing.iter()
    }

    /// Iterates the keys pending persist.
    pub fn dirty_keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.dirty.iter()
    }
}
