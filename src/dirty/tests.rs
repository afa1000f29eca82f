use super::{DirtyTracker, KeyChange};

#[test]
fn notify_marks_dirty_once() {
    let mut t = DirtyTracker::new(false);
    t.notify(b"k", KeyChange::Add);
    t.notify(b"k", KeyChange::Change);
    t.notify(b"k", KeyChange::Change);
    assert_eq!(t.dirty_len(), 1);
    assert!(t.is_dirty(b"k"));
    assert!(!t.is_dirty(b"other"));
}

#[test]
fn rotate_swaps_sets_and_merge_back_restores() {
    let mut t = DirtyTracker::new(false);
    t.notify(b"a", KeyChange::Add);
    t.notify(b"b", KeyChange::Add);

    t.rotate();
    assert_eq!(t.dirty_len(), 0);
    assert_eq!(t.flushing_len(), 2);
    // Keys mid-flush still count as dirty for lookup purposes.
    assert!(t.is_dirty(b"a"));

    // New writes land in the fresh dirty set.
    t.notify(b"c", KeyChange::Add);
    assert_eq!(t.dirty_len(), 1);
    assert_eq!(t.flushing_len(), 2);

    t.merge_back();
    assert_eq!(t.flushing_len(), 0);
    assert_eq!(t.dirty_len(), 3);
    assert!(t.is_dirty(b"a") && t.is_dirty(b"b") && t.is_dirty(b"c"));
}

#[test]
fn clear_flushing_after_successful_flush() {
    let mut t = DirtyTracker::new(false);
    t.notify(b"a", KeyChange::Add);
    t.rotate();
    t.clear_flushing();
    assert_eq!(t.dirty_len(), 0);
    assert_eq!(t.flushing_len(), 0);
    assert!(!t.is_dirty(b"a"));
}

#[test]
#[should_panic(expected = "unfinished flush")]
fn rotate_with_pending_flush_panics() {
    let mut t = DirtyTracker::new(false);
    t.notify(b"a", KeyChange::Add);
    t.rotate();
    t.notify(b"b", KeyChange::Add);
    t.rotate();
}

#[test]
fn keycache_disabled_never_claims_absent() {
    let t = DirtyTracker::new(false);
    assert!(!t.cached_absent(b"anything"));
}

#[test]
fn keycache_tracks_adds_and_deletes() {
    let mut t = DirtyTracker::new(true);
    assert!(t.cached_absent(b"k"));

    t.notify(b"k", KeyChange::Add);
    assert!(!t.cached_absent(b"k"));

    // A change leaves the cache alone.
    t.notify(b"k", KeyChange::Change);
    assert!(!t.cached_absent(b"k"));

    t.notify(b"k", KeyChange::Delete);
    assert!(t.cached_absent(b"k"));

    t.notify(b"k", KeyChange::Add);
    t.notify(b"k", KeyChange::Expired);
    assert!(t.cached_absent(b"k"));
}

#[test]
fn seed_keycache_registers_on_disk_keys() {
    let mut t = DirtyTracker::new(true);
    t.seed_keycache(b"loaded");
    assert!(!t.cached_absent(b"loaded"));
    assert_eq!(t.dirty_len(), 0);
}

#[test]
fn clear_for_empty_resets_dirty_and_keycache() {
    let mut t = DirtyTracker::new(true);
    t.notify(b"a", KeyChange::Add);
    t.notify(b"b", KeyChange::Add);
    t.clear_for_empty();
    assert_eq!(t.dirty_len(), 0);
    assert!(t.cached_absent(b"a"));
}

#[test]
fn sets_own_their_keys() {
    let mut t = DirtyTracker::new(true);
    let mut key = b"shared".to_vec();
    t.notify(&key, KeyChange::Add);
    // Mutating the caller's buffer must not affect the registry.
    key.clear();
    assert!(t.is_dirty(b"shared"));
    assert!(!t.cached_absent(b"shared"));
}
