//! Thread-safe slot registry — the sole synchronization point between the
//! reconciler, the worker slots, and the status server.
//!
//! Grounded on `original_source/src/thread-registry.{h,cpp}`: a single
//! mutex guarding a `by_id` map and a `by_pool` index, with the same
//! register/unregister/poolCount/sendShutdown/shouldShutdown/setThreadState
//! operations, translated from `std::thread::id` to a `SlotId` newtype over
//! `uuid::Uuid` since Tokio tasks don't have a stable OS thread id.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

/// Opaque identifier for one live worker slot, unique across the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct SlotRecord {
    pool: String,
    should_shutdown: bool,
    state: String,
}

/// One row of a [`Registry::snapshot`] result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub pool: String,
    pub should_shutdown: bool,
    pub state: String,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<SlotId, SlotRecord>,
    by_pool: HashMap<String, HashSet<SlotId>>,
}

/// Process-wide slot registry. All operations take one mutex for their full
/// duration and never suspend on I/O while holding it.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert a new slot record in state `"starting"` with `should_shutdown`
    /// false. Panics if `id` is already registered — a double-register is a
    /// programmer error, not a recoverable one.
    pub fn register(&self, pool: &str, id: SlotId) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        assert!(
            !inner.by_id.contains_key(&id),
            "slot {id} registered twice"
        );

        inner.by_id.insert(
            id,
            SlotRecord {
                pool: pool.to_string(),
                should_shutdown: false,
                state: "starting".to_string(),
            },
        );
        inner.by_pool.entry(pool.to_string()).or_default().insert(id);
    }

    /// Remove a slot record. Panics if `id` is not present — unregistering
    /// an unknown slot is a programmer error.
    pub fn unregister(&self, pool: &str, id: SlotId) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let removed = inner.by_id.remove(&id);
        assert!(removed.is_some(), "unregister of unknown slot {id}");

        if let Some(set) = inner.by_pool.get_mut(pool) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_pool.remove(pool);
            }
        }
    }

    /// Number of slots currently tracked for `pool`.
    pub fn pool_count(&self, pool: &str) -> u32 {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .by_pool
            .get(pool)
            .map(|s| s.len() as u32)
            .unwrap_or(0)
    }

    /// Flag up to `n` not-yet-flagged slots in `pool` for shutdown.
    /// Iterates the pool's set exactly once (no retries) and returns the
    /// number actually flagged. Idempotent: already-flagged slots are
    /// skipped and don't count against `n`.
    pub fn request_shutdown(&self, pool: &str, n: u32) -> u32 {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let Some(ids) = inner.by_pool.get(pool).cloned() else {
            return 0;
        };

        let mut flagged = 0;
        for id in ids {
            if flagged == n {
                break;
            }
            let record = inner
                .by_id
                .get_mut(&id)
                .expect("by_pool/by_id out of sync");
            if !record.should_shutdown {
                record.should_shutdown = true;
                flagged += 1;
            }
        }

        flagged
    }

    /// Read the shutdown flag for a slot. Returns `false` for an unknown
    /// id — a slot racing its own `unregister` against a late read is
    /// expected, not a programmer error.
    pub fn should_shutdown(&self, id: SlotId) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.get(&id).map(|r| r.should_shutdown).unwrap_or(false)
    }

    /// Update a slot's free-form state string.
    pub fn set_state(&self, id: SlotId, state: impl Into<String>) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(record) = inner.by_id.get_mut(&id) {
            record.state = state.into();
        }
    }

    /// Copy out every live slot for the status server. Order is
    /// unspecified but stable within the call (the iteration order of the
    /// underlying map at the moment of the copy).
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .by_id
            .iter()
            .map(|(id, record)| SlotSnapshot {
                id: *id,
                pool: record.pool.clone(),
                should_shutdown: record.should_shutdown,
                state: record.state.clone(),
            })
            .collect()
    }

    /// `true` once every slot has unregistered — used by shutdown paths to
    /// confirm the fleet has fully drained.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_pool_count() {
        let reg = Registry::new();
        let id = SlotId::new();
        reg.register("p1", id);
        assert_eq!(reg.pool_count("p1"), 1);
        assert_eq!(reg.pool_count("p2"), 0);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_register_panics() {
        let reg = Registry::new();
        let id = SlotId::new();
        reg.register("p1", id);
        reg.register("p1", id);
    }

    #[test]
    #[should_panic(expected = "unknown slot")]
    fn unregister_unknown_panics() {
        let reg = Registry::new();
        reg.unregister("p1", SlotId::new());
    }

    #[test]
    fn unregister_removes_from_both_structures() {
        let reg = Registry::new();
        let id = SlotId::new();
        reg.register("p1", id);
        reg.unregister("p1", id);
        assert_eq!(reg.pool_count("p1"), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn request_shutdown_flags_up_to_n_and_is_idempotent() {
        let reg = Registry::new();
        let ids: Vec<_> = (0..5).map(|_| SlotId::new()).collect();
        for id in &ids {
            reg.register("p1", *id);
        }

        let flagged = reg.request_shutdown("p1", 3);
        assert_eq!(flagged, 3);

        let still_running = ids.iter().filter(|id| !reg.should_shutdown(**id)).count();
        assert_eq!(still_running, 2);

        // Calling again with n=3 only flags the remaining 2 (already-flagged
        // ones are skipped and don't count against the budget).
        let flagged_again = reg.request_shutdown("p1", 3);
        assert_eq!(flagged_again, 2);
        assert!(ids.iter().all(|id| reg.should_shutdown(*id)));
    }

    #[test]
    fn should_shutdown_is_one_shot_false_to_true() {
        let reg = Registry::new();
        let id = SlotId::new();
        reg.register("p1", id);
        assert!(!reg.should_shutdown(id));
        reg.request_shutdown("p1", 1);
        assert!(reg.should_shutdown(id));
    }

    #[test]
    fn snapshot_reflects_state() {
        let reg = Registry::new();
        let id = SlotId::new();
        reg.register("p1", id);
        reg.set_state(id, "waiting");

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].pool, "p1");
        assert_eq!(snap[0].state, "waiting");
        assert!(!snap[0].should_shutdown);
    }

    #[test]
    fn invariant_by_id_size_equals_sum_of_by_pool_sets() {
        let reg = Registry::new();
        for i in 0..10 {
            let pool = if i % 2 == 0 { "even" } else { "odd" };
            reg.register(pool, SlotId::new());
        }
        assert_eq!(reg.pool_count("even") + reg.pool_count("odd"), 10);
        assert_eq!(reg.snapshot().len(), 10);
    }
}
