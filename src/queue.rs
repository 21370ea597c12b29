//! The pending-change queue: a deduplicated, FIFO-ordered set of paths
//! that need reconciliation attention.
//!
//! Grounded on the upload queue in Labric's uploader (`Arc<Mutex<VecDeque<_>>>`
//! guarding a work list that a pool of workers drains), generalized so a
//! path already queued is never queued twice — the watcher and the
//! reconciler both feed this queue and must not cause it to grow
//! unboundedly under a burst of redundant events.

use crate::path_filter::RelativePath;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::warn;

/// Soft cap on distinct queued paths (§5). Past this, new discoveries
/// are dropped with a warning rather than growing the queue forever;
/// the next periodic reconciliation pass will pick them back up.
pub const DEFAULT_BACKPRESSURE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct PendingChange {
    pub relative_path: RelativePath,
    pub kind: ChangeKind,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    order: VecDeque<String>,
    entries: HashMap<String, PendingChange>,
    /// Paths currently claimed by an in-flight worker. A change that
    /// arrives for a claimed path is folded in so it's picked up again
    /// once the in-flight attempt finishes, instead of being lost.
    in_flight: HashMap<String, PendingChange>,
}

/// Mutex-protected dedup queue shared between the watcher, the
/// reconciler and the uploader pool.
pub struct ChangeQueue {
    inner: Mutex<Inner>,
    backpressure_limit: usize,
}

impl ChangeQueue {
    pub fn new(backpressure_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            backpressure_limit,
        }
    }

    /// Enqueues (or replaces) a change for a path. If the path is
    /// currently claimed by an in-flight worker, the change is recorded
    /// so it gets re-queued the moment the claim is released rather than
    /// being merged into the in-flight attempt, which may already have
    /// read stale content.
    pub fn push(&self, change: PendingChange) {
        let key = change.relative_path.as_str().to_string();
        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        if inner.in_flight.contains_key(&key) {
            inner.in_flight.insert(key, change);
            return;
        }

        if !inner.entries.contains_key(&key) {
            if inner.entries.len() >= self.backpressure_limit {
                warn!(
                    path = %change.relative_path,
                    limit = self.backpressure_limit,
                    "change queue past backpressure limit, enqueuing anyway (correctness priority)"
                );
            }
            inner.order.push_back(key.clone());
        }
        inner.entries.insert(key, change);
    }

    /// Claims the next change in FIFO order, marking its path in-flight
    /// so a concurrent `push` for the same path doesn't race the worker
    /// that's about to act on it.
    pub fn claim_next(&self) -> Option<PendingChange> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        while let Some(key) = inner.order.pop_front() {
            if let Some(change) = inner.entries.remove(&key) {
                inner.in_flight.insert(key, change.clone());
                return Some(change);
            }
        }
        None
    }

    /// Releases a claim. If a new change arrived for this path while it
    /// was in-flight, it's re-queued immediately.
    pub fn release_claim(&self, relative_path: &RelativePath) {
        let key = relative_path.as_str().to_string();
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(change) = inner.in_flight.remove(&key) {
            if !inner.entries.contains_key(&key) {
                inner.order.push_back(key.clone());
            }
            inner.entries.insert(key, change);
        }
    }

    /// Releases a claim without re-queuing: the in-flight attempt fully
    /// resolved the change and nothing superseded it meanwhile.
    pub fn complete_claim(&self, relative_path: &RelativePath) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.in_flight.remove(relative_path.as_str());
    }

    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        inner.entries.len() + inner.in_flight.len()
    }

    /// True once `depth()` has reached the backpressure limit. The
    /// reconciler uses this to delay its next tick until depth drops
    /// back below half the limit (§5).
    pub fn is_at_backpressure_limit(&self) -> bool {
        self.depth() >= self.backpressure_limit
    }

    pub fn backpressure_relief_threshold(&self) -> usize {
        self.backpressure_limit / 2
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BACKPRESSURE_LIMIT)
    }
}
