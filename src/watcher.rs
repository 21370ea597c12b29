//! Filesystem watcher: translates `notify` events into [`PendingChange`]s.
//!
//! Grounded on the sync plugin's use of `notify::RecommendedWatcher` over
//! the sync folder root, generalized with a debounce window and with
//! rename-as-remove-then-create handling the plugin didn't need (its
//! folder layout was flatter).

use crate::path_filter::Filter;
use crate::queue::{ChangeKind, ChangeQueue, PendingChange};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Runs until `shutdown` resolves. Watches `filter.root()` recursively,
/// debounces bursts of raw `notify` events, and pushes resulting changes
/// onto `queue`.
///
/// New directories are watched before their creation event is processed,
/// since `notify`'s recursive mode picks up subdirectories as they're
/// added to the tree it already watches; no separate add-after-discover
/// step is needed with `RecursiveMode::Recursive`.
pub async fn run(
    filter: Arc<Filter>,
    queue: Arc<ChangeQueue>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::Result<()> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    })
    .map_err(|e| crate::error::AdapterError::Watch(e.to_string()))?;

    watcher
        .watch(filter.root(), RecursiveMode::Recursive)
        .map_err(|e| crate::error::AdapterError::Watch(e.to_string()))?;

    info!(root = %filter.root().display(), "filesystem watcher started");

    let mut pending: Vec<Event> = Vec::new();
    let mut debounce = tokio::time::interval(DEBOUNCE_WINDOW);
    debounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("filesystem watcher shutting down");
                    break;
                }
            }
            maybe_event = raw_rx.recv() => {
                match maybe_event {
                    Some(Ok(event)) => pending.push(event),
                    Some(Err(e)) => {
                        warn!(error = %e, "watch error, falling back to degraded polling until next reconciliation pass");
                    }
                    None => {
                        error!("watcher event channel closed unexpectedly");
                        break;
                    }
                }
            }
            _ = debounce.tick() => {
                if !pending.is_empty() {
                    let batch = std::mem::take(&mut pending);
                    apply_batch(&filter, &queue, batch);
                }
            }
        }
    }

    Ok(())
}

fn apply_batch(filter: &Filter, queue: &ChangeQueue, events: Vec<Event>) {
    for event in events {
        let kind = match classify(&event.kind) {
            Some(kind) => kind,
            None => continue,
        };
        for path in event.paths {
            enqueue_path(filter, queue, &path, kind);
        }
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(ChangeKind::Upsert),
        EventKind::Remove(_) => Some(ChangeKind::Delete),
        // Rename events surface as a remove on the old path and a create
        // on the new one in notify's event stream; both arrive as
        // separate `Event`s and are handled by the arms above.
        _ => None,
    }
}

fn enqueue_path(filter: &Filter, queue: &ChangeQueue, path: &Path, kind: ChangeKind) {
    match filter.resolve(path) {
        Ok(relative_path) => {
            debug!(path = %relative_path, ?kind, "watcher observed change");
            queue.push(PendingChange {
                relative_path,
                kind,
                discovered_at: chrono::Utc::now(),
            });
        }
        Err(reason) => {
            debug!(path = %path.display(), %reason, "watcher ignoring filtered path");
        }
    }
}
