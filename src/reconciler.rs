//! Periodic and startup reconciliation: walks the watched root, compares
//! it against the state store, and enqueues the changes the watcher
//! might have missed (startup, a dropped `notify` event, a degraded
//! polling window).
//!
//! Grounded on the sync plugin's `generate_index` (a `WalkDir` pass
//! building a flat index) and `create_sync_plan` (diffing two indexes
//! into actions), generalized from a two-sided remote/local diff into a
//! one-sided local-vs-state-store diff, since this daemon's remote is an
//! opaque upload endpoint rather than a second full index.

use crate::fingerprint::hash_file;
use crate::path_filter::Filter;
use crate::queue::{ChangeKind, ChangeQueue, PendingChange};
use crate::state_store::{FileRecord, StateStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct Reconciler {
    filter: Arc<Filter>,
    queue: Arc<ChangeQueue>,
    state: Arc<StateStore>,
}

impl Reconciler {
    pub fn new(filter: Arc<Filter>, queue: Arc<ChangeQueue>, state: Arc<StateStore>) -> Self {
        Self { filter, queue, state }
    }

    /// Runs every `interval` until `shutdown` fires. The first pass runs
    /// immediately rather than waiting out the first interval, so a
    /// freshly started daemon doesn't sit idle before its first scan.
    pub async fn run(
        &self,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "reconciliation pass failed, will retry next interval");
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }

            if !self.await_backpressure_relief(&mut shutdown).await {
                info!("reconciler shutting down");
                return;
            }
        }
    }

    /// Blocks the next tick while the change queue sits at its
    /// backpressure limit, resuming once depth drops below half the
    /// limit (§5). Returns `false` if shutdown fired while waiting.
    async fn await_backpressure_relief(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> bool {
        if !self.queue.is_at_backpressure_limit() {
            return true;
        }
        warn!(
            depth = self.queue.depth(),
            "change queue at backpressure limit, delaying next reconciliation pass"
        );
        let relief = self.queue.backpressure_relief_threshold();
        let mut poll = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            if self.queue.depth() < relief {
                return true;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }

    /// Walks the watched root once, enqueueing upserts for new or
    /// modified files and deletes for records no longer present on disk.
    pub async fn run_once(&self) -> crate::error::Result<()> {
        let root = self.filter.root().to_path_buf();
        if !root.exists() {
            return Err(crate::error::AdapterError::RootUnavailable(root));
        }

        let mut seen = HashSet::new();
        let mut upserts = 0usize;

        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative_path = match self.filter.resolve(entry.path()) {
                Ok(rp) => rp,
                Err(_) => continue,
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %relative_path, error = %e, "could not stat file during walk, skipping");
                    continue;
                }
            };

            seen.insert(relative_path.as_str().to_string());

            let size = metadata.len();
            let mtime_nanos = mtime_nanos(&metadata);

            let existing = self.state.get(&relative_path).await;
            let needs_upsert = match &existing {
                None => true,
                Some(record) if record.size != size || record.mtime_nanos != mtime_nanos => {
                    // Size or mtime moved: always treat as changed without
                    // re-hashing first, since a cheap shortcut only pays
                    // off on the *unchanged* path.
                    true
                }
                Some(record) if !record.can_skip_rehash() => {
                    // (size, mtime) match, but a prior attempt failed or is
                    // still outstanding: confirm via hash rather than trust
                    // the shortcut.
                    match hash_file(entry.path()).await {
                        Ok(fingerprint) => fingerprint != record.content_fingerprint,
                        Err(e) => {
                            debug!(path = %relative_path, error = %e, "re-hash failed, leaving for next pass");
                            false
                        }
                    }
                }
                Some(_) => false,
            };

            if needs_upsert {
                upserts += 1;
                self.queue.push(PendingChange {
                    relative_path,
                    kind: ChangeKind::Upsert,
                    discovered_at: chrono::Utc::now(),
                });
            }
        }

        let mut deletes = 0usize;
        for record in self.state.iter().await {
            if !seen.contains(&record.relative_path) {
                if let Some(relative_path) =
                    crate::path_filter::RelativePath::new(std::path::Path::new(&record.relative_path))
                {
                    deletes += 1;
                    self.queue.push(PendingChange {
                        relative_path,
                        kind: ChangeKind::Delete,
                        discovered_at: chrono::Utc::now(),
                    });
                }
            }
        }

        info!(upserts, deletes, "reconciliation pass complete");
        Ok(())
    }
}

/// Builds the baseline [`FileRecord`] the uploader will persist once it
/// has a confirmed fingerprint for a freshly discovered or changed file.
pub async fn record_for(
    relative_path: &crate::path_filter::RelativePath,
    absolute_path: &std::path::Path,
) -> std::io::Result<FileRecord> {
    let metadata = tokio::fs::metadata(absolute_path).await?;
    let fingerprint = hash_file(absolute_path).await?;
    Ok(FileRecord::fresh(
        relative_path,
        metadata.len(),
        mtime_nanos(&metadata),
        fingerprint,
    ))
}

fn mtime_nanos(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
