//! Wires every component together and owns the startup/shutdown
//! sequence described for the lifecycle task: config, logger, state
//! store, watcher, uploader pool, reconciler, then the run loop.

use crate::config::Config;
use crate::path_filter::Filter;
use crate::queue::ChangeQueue;
use crate::reconciler::Reconciler;
use crate::state_store::{StateStore, UploadState};
use crate::uploader::{ReqwestClient, UploadClient, UploaderPool};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_EMISSION_INTERVAL: Duration = Duration::from_secs(60);

pub struct Daemon {
    config: Config,
    data_dir: PathBuf,
}

impl Daemon {
    pub fn new(config: Config, data_dir: PathBuf) -> Self {
        Self { config, data_dir }
    }

    /// Runs until a shutdown signal arrives, then drains in-flight work
    /// for up to [`GRACEFUL_DRAIN_TIMEOUT`] before returning.
    pub async fn run(self) -> crate::error::Result<()> {
        let root = self.config.resolve_watched_root()?;
        if !root.exists() {
            // Missing at startup is a fatal configuration error (§3, §6,
            // exit code 1), distinct from `RootUnavailable`'s runtime
            // meaning (a transient cloud-mount unmount the reconciler
            // waits out, see `reconciler.rs::run_once`).
            return Err(crate::error::AdapterError::config(
                "parent_folder",
                format!("watched root {} does not exist", root.display()),
            ));
        }

        ensure_data_dir(&self.data_dir)
            .map_err(|e| crate::error::AdapterError::StateStore(format!("{e:#}")))?;

        let filter = Arc::new(Filter::new(root, &self.config.file_extensions));
        let queue = Arc::new(ChangeQueue::default());
        let state = StateStore::open(self.data_dir.join("state.json")).await?;
        let client: Arc<dyn UploadClient> = Arc::new(ReqwestClient::new(&self.config)?);

        let uploader = UploaderPool::new(
            client,
            Arc::clone(&filter),
            Arc::clone(&queue),
            Arc::clone(&state),
            self.config.max_concurrent_uploads,
            self.config.delete_propagation,
        );
        let reconciler = Reconciler::new(Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let watcher_handle = tokio::spawn(crate::watcher::run(
            Arc::clone(&filter),
            Arc::clone(&queue),
            shutdown_rx.clone(),
        ));
        let uploader_handle = tokio::spawn(Arc::clone(&uploader).run(shutdown_rx.clone()));
        let reconciler_handle = tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            let interval = Duration::from_secs(self.config.sync_interval_seconds);
            async move { reconciler.run(interval, shutdown_rx).await }
        });

        info!(
            root = %filter.root().display(),
            sync_interval_seconds = self.config.sync_interval_seconds,
            max_concurrent_uploads = self.config.max_concurrent_uploads,
            git_hash = env!("GIT_HASH"),
            rustc_version = env!("RUSTC_VERSION"),
            "daemon started"
        );

        let started_at = Instant::now();
        let mut status_ticker = tokio::time::interval(STATUS_EMISSION_INTERVAL);

        loop {
            tokio::select! {
                _ = wait_for_termination() => {
                    info!("shutdown signal received, beginning graceful drain");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                _ = status_ticker.tick() => {
                    emit_status(&queue, &state, started_at).await;
                }
            }
        }

        let drain = async {
            let _ = watcher_handle.await;
            let _ = uploader_handle.await;
            let _ = reconciler_handle.await;
        };

        if tokio::time::timeout(GRACEFUL_DRAIN_TIMEOUT, drain).await.is_err() {
            error!("graceful drain timed out, exiting anyway");
        }

        state.flush().await?;
        info!("daemon stopped");
        Ok(())
    }
}

/// Creates the data directory (and thus the parent for `state.json` and
/// `logs/`) if it doesn't already exist, attaching path context to any
/// failure the way this lineage's components use `anyhow::Context` for
/// ad-hoc internal error attachment before it crosses into the crate's
/// typed [`AdapterError`] boundary.
fn ensure_data_dir(data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn emit_status(queue: &ChangeQueue, state: &StateStore, started_at: Instant) {
    let records = state.iter().await;
    let uploaded = records
        .iter()
        .filter(|r| r.upload_state == UploadState::Uploaded)
        .count();
    let pending = records
        .iter()
        .filter(|r| r.upload_state == UploadState::Pending)
        .count();
    let failed = records
        .iter()
        .filter(|r| r.upload_state == UploadState::Failed)
        .count();

    info!(
        queue_depth = queue.depth(),
        tracked_files = records.len(),
        uploaded,
        pending,
        failed,
        uptime_secs = started_at.elapsed().as_secs(),
        git_hash = env!("GIT_HASH"),
        build_timestamp = env!("BUILD_TIMESTAMP"),
        "status"
    );
}
