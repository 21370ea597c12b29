//! Bounded-concurrency upload workers.
//!
//! The retry/backoff shape is grounded on the desktop uploader's `retry`
//! helper (attempts with a growing delay) and on Labric's queue-draining
//! worker pool (a `Semaphore` bounding how many uploads run at once);
//! `reqwest` itself is not something the teacher workspace uses anywhere,
//! since its daemon talks KDE Connect's own TLS socket protocol, not
//! HTTP, so the client and multipart plumbing below follow the other
//! pack repos instead.

use crate::capability::{Clock, SystemClock};
use crate::config::Config;
use crate::fingerprint::hash_file;
use crate::path_filter::{Filter, RelativePath};
use crate::queue::{ChangeKind, ChangeQueue, PendingChange};
use crate::reconciler::record_for;
use crate::state_store::{FileRecord, StateStore, UploadState};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const AUTH_WARNING_INTERVAL: Duration = Duration::from_secs(300);

/// The capability seam for the network side of an upload. Production
/// code uses [`ReqwestClient`]; tests substitute a fake that records
/// calls and returns canned outcomes, without a live server.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn put_file(
        &self,
        relative_path: &RelativePath,
        absolute_path: &std::path::Path,
    ) -> Result<(), UploadError>;

    async fn delete_file(&self, relative_path: &RelativePath) -> Result<(), UploadError>;
}

#[derive(Debug)]
pub enum UploadError {
    /// Network failure, 5xx, or 429: worth retrying with backoff.
    Transient(String),
    /// 4xx other than 408/429, or a response the server will never
    /// accept as-is: no point retrying automatically.
    Permanent(String),
    /// 401/403: distinct from other permanent failures so the daemon can
    /// rate-limit how often it logs about it.
    Unauthorized(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Unauthorized(m) => f.write_str(m),
        }
    }
}

pub struct ReqwestClient {
    http: reqwest::Client,
    endpoint: url::Url,
    api_key: String,
}

impl ReqwestClient {
    pub fn new(config: &Config) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.api_endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> UploadError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            UploadError::Unauthorized(format!("{status}: {body}"))
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            UploadError::Transient(format!("{status}: {body}"))
        } else {
            UploadError::Permanent(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl UploadClient for ReqwestClient {
    async fn put_file(
        &self,
        relative_path: &RelativePath,
        absolute_path: &std::path::Path,
    ) -> Result<(), UploadError> {
        let bytes = tokio::fs::read(absolute_path)
            .await
            .map_err(|e| UploadError::Transient(format!("reading {}: {e}", absolute_path.display())))?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(relative_path.basename().to_string());
        let form = reqwest::multipart::Form::new()
            .text("relative_path", relative_path.as_str().to_string())
            .part("file", part);

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify_status(status, body))
    }

    async fn delete_file(&self, relative_path: &RelativePath) -> Result<(), UploadError> {
        let response = self
            .http
            .delete(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .query(&[("relative_path", relative_path.as_str())])
            .send()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify_status(status, body))
    }
}

pub struct UploaderPool {
    client: Arc<dyn UploadClient>,
    filter: Arc<Filter>,
    queue: Arc<ChangeQueue>,
    state: Arc<StateStore>,
    semaphore: Arc<Semaphore>,
    delete_propagation: bool,
    last_auth_warning_secs: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl UploaderPool {
    pub fn new(
        client: Arc<dyn UploadClient>,
        filter: Arc<Filter>,
        queue: Arc<ChangeQueue>,
        state: Arc<StateStore>,
        max_concurrent_uploads: u32,
        delete_propagation: bool,
    ) -> Arc<Self> {
        Self::with_clock(
            client,
            filter,
            queue,
            state,
            max_concurrent_uploads,
            delete_propagation,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        client: Arc<dyn UploadClient>,
        filter: Arc<Filter>,
        queue: Arc<ChangeQueue>,
        state: Arc<StateStore>,
        max_concurrent_uploads: u32,
        delete_propagation: bool,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            filter,
            queue,
            state,
            semaphore: Arc::new(Semaphore::new(max_concurrent_uploads as usize)),
            delete_propagation,
            last_auth_warning_secs: AtomicU64::new(0),
            clock,
        })
    }

    /// Claims changes off `queue` and spawns a bounded number of worker
    /// tasks to process them, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim_next() {
                Some(change) => {
                    let this = Arc::clone(&self);
                    let permit = Arc::clone(&self.semaphore);
                    in_flight.spawn(async move {
                        let _permit = permit.acquire_owned().await.expect("semaphore closed");
                        this.process(change).await;
                    });
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        Some(result) = in_flight.join_next() => log_worker_panic(result),
                    }
                }
            }

            while let Some(result) = in_flight.try_join_next() {
                log_worker_panic(result);
            }
        }

        info!("uploader pool draining in-flight work before shutdown");
        while let Some(result) = in_flight.join_next().await {
            log_worker_panic(result);
        }
    }

    async fn process(&self, change: PendingChange) {
        let relative_path = change.relative_path.clone();
        let result = match change.kind {
            ChangeKind::Upsert => self.process_upsert(&relative_path).await,
            ChangeKind::Delete => self.process_delete(&relative_path).await,
        };

        if let Err(e) = result {
            warn!(path = %relative_path, error = %e, "upload attempt did not complete");
        }
        // Releasing (not completing) the claim re-enqueues any change that
        // arrived for this path while it was in flight, so a modification
        // during upload gets picked up immediately rather than waiting for
        // the next reconciler tick.
        self.queue.release_claim(&relative_path);
    }

    pub async fn process_upsert(&self, relative_path: &RelativePath) -> crate::error::Result<()> {
        let absolute_path = self.filter.root().join(relative_path.to_local_path());

        if !absolute_path.exists() {
            debug!(path = %relative_path, "file vanished before upload, treating as delete");
            return self.process_delete(relative_path).await;
        }

        // Re-read the record and current fingerprint right before
        // uploading: another worker or the reconciler may have already
        // satisfied this change while it sat in the queue.
        let fresh_fingerprint = hash_file(&absolute_path).await?;
        if let Some(existing) = self.state.get(relative_path).await {
            if existing.can_skip_rehash() && existing.content_fingerprint == fresh_fingerprint {
                debug!(path = %relative_path, "fingerprint unchanged since record was marked uploaded, skipping");
                return Ok(());
            }
        }

        let mut record = record_for(relative_path, &absolute_path).await?;
        record.last_upload_attempt = Some(self.clock.now());

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            record.attempt_count = attempt;

            match self.client.put_file(relative_path, &absolute_path).await {
                Ok(()) => {
                    record.upload_state = UploadState::Uploaded;
                    record.last_upload_success = Some(self.clock.now());
                    record.last_error = None;
                    record.attempt_count = 0;
                    self.state.put(record).await;
                    self.state.flush().await?;
                    info!(path = %relative_path, attempt, "upload succeeded");
                    return Ok(());
                }
                Err(UploadError::Unauthorized(msg)) => {
                    self.warn_unauthorized(relative_path, &msg);
                    record.upload_state = UploadState::Failed;
                    record.last_error = Some(msg);
                    self.state.put(record).await;
                    self.state.flush().await?;
                    return Ok(());
                }
                Err(UploadError::Permanent(msg)) => {
                    error!(path = %relative_path, error = %msg, "upload rejected permanently, not retrying");
                    record.upload_state = UploadState::Failed;
                    record.last_error = Some(msg);
                    self.state.put(record).await;
                    self.state.flush().await?;
                    return Ok(());
                }
                Err(UploadError::Transient(msg)) => {
                    record.upload_state = UploadState::Failed;
                    record.last_error = Some(msg.clone());
                    self.state.put(record.clone()).await;

                    let backoff = backoff_for_attempt(attempt);
                    warn!(
                        path = %relative_path,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %msg,
                        "transient upload failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    pub async fn process_delete(&self, relative_path: &RelativePath) -> crate::error::Result<()> {
        if self.delete_propagation {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.client.delete_file(relative_path).await {
                    Ok(()) => break,
                    Err(UploadError::Unauthorized(msg)) => {
                        self.warn_unauthorized(relative_path, &msg);
                        break;
                    }
                    Err(UploadError::Permanent(msg)) => {
                        error!(path = %relative_path, error = %msg, "delete rejected permanently, not retrying");
                        break;
                    }
                    Err(UploadError::Transient(msg)) if attempt < 8 => {
                        let backoff = backoff_for_attempt(attempt);
                        warn!(path = %relative_path, error = %msg, "transient delete failure, backing off");
                        tokio::time::sleep(backoff).await;
                    }
                    Err(UploadError::Transient(msg)) => {
                        warn!(path = %relative_path, error = %msg, "giving up on delete propagation for now");
                        break;
                    }
                }
            }
        }
        self.state.delete(relative_path).await;
        self.state.flush().await?;
        Ok(())
    }

    fn warn_unauthorized(&self, relative_path: &RelativePath, msg: &str) {
        let now = self.clock.now().timestamp() as u64;
        let last = self.last_auth_warning_secs.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= AUTH_WARNING_INTERVAL.as_secs() {
            self.last_auth_warning_secs.store(now, Ordering::Relaxed);
            error!(path = %relative_path, error = %msg, "authentication rejected; check api_key");
        }
    }
}

/// A worker task never returns an error itself (`process` swallows and
/// logs everything it sees), so the only way `join_next` yields an `Err`
/// here is a panic inside the task. Demote it to a logged error rather
/// than letting it propagate and take the pool down with it.
fn log_worker_panic(result: Result<(), tokio::task::JoinError>) {
    if let Err(join_error) = result {
        if join_error.is_panic() {
            error!(error = %join_error, "uploader worker task panicked, pool continues");
        }
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let exp = INITIAL_BACKOFF.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let capped = std::cmp::min(exp, MAX_BACKOFF);
    let jitter_frac = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(capped.as_secs_f64() * jitter_frac)
}

#[derive(Default)]
pub struct FakeUploadClient {
    pub fail_puts: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl UploadClient for FakeUploadClient {
    async fn put_file(
        &self,
        _relative_path: &RelativePath,
        _absolute_path: &std::path::Path,
    ) -> Result<(), UploadError> {
        if self.fail_puts.load(Ordering::Relaxed) > 0 {
            self.fail_puts.fetch_sub(1, Ordering::Relaxed);
            return Err(UploadError::Transient("synthetic failure".into()));
        }
        Ok(())
    }

    async fn delete_file(&self, _relative_path: &RelativePath) -> Result<(), UploadError> {
        Ok(())
    }
}
