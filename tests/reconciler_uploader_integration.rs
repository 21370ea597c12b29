//! End-to-end tests wiring the reconciler and uploader pool together
//! against a mock HTTP server, covering the scenarios the lifecycle is
//! expected to handle without a live upload endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use tm_isync_adapter::path_filter::{Filter, RelativePath};
use tm_isync_adapter::queue::ChangeQueue;
use tm_isync_adapter::reconciler::Reconciler;
use tm_isync_adapter::state_store::{StateStore, UploadState};
use tm_isync_adapter::uploader::{FakeUploadClient, UploadClient, UploaderPool};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rp(s: &str) -> RelativePath {
    RelativePath::new(&PathBuf::from(s)).unwrap()
}

#[tokio::test]
async fn fresh_tree_is_fully_uploaded_on_first_pass() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("brief.pdf"), b"case content").await.unwrap();
    tokio::fs::write(dir.path().join(".DS_Store"), b"ignore me").await.unwrap();

    let filter = Arc::new(Filter::new(dir.path().to_path_buf(), &[]));
    let queue = Arc::new(ChangeQueue::default());
    let state = StateStore::open(dir.path().join("state.json")).await.unwrap();
    let client: Arc<dyn UploadClient> = Arc::new(FakeUploadClient::default());

    let reconciler = Reconciler::new(Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state));
    reconciler.run_once().await.unwrap();

    let uploader = UploaderPool::new(client, filter, Arc::clone(&queue), Arc::clone(&state), 2, false);
    while let Some(change) = queue.claim_next() {
        uploader.process_upsert(&change.relative_path).await.unwrap();
        queue.complete_claim(&change.relative_path);
    }

    let record = state.get(&rp("brief.pdf")).await.unwrap();
    assert_eq!(record.upload_state, UploadState::Uploaded);
    assert!(state.get(&rp(".DS_Store")).await.is_none());
}

#[tokio::test]
async fn second_pass_over_unchanged_tree_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), b"unchanged").await.unwrap();

    let filter = Arc::new(Filter::new(dir.path().to_path_buf(), &[]));
    let queue = Arc::new(ChangeQueue::default());
    let state = StateStore::open(dir.path().join("state.json")).await.unwrap();
    let client: Arc<dyn UploadClient> = Arc::new(FakeUploadClient::default());
    let uploader = UploaderPool::new(client, Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state), 2, false);

    let reconciler = Reconciler::new(Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state));
    reconciler.run_once().await.unwrap();
    while let Some(change) = queue.claim_next() {
        uploader.process_upsert(&change.relative_path).await.unwrap();
        queue.complete_claim(&change.relative_path);
    }

    reconciler.run_once().await.unwrap();
    assert_eq!(queue.depth(), 0, "unchanged file must not be re-queued");
}

#[tokio::test]
async fn content_change_triggers_reupload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    tokio::fs::write(&path, b"version one").await.unwrap();

    let filter = Arc::new(Filter::new(dir.path().to_path_buf(), &[]));
    let queue = Arc::new(ChangeQueue::default());
    let state = StateStore::open(dir.path().join("state.json")).await.unwrap();
    let client: Arc<dyn UploadClient> = Arc::new(FakeUploadClient::default());
    let uploader = UploaderPool::new(client, Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state), 2, false);

    let reconciler = Reconciler::new(Arc::clone(&filter), Arc::clone(&queue), Arc::clone(&state));
    reconciler.run_once().await.unwrap();
    while let Some(change) = queue.claim_next() {
        uploader.process_upsert(&change.relative_path).await.unwrap();
        queue.complete_claim(&change.relative_path);
    }

    tokio::fs::write(&path, b"version two, much longer than before").await.unwrap();
    reconciler.run_once().await.unwrap();
    assert_eq!(queue.depth(), 1, "content change must be re-queued");
}

#[tokio::test]
async fn deleted_file_is_propagated_to_mock_server_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let filter = Arc::new(Filter::new(dir.path().to_path_buf(), &[]));
    let queue = Arc::new(ChangeQueue::default());
    let state = StateStore::open(dir.path().join("state.json")).await.unwrap();

    let config = tm_isync_adapter::config::Config {
        schema_version: 1,
        parent_folder: "CASES".into(),
        api_endpoint: url::Url::parse(&format!("{}/upload", server.uri())).unwrap(),
        api_key: "token".into(),
        sync_interval_seconds: 30,
        log_level: tm_isync_adapter::config::LogLevel::Info,
        file_extensions: vec![],
        max_concurrent_uploads: 2,
        upload_timeout_seconds: 30,
        delete_propagation: true,
    };
    let client: Arc<dyn UploadClient> =
        Arc::new(tm_isync_adapter::uploader::ReqwestClient::new(&config).unwrap());
    let uploader = UploaderPool::new(client, filter, Arc::clone(&queue), Arc::clone(&state), 2, true);

    state
        .put(tm_isync_adapter::state_store::FileRecord::fresh(
            &rp("gone.txt"),
            1,
            0,
            tm_isync_adapter::fingerprint::hash_bytes(b"x"),
        ))
        .await;

    uploader.process_delete(&rp("gone.txt")).await.unwrap();
    assert!(state.get(&rp("gone.txt")).await.is_none());
}

#[tokio::test]
async fn permanent_auth_failure_marks_record_failed_without_retry_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), b"content").await.unwrap();
    let filter = Arc::new(Filter::new(dir.path().to_path_buf(), &[]));
    let queue = Arc::new(ChangeQueue::default());
    let state = StateStore::open(dir.path().join("state.json")).await.unwrap();

    let config = tm_isync_adapter::config::Config {
        schema_version: 1,
        parent_folder: "CASES".into(),
        api_endpoint: url::Url::parse(&format!("{}/upload", server.uri())).unwrap(),
        api_key: "bad-token".into(),
        sync_interval_seconds: 30,
        log_level: tm_isync_adapter::config::LogLevel::Info,
        file_extensions: vec![],
        max_concurrent_uploads: 2,
        upload_timeout_seconds: 30,
        delete_propagation: false,
    };
    let client: Arc<dyn UploadClient> =
        Arc::new(tm_isync_adapter::uploader::ReqwestClient::new(&config).unwrap());
    let uploader = UploaderPool::new(client, filter, queue, Arc::clone(&state), 2, false);

    uploader.process_upsert(&rp("notes.txt")).await.unwrap();

    let record = state.get(&rp("notes.txt")).await.unwrap();
    assert_eq!(record.upload_state, UploadState::Failed);
}
