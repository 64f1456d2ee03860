use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use uuid::Uuid;
use voxrelay::config::MediaConfig;
use voxrelay::db::{self, DbKind, MediaAssetRecord, MediaStatus};
use voxrelay::error::{PipelineError, MAX_STORED_ERROR_LEN};
use voxrelay::media::{
    download_media, DownloadOutcome, DownloadResult, HttpDiskTransfer, MediaTransfer,
    TransferLocation,
};
use voxrelay::outbox::RetryPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static DRIVERS: Once = Once::new();

async fn setup_pool() -> AnyPool {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    db::init_db(&pool, DbKind::Sqlite).await.expect("init schema");
    pool
}

fn pending_asset(provider_media_id: &str) -> MediaAssetRecord {
    let now = chrono::Utc::now();
    MediaAssetRecord {
        id: Uuid::new_v4().to_string(),
        provider_media_id: provider_media_id.to_string(),
        sha256: None,
        mime_type: Some("audio/ogg".to_string()),
        byte_size: None,
        storage_url: None,
        voice: true,
        status: MediaStatus::Pending,
        retry_count: 0,
        next_attempt_at: now,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

enum MockOutcome {
    Success(DownloadResult),
    Failure(String),
}

struct MockTransfer {
    calls: AtomicUsize,
    outcome: MockOutcome,
}

impl MockTransfer {
    fn succeeding(result: DownloadResult) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: MockOutcome::Success(result),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: MockOutcome::Failure(message.to_string()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransfer for MockTransfer {
    async fn fetch(&self, _provider_media_id: &str) -> Result<DownloadResult, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            MockOutcome::Success(result) => Ok(result.clone()),
            MockOutcome::Failure(message) => Err(PipelineError::Transient(message.clone())),
        }
    }
}

fn local_result() -> DownloadResult {
    DownloadResult {
        location: TransferLocation::LocalPath(PathBuf::from("/tmp/x.ogg")),
        bytes: 1024,
        sha256: "abc123".to_string(),
        mime_type: Some("audio/ogg".to_string()),
        filename: Some("x.ogg".to_string()),
    }
}

#[tokio::test]
async fn test_successful_download_updates_asset() {
    let pool = setup_pool().await;
    let asset = pending_asset("media.777");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    let transfer = MockTransfer::succeeding(local_result());
    let policy = RetryPolicy::default();
    let outcome = download_media(&pool, DbKind::Sqlite, &transfer, &policy, &asset.id)
        .await
        .expect("download");
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(transfer.calls(), 1);

    let stored = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MediaStatus::Downloaded);
    assert_eq!(stored.storage_url.as_deref(), Some("file:///tmp/x.ogg"));
    assert_eq!(stored.byte_size, Some(1024));
    assert_eq!(stored.sha256.as_deref(), Some("abc123"));
    assert_eq!(stored.mime_type.as_deref(), Some("audio/ogg"));
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_downloaded_asset_is_a_no_op() {
    let pool = setup_pool().await;
    let asset = pending_asset("media.noop");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    let transfer = MockTransfer::succeeding(local_result());
    let policy = RetryPolicy::default();
    download_media(&pool, DbKind::Sqlite, &transfer, &policy, &asset.id)
        .await
        .unwrap();
    let before = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = download_media(&pool, DbKind::Sqlite, &transfer, &policy, &asset.id)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::AlreadyDownloaded);
    assert_eq!(transfer.calls(), 1, "no second transfer call");

    let after = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, MediaStatus::Downloaded);
    assert_eq!(after.sha256, before.sha256);
    assert_eq!(after.storage_url, before.storage_url);
    assert_eq!(after.byte_size, before.byte_size);
}

#[tokio::test]
async fn test_transfer_failure_marks_failed_and_propagates() {
    let pool = setup_pool().await;
    let asset = pending_asset("media.fail");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    let long_error = "E".repeat(MAX_STORED_ERROR_LEN + 500);
    let transfer = MockTransfer::failing(&long_error);
    let policy = RetryPolicy::default();

    let err = download_media(&pool, DbKind::Sqlite, &transfer, &policy, &asset.id)
        .await
        .expect_err("transfer failure must propagate");
    assert!(matches!(err, PipelineError::Transient(_)));

    let stored = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MediaStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    let stored_error = stored.last_error.expect("error recorded");
    assert!(stored_error.len() <= MAX_STORED_ERROR_LEN);
}

#[tokio::test]
async fn test_failed_asset_is_retryable() {
    let pool = setup_pool().await;
    let asset = pending_asset("media.retry");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    let policy = RetryPolicy::default();
    let failing = MockTransfer::failing("network down");
    let _ = download_media(&pool, DbKind::Sqlite, &failing, &policy, &asset.id).await;

    let succeeding = MockTransfer::succeeding(local_result());
    let outcome = download_media(&pool, DbKind::Sqlite, &succeeding, &policy, &asset.id)
        .await
        .expect("retry succeeds");
    assert_eq!(outcome, DownloadOutcome::Completed);

    let stored = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MediaStatus::Downloaded);
    assert!(stored.last_error.is_none(), "error cleared on success");
}

#[tokio::test]
async fn test_unknown_asset_is_not_found() {
    let pool = setup_pool().await;
    let transfer = MockTransfer::succeeding(local_result());
    let policy = RetryPolicy::default();

    let err = download_media(&pool, DbKind::Sqlite, &transfer, &policy, "missing-id")
        .await
        .expect_err("unknown id");
    assert!(matches!(err, PipelineError::NotFound { .. }));
    assert_eq!(transfer.calls(), 0);
}

#[tokio::test]
async fn test_duplicate_content_hash_records_failure() {
    let pool = setup_pool().await;
    let first = pending_asset("media.dup1");
    let second = pending_asset("media.dup2");
    db::insert_media_asset(&pool, DbKind::Sqlite, &first)
        .await
        .unwrap();
    db::insert_media_asset(&pool, DbKind::Sqlite, &second)
        .await
        .unwrap();

    let policy = RetryPolicy::default();
    let transfer = MockTransfer::succeeding(DownloadResult {
        location: TransferLocation::LocalPath(PathBuf::from("/tmp/a.ogg")),
        bytes: 512,
        sha256: "samehash".to_string(),
        mime_type: Some("audio/ogg".to_string()),
        filename: Some("a.ogg".to_string()),
    });
    download_media(&pool, DbKind::Sqlite, &transfer, &policy, &first.id)
        .await
        .expect("first download");

    // The same bytes behind a second provider id trip the content-hash
    // uniqueness constraint; the failure must land on the asset row.
    let dup = MockTransfer::succeeding(DownloadResult {
        location: TransferLocation::LocalPath(PathBuf::from("/tmp/b.ogg")),
        bytes: 512,
        sha256: "samehash".to_string(),
        mime_type: Some("audio/ogg".to_string()),
        filename: Some("b.ogg".to_string()),
    });
    let err = download_media(&pool, DbKind::Sqlite, &dup, &policy, &second.id)
        .await
        .expect_err("duplicate hash must fail");
    assert!(matches!(err, PipelineError::Transient(_)));

    let stored = db::get_media_asset(&pool, DbKind::Sqlite, &second.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MediaStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.is_some(), "failure recorded on the asset");
}

#[tokio::test]
async fn test_stale_downloading_asset_is_reclaimed() {
    let pool = setup_pool().await;
    let asset = pending_asset("media.stuck");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    // Claim with a timestamp well in the past to simulate a dead worker.
    let stale = chrono::Utc::now() - chrono::Duration::seconds(600);
    assert!(db::claim_media_download(&pool, DbKind::Sqlite, &asset.id, stale)
        .await
        .unwrap());
    let claimable = db::list_claimable_media(&pool, DbKind::Sqlite, chrono::Utc::now(), 5, 10)
        .await
        .unwrap();
    assert!(claimable.is_empty(), "downloading assets are invisible");

    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(300);
    let reclaimed = db::reclaim_stale_downloads(&pool, DbKind::Sqlite, cutoff)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let stored = db::get_media_asset(&pool, DbKind::Sqlite, &asset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, MediaStatus::Pending);
    let claimable = db::list_claimable_media(&pool, DbKind::Sqlite, chrono::Utc::now(), 5, 10)
        .await
        .unwrap();
    assert_eq!(claimable.len(), 1);
}

// Minimal valid 8 kHz mono 16-bit WAV.
fn wav_fixture() -> Vec<u8> {
    let samples = [0_i16; 16];
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16_u32.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&8000_u32.to_le_bytes());
    out.extend_from_slice(&16000_u32.to_le_bytes());
    out.extend_from_slice(&2_u16.to_le_bytes());
    out.extend_from_slice(&16_u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[tokio::test]
async fn test_download_transcodes_local_voice_note() {
    // Requires ffmpeg on PATH; skip quietly where it is absent.
    if std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .is_err()
    {
        return;
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/media.wavnote"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(wav_fixture())
                .insert_header("content-type", "audio/wav"),
        )
        .mount(&server)
        .await;

    let pool = setup_pool().await;
    let asset = pending_asset("media.wavnote");
    db::insert_media_asset(&pool, DbKind::Sqlite, &asset)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let media = MediaConfig {
        base_url: format!("{}/media", server.uri()),
        api_token: None,
        poll_seconds: 1,
        max_retries: 5,
        stale_after_seconds: 300,
    };
    let transfer =
        HttpDiskTransfer::new(reqwest::Client::new(), &media, dir.path().to_path_buf());
    let policy = RetryPolicy::default();

    let outcome = download_media(&pool, DbKind::Sqlite, &transfer, &policy, &asset.id)
        .await
        .expect("download");
    assert_eq!(outcome, DownloadOutcome::Completed);

    let original = dir.path().join("media.wavnote.wav");
    assert!(original.exists());
    let transcoded = dir.path().join("media.wavnote.pcm.wav");
    assert!(transcoded.exists(), "voice note transcoded after download");
}

#[tokio::test]
async fn test_http_disk_transfer_writes_and_hashes() {
    let server = MockServer::start().await;
    let body: &[u8] = b"opus-bytes";
    Mock::given(method("GET"))
        .and(path("/media/media.777"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body)
                .insert_header("content-type", "audio/ogg"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let media = MediaConfig {
        base_url: format!("{}/media", server.uri()),
        api_token: None,
        poll_seconds: 1,
        max_retries: 5,
        stale_after_seconds: 300,
    };
    let transfer =
        HttpDiskTransfer::new(reqwest::Client::new(), &media, dir.path().to_path_buf());

    let result = transfer.fetch("media.777").await.expect("fetch");
    assert_eq!(result.bytes, body.len() as i64);
    assert_eq!(result.mime_type.as_deref(), Some("audio/ogg"));

    let expected_sha = hex::encode(Sha256::digest(body));
    assert_eq!(result.sha256, expected_sha);

    match &result.location {
        TransferLocation::LocalPath(path) => {
            assert!(path.exists());
            assert_eq!(std::fs::read(path).unwrap(), body);
            assert!(path.to_string_lossy().ends_with("media.777.ogg"));
        }
        other => panic!("expected local path, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_disk_transfer_propagates_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/media.err"))
        .respond_with(ResponseTemplate::new(500).set_body_string("provider down"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let media = MediaConfig {
        base_url: format!("{}/media", server.uri()),
        api_token: None,
        poll_seconds: 1,
        max_retries: 5,
        stale_after_seconds: 300,
    };
    let transfer =
        HttpDiskTransfer::new(reqwest::Client::new(), &media, dir.path().to_path_buf());

    let err = transfer.fetch("media.err").await.expect_err("server error");
    assert!(matches!(err, PipelineError::Transient(_)));
    assert!(err.to_string().contains("media.err"));
}
