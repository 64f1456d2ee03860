//! Media download pipeline. One asset per provider media id moves through
//! `pending → downloading → downloaded | failed`; the transfer itself is a
//! collaborator behind [`MediaTransfer`] so the environment picks local disk
//! or object storage.

use crate::config::{MediaConfig, StorageConfig};
use crate::db::{self, DbKind, MediaStatus};
use crate::error::{truncate_error, PipelineError};
use crate::outbox::RetryPolicy;
use crate::transcode;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use sqlx::AnyPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferLocation {
    LocalPath(PathBuf),
    ObjectKey { bucket: String, key: String },
}

impl TransferLocation {
    pub fn storage_url(&self) -> String {
        match self {
            Self::LocalPath(path) => format!("file://{}", path.display()),
            Self::ObjectKey { bucket, key } => format!("s3://{bucket}/{key}"),
        }
    }
}

/// Result contract of the external transfer collaborator.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub location: TransferLocation,
    pub bytes: i64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

#[async_trait]
pub trait MediaTransfer: Send + Sync {
    async fn fetch(&self, provider_media_id: &str) -> Result<DownloadResult, PipelineError>;
}

fn extension_for_mime(mime: &str) -> &'static str {
    let base = mime.split(';').next().unwrap_or(mime).trim();
    match base {
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/aac" => "aac",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "bin",
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn fetch_provider_bytes(
    http: &Client,
    base_url: &str,
    api_token: Option<&str>,
    provider_media_id: &str,
) -> Result<(Vec<u8>, Option<String>), PipelineError> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), provider_media_id);
    let mut req = http.get(&url);
    if let Some(token) = api_token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::Transient(format!(
            "media fetch failed for {provider_media_id}: {status} {body}"
        )));
    }
    let mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = resp.bytes().await?;
    Ok((bytes.to_vec(), mime))
}

/// Non-production transfer: fetch from the provider endpoint and write the
/// bytes under a local directory, content-addressed bookkeeping included.
pub struct HttpDiskTransfer {
    http: Client,
    base_url: String,
    api_token: Option<String>,
    storage_dir: PathBuf,
}

impl HttpDiskTransfer {
    pub fn new(http: Client, media: &MediaConfig, storage_dir: PathBuf) -> Self {
        Self {
            http,
            base_url: media.base_url.clone(),
            api_token: media.api_token.clone(),
            storage_dir,
        }
    }
}

#[async_trait]
impl MediaTransfer for HttpDiskTransfer {
    async fn fetch(&self, provider_media_id: &str) -> Result<DownloadResult, PipelineError> {
        let (bytes, mime) = fetch_provider_bytes(
            &self.http,
            &self.base_url,
            self.api_token.as_deref(),
            provider_media_id,
        )
        .await?;

        let ext = mime.as_deref().map(extension_for_mime).unwrap_or("bin");
        let filename = format!("{provider_media_id}.{ext}");
        let path = self.storage_dir.join(&filename);

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|err| PipelineError::Transient(format!("create storage dir: {err}")))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| PipelineError::Transient(format!("write media file: {err}")))?;

        Ok(DownloadResult {
            location: TransferLocation::LocalPath(path),
            bytes: bytes.len() as i64,
            sha256: sha256_hex(&bytes),
            mime_type: mime,
            filename: Some(filename),
        })
    }
}

/// Production transfer: fetch from the provider endpoint and hand the bytes
/// to the upload collaborator, which stores them in the object store and
/// returns the key.
pub struct ObjectStoreTransfer {
    http: Client,
    media_base_url: String,
    media_token: Option<String>,
    upload_url: String,
    bucket: String,
}

impl ObjectStoreTransfer {
    pub fn new(
        http: Client,
        media: &MediaConfig,
        storage: &StorageConfig,
    ) -> Result<Self, PipelineError> {
        let upload_url = storage.upload_url.clone().ok_or_else(|| {
            PipelineError::Validation("storage.upload_url required for s3 mode".to_string())
        })?;
        let bucket = storage.bucket.clone().ok_or_else(|| {
            PipelineError::Validation("storage.bucket required for s3 mode".to_string())
        })?;
        Ok(Self {
            http,
            media_base_url: media.base_url.clone(),
            media_token: media.api_token.clone(),
            upload_url,
            bucket,
        })
    }
}

#[async_trait]
impl MediaTransfer for ObjectStoreTransfer {
    async fn fetch(&self, provider_media_id: &str) -> Result<DownloadResult, PipelineError> {
        let (bytes, mime) = fetch_provider_bytes(
            &self.http,
            &self.media_base_url,
            self.media_token.as_deref(),
            provider_media_id,
        )
        .await?;

        let sha256 = sha256_hex(&bytes);
        let byte_count = bytes.len() as i64;
        let ext = mime.as_deref().map(extension_for_mime).unwrap_or("bin");
        let filename = format!("{provider_media_id}.{ext}");

        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.clone());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("provider_media_id", provider_media_id.to_string())
            .text("sha256", sha256.clone());

        let resp = self.http.post(&self.upload_url).multipart(form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Transient(format!(
                "media upload failed for {provider_media_id}: {status} {body}"
            )));
        }

        let value = resp.json::<serde_json::Value>().await?;
        let key = value
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::Transient("upload response carries no object key".to_string())
            })?
            .to_string();
        let bucket = value
            .get("bucket")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.bucket)
            .to_string();

        Ok(DownloadResult {
            location: TransferLocation::ObjectKey { bucket, key },
            bytes: byte_count,
            sha256,
            mime_type: mime,
            filename: Some(filename),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    AlreadyDownloaded,
    InFlight,
}

/// One download attempt for a media asset.
///
/// Already-downloaded assets are a no-op without a transfer call. Failures
/// are recorded on the asset (bounded error, retry bookkeeping) before the
/// original error propagates; that bookkeeping is best-effort and never masks
/// the transfer failure.
pub async fn download_media(
    pool: &AnyPool,
    kind: DbKind,
    transfer: &dyn MediaTransfer,
    policy: &RetryPolicy,
    media_asset_id: &str,
) -> Result<DownloadOutcome, PipelineError> {
    let asset = db::get_media_asset(pool, kind, media_asset_id)
        .await?
        .ok_or_else(|| PipelineError::not_found("media_asset", media_asset_id))?;

    if asset.status == MediaStatus::Downloaded {
        return Ok(DownloadOutcome::AlreadyDownloaded);
    }

    if !db::claim_media_download(pool, kind, media_asset_id, Utc::now()).await? {
        return Ok(DownloadOutcome::InFlight);
    }

    match transfer.fetch(&asset.provider_media_id).await {
        Ok(result) => {
            // A unique-hash conflict (two provider ids, identical bytes)
            // surfaces here, so this write gets the same failure bookkeeping
            // as the transfer itself.
            if let Err(err) = db::mark_media_downloaded(
                pool,
                kind,
                media_asset_id,
                &result.sha256,
                result.bytes,
                &result.location.storage_url(),
                result.mime_type.as_deref(),
                Utc::now(),
            )
            .await
            {
                let retry = record_download_failure(
                    pool,
                    kind,
                    media_asset_id,
                    asset.retry_count,
                    policy,
                    &err,
                )
                .await;
                error!(
                    media_asset_id = %media_asset_id,
                    provider_media_id = %asset.provider_media_id,
                    sha256 = %result.sha256,
                    error_class = err.class(),
                    error = %err,
                    retry_count = retry,
                    "media bookkeeping failed after transfer"
                );
                return Err(err);
            }
            info!(
                media_asset_id = %media_asset_id,
                provider_media_id = %asset.provider_media_id,
                sha256 = %result.sha256,
                bytes = result.bytes,
                "media downloaded"
            );
            if asset.voice {
                if let TransferLocation::LocalPath(path) = &result.location {
                    match transcode::transcode_to_pcm(path).await {
                        Ok(output) => {
                            info!(
                                media_asset_id = %media_asset_id,
                                output = %output.display(),
                                "voice note transcoded"
                            );
                        }
                        Err(err) => {
                            warn!(
                                media_asset_id = %media_asset_id,
                                input = %path.display(),
                                error = %err,
                                "voice transcode failed"
                            );
                        }
                    }
                }
            }
            Ok(DownloadOutcome::Completed)
        }
        Err(err) => {
            let retry = record_download_failure(
                pool,
                kind,
                media_asset_id,
                asset.retry_count,
                policy,
                &err,
            )
            .await;
            error!(
                media_asset_id = %media_asset_id,
                provider_media_id = %asset.provider_media_id,
                error_class = err.class(),
                error = %err,
                retry_count = retry,
                "media download failed"
            );
            Err(err)
        }
    }
}

/// Best-effort retry bookkeeping for a failed attempt; never masks the
/// attempt's own error. Returns the new retry count.
async fn record_download_failure(
    pool: &AnyPool,
    kind: DbKind,
    media_asset_id: &str,
    prior_retries: i32,
    policy: &RetryPolicy,
    err: &PipelineError,
) -> i32 {
    let retry = prior_retries + 1;
    let next = Utc::now() + policy.backoff(retry);
    if let Err(mark_err) = db::mark_media_failed(
        pool,
        kind,
        media_asset_id,
        retry,
        next,
        &truncate_error(&err.to_string()),
    )
    .await
    {
        warn!(
            media_asset_id = %media_asset_id,
            error = %mark_err,
            "failed to record media download failure"
        );
    }
    retry
}

/// Durable download queue: the worker polls claimable assets and runs one
/// attempt each; per-attempt failures are already recorded on the asset.
pub async fn start_download_worker(
    pool: AnyPool,
    kind: DbKind,
    transfer: Arc<dyn MediaTransfer>,
    media: MediaConfig,
) {
    let policy = RetryPolicy {
        max_attempts: media.max_retries,
        ..RetryPolicy::default()
    };
    loop {
        let now = Utc::now();

        let cutoff = now - Duration::seconds(media.stale_after_seconds);
        match db::reclaim_stale_downloads(&pool, kind, cutoff).await {
            Ok(0) => {}
            Ok(n) => warn!(reclaimed = n, "reclaimed stale media downloads"),
            Err(err) => warn!(error = %err, "stale download reclaim failed"),
        }

        match db::list_claimable_media(&pool, kind, now, policy.max_attempts, 25).await {
            Ok(batch) => {
                for asset in batch {
                    let _ = download_media(&pool, kind, transfer.as_ref(), &policy, &asset.id).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "download queue poll failed");
            }
        }
        sleep(std::time::Duration::from_secs(media.poll_seconds)).await;
    }
}
