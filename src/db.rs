use crate::error::PipelineError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

/// Download lifecycle of a media asset. `Failed` is re-entrant: the download
/// worker may reclaim it until the retry cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

impl MediaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "downloaded" => Some(Self::Downloaded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Relay lifecycle of an outbox event. `Failed` stays claimable until
/// `retry_count` reaches the configured cap, after which it is terminal and
/// needs an operator requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub wa_message_id: String,
    pub direction: String,
    pub kind: String,
    pub wa_contact_id: String,
    pub contact_name: Option<String>,
    pub business_number_id: String,
    pub received_at: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
    pub has_media: bool,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAssetRecord {
    pub id: String,
    pub provider_media_id: String,
    pub sha256: Option<String>,
    pub mime_type: Option<String>,
    pub byte_size: Option<i64>,
    pub storage_url: Option<String>,
    pub voice: bool,
    pub status: MediaStatus,
    pub retry_count: i32,
    #[serde(skip)]
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaLinkRecord {
    pub id: String,
    pub message_id: String,
    pub media_asset_id: String,
    pub purpose: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    #[serde(skip)]
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<(), PipelineError> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS inbound_messages (
            id TEXT PRIMARY KEY,
            wa_message_id TEXT NOT NULL UNIQUE,
            direction TEXT NOT NULL,
            kind TEXT NOT NULL,
            wa_contact_id TEXT NOT NULL,
            contact_name TEXT,
            business_number_id TEXT NOT NULL,
            received_at INTEGER NOT NULL,
            raw_payload TEXT NOT NULL,
            has_media INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS media_assets (
            id TEXT PRIMARY KEY,
            provider_media_id TEXT NOT NULL UNIQUE,
            sha256 TEXT UNIQUE,
            mime_type TEXT,
            byte_size INTEGER,
            storage_url TEXT,
            voice INTEGER NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_media_status ON media_assets(status, next_attempt_at)"#,
        r#"CREATE TABLE IF NOT EXISTS message_media_links (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            media_asset_id TEXT NOT NULL,
            purpose TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(message_id, purpose)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS outbox_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            claimed_at INTEGER,
            processed_at INTEGER,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_events(status, next_attempt_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

fn row_to_message(row: &sqlx::any::AnyRow) -> Result<MessageRecord, PipelineError> {
    let raw_payload: String = row.try_get("raw_payload")?;
    let received_at: i64 = row.try_get("received_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let has_media: i64 = row.try_get("has_media")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        wa_message_id: row.try_get("wa_message_id")?,
        direction: row.try_get("direction")?,
        kind: row.try_get("kind")?,
        wa_contact_id: row.try_get("wa_contact_id")?,
        contact_name: row.try_get("contact_name")?,
        business_number_id: row.try_get("business_number_id")?,
        received_at: i64_to_datetime(received_at),
        raw_payload: serde_json::from_str(&raw_payload)
            .unwrap_or_else(|_| serde_json::json!({})),
        has_media: has_media != 0,
        created_at: i64_to_datetime(created_at),
    })
}

fn row_to_media_asset(row: &sqlx::any::AnyRow) -> Result<MediaAssetRecord, PipelineError> {
    let status: String = row.try_get("status")?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let voice: i64 = row.try_get("voice")?;
    Ok(MediaAssetRecord {
        id: row.try_get("id")?,
        provider_media_id: row.try_get("provider_media_id")?,
        sha256: row.try_get("sha256")?,
        mime_type: row.try_get("mime_type")?,
        byte_size: row.try_get("byte_size")?,
        storage_url: row.try_get("storage_url")?,
        voice: voice != 0,
        status: MediaStatus::parse(&status)
            .ok_or_else(|| PipelineError::Integrity(format!("unknown media status: {status}")))?,
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        next_attempt_at: i64_to_datetime(next_attempt_at),
        last_error: row.try_get("last_error")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn row_to_outbox(row: &sqlx::any::AnyRow) -> Result<OutboxRecord, PipelineError> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;
    let processed_at: Option<i64> = row.try_get("processed_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: serde_json::from_str(&payload).unwrap_or_else(|_| serde_json::json!({})),
        idempotency_key: row.try_get("idempotency_key")?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| PipelineError::Integrity(format!("unknown outbox status: {status}")))?,
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        next_attempt_at: i64_to_datetime(next_attempt_at),
        last_error: row.try_get("last_error")?,
        processed_at: processed_at.map(i64_to_datetime),
        claimed_at: claimed_at.map(i64_to_datetime),
        created_at: i64_to_datetime(created_at),
    })
}

const MESSAGE_COLUMNS: &str = "id, wa_message_id, direction, kind, wa_contact_id, contact_name, \
     business_number_id, received_at, raw_payload, has_media, created_at";

const MEDIA_COLUMNS: &str = "id, provider_media_id, sha256, mime_type, byte_size, storage_url, \
     voice, status, retry_count, next_attempt_at, last_error, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, event_type, payload, idempotency_key, status, retry_count, \
     next_attempt_at, last_error, claimed_at, processed_at, created_at";

// ---------------------------------------------------------------------------
// inbound_messages

pub async fn insert_inbound_message<'e, E>(
    ex: E,
    kind: DbKind,
    record: &MessageRecord,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO inbound_messages (
            id, wa_message_id, direction, kind, wa_contact_id, contact_name,
            business_number_id, received_at, raw_payload, has_media, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.wa_message_id)
        .bind(&record.direction)
        .bind(&record.kind)
        .bind(&record.wa_contact_id)
        .bind(record.contact_name.as_deref())
        .bind(&record.business_number_id)
        .bind(datetime_to_i64(record.received_at))
        .bind(record.raw_payload.to_string())
        .bind(record.has_media as i64)
        .bind(datetime_to_i64(record.created_at))
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn get_message_by_wa_id<'e, E>(
    ex: E,
    kind: DbKind,
    wa_message_id: &str,
) -> Result<Option<MessageRecord>, PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let query = format!("SELECT {MESSAGE_COLUMNS} FROM inbound_messages WHERE wa_message_id = ?");
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(wa_message_id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(row_to_message).transpose()
}

// ---------------------------------------------------------------------------
// media_assets

pub async fn insert_media_asset<'e, E>(
    ex: E,
    kind: DbKind,
    record: &MediaAssetRecord,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO media_assets (
            id, provider_media_id, sha256, mime_type, byte_size, storage_url,
            voice, status, retry_count, next_attempt_at, last_error, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.provider_media_id)
        .bind(record.sha256.as_deref())
        .bind(record.mime_type.as_deref())
        .bind(record.byte_size)
        .bind(record.storage_url.as_deref())
        .bind(record.voice as i64)
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(datetime_to_i64(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn get_media_asset(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<MediaAssetRecord>, PipelineError> {
    let query = format!("SELECT {MEDIA_COLUMNS} FROM media_assets WHERE id = ?");
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_media_asset).transpose()
}

pub async fn get_media_asset_by_provider_id<'e, E>(
    ex: E,
    kind: DbKind,
    provider_media_id: &str,
) -> Result<Option<MediaAssetRecord>, PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let query = format!("SELECT {MEDIA_COLUMNS} FROM media_assets WHERE provider_media_id = ?");
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(provider_media_id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(row_to_media_asset).transpose()
}

/// Re-arm the download queue entry for an asset that is not yet downloaded,
/// resetting its retry window. Called on webhook re-delivery and operator
/// requeue; downloaded assets are left untouched. Returns false when no
/// matching asset exists.
pub async fn requeue_media_download<'e, E>(
    ex: E,
    kind: DbKind,
    provider_media_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let sql = rewrite_sql(
        "UPDATE media_assets SET next_attempt_at = ?, retry_count = 0, updated_at = ? \
         WHERE provider_media_id = ? AND status != 'downloaded'",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .bind(provider_media_id)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Conditional claim: only moves `pending`/`failed` into `downloading`.
/// Returns false when another worker holds the asset or it is already done.
pub async fn claim_media_download(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, PipelineError> {
    let sql = rewrite_sql(
        "UPDATE media_assets SET status = 'downloading', updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'failed')",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Single atomic write for a successful download. The new mime type wins when
/// the transfer reported one; otherwise the webhook-time value stays.
pub async fn mark_media_downloaded(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    sha256: &str,
    byte_size: i64,
    storage_url: &str,
    mime_type: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let sql = rewrite_sql(
        "UPDATE media_assets SET status = 'downloaded', sha256 = ?, byte_size = ?, \
         storage_url = ?, mime_type = COALESCE(?, mime_type), last_error = NULL, \
         updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(sha256)
        .bind(byte_size)
        .bind(storage_url)
        .bind(mime_type)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_media_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), PipelineError> {
    let sql = rewrite_sql(
        "UPDATE media_assets SET status = 'failed', retry_count = ?, next_attempt_at = ?, \
         last_error = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count as i64)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_claimable_media(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    max_retries: i32,
    limit: i64,
) -> Result<Vec<MediaAssetRecord>, PipelineError> {
    let query = format!(
        "SELECT {MEDIA_COLUMNS} FROM media_assets \
         WHERE status IN ('pending', 'failed') AND next_attempt_at <= ? AND retry_count < ? \
         ORDER BY created_at ASC LIMIT ?"
    );
    let sql = rewrite_sql(&query, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(max_retries as i64)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_media_asset).collect()
}

/// Return assets stuck in `downloading` (dead worker) to the queue. The
/// claim stamps `updated_at`, so that is the staleness signal.
pub async fn reclaim_stale_downloads(
    pool: &AnyPool,
    kind: DbKind,
    cutoff: DateTime<Utc>,
) -> Result<u64, PipelineError> {
    let sql = rewrite_sql(
        "UPDATE media_assets SET status = 'pending', updated_at = ? \
         WHERE status = 'downloading' AND updated_at < ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(datetime_to_i64(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// message_media_links

/// Insert the message↔media association. The (message_id, purpose) unique
/// constraint makes webhook re-delivery a no-op.
pub async fn insert_media_link<'e, E>(
    ex: E,
    kind: DbKind,
    record: &MediaLinkRecord,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO message_media_links (id, message_id, media_asset_id, purpose, created_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(message_id, purpose) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.message_id)
        .bind(&record.media_asset_id)
        .bind(&record.purpose)
        .bind(datetime_to_i64(record.created_at))
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn get_media_link(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
    purpose: &str,
) -> Result<Option<MediaLinkRecord>, PipelineError> {
    let sql = rewrite_sql(
        "SELECT id, message_id, media_asset_id, purpose, created_at \
         FROM message_media_links WHERE message_id = ? AND purpose = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(message_id)
        .bind(purpose)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = row {
        let created_at: i64 = row.try_get("created_at")?;
        return Ok(Some(MediaLinkRecord {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            media_asset_id: row.try_get("media_asset_id")?,
            purpose: row.try_get("purpose")?,
            created_at: i64_to_datetime(created_at),
        }));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// outbox_events

/// Insert an event unless its idempotency key already exists. Returns false
/// when a logically identical event was recorded earlier.
pub async fn insert_outbox_event<'e, E>(
    ex: E,
    kind: DbKind,
    record: &OutboxRecord,
) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let sql = rewrite_sql(
        r#"INSERT INTO outbox_events (
            id, event_type, payload, idempotency_key, status, retry_count,
            next_attempt_at, last_error, claimed_at, processed_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(idempotency_key) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.event_type)
        .bind(record.payload.to_string())
        .bind(&record.idempotency_key)
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(datetime_to_i64(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .bind(record.claimed_at.map(datetime_to_i64))
        .bind(record.processed_at.map(datetime_to_i64))
        .bind(datetime_to_i64(record.created_at))
        .execute(ex)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_outbox_event(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<OutboxRecord>, PipelineError> {
    let query = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = ?");
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_outbox).transpose()
}

/// Conditional claim: only one claimant can move an event from
/// `pending`/`failed` into `processing`, and never past the retry cap.
pub async fn claim_outbox_event(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
    max_retries: i32,
) -> Result<bool, PipelineError> {
    let sql = rewrite_sql(
        "UPDATE outbox_events SET status = 'processing', claimed_at = ? \
         WHERE id = ? AND status IN ('pending', 'failed') AND retry_count < ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .bind(max_retries as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_outbox_processed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    let sql = rewrite_sql(
        "UPDATE outbox_events SET status = 'processed', last_error = NULL, \
         processed_at = ?, claimed_at = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_outbox_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), PipelineError> {
    let sql = rewrite_sql(
        "UPDATE outbox_events SET status = 'failed', retry_count = ?, next_attempt_at = ?, \
         last_error = ?, claimed_at = NULL WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count as i64)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_claimable_outbox(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    max_retries: i32,
    limit: i64,
) -> Result<Vec<OutboxRecord>, PipelineError> {
    let query = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
         WHERE status IN ('pending', 'failed') AND next_attempt_at <= ? AND retry_count < ? \
         ORDER BY created_at ASC LIMIT ?"
    );
    let sql = rewrite_sql(&query, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(max_retries as i64)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_outbox).collect()
}

pub async fn list_failed_outbox(
    pool: &AnyPool,
    kind: DbKind,
    limit: i64,
) -> Result<Vec<OutboxRecord>, PipelineError> {
    let query = format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
         WHERE status = 'failed' ORDER BY created_at ASC LIMIT ?"
    );
    let sql = rewrite_sql(&query, kind);
    let rows = sqlx::query(sql.as_ref()).bind(limit).fetch_all(pool).await?;
    rows.iter().map(row_to_outbox).collect()
}

/// Return events stuck in `processing` (dead worker) to the queue.
pub async fn reclaim_stale_processing(
    pool: &AnyPool,
    kind: DbKind,
    cutoff: DateTime<Utc>,
) -> Result<u64, PipelineError> {
    let sql = rewrite_sql(
        "UPDATE outbox_events SET status = 'pending', claimed_at = NULL \
         WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Operator requeue of a terminal event: resets the retry window so the
/// worker picks it up again.
pub async fn requeue_outbox_event(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, PipelineError> {
    let sql = rewrite_sql(
        "UPDATE outbox_events SET status = 'pending', retry_count = 0, next_attempt_at = ?, \
         last_error = NULL, claimed_at = NULL WHERE id = ? AND status = 'failed'",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub fn new_outbox_record(
    event_type: &str,
    payload: serde_json::Value,
    idempotency_key: String,
    next_attempt_at: DateTime<Utc>,
) -> OutboxRecord {
    OutboxRecord {
        id: Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        payload,
        idempotency_key,
        status: OutboxStatus::Pending,
        retry_count: 0,
        next_attempt_at,
        last_error: None,
        processed_at: None,
        claimed_at: None,
        created_at: Utc::now(),
    }
}
