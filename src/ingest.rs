//! Idempotent recording of an inbound audio message. The message, media
//! asset, media link, and outbox event land in one transaction; replaying the
//! same webhook reuses every row and only re-arms the download queue.

use crate::db::{
    self, DbKind, MediaAssetRecord, MediaLinkRecord, MediaStatus, MessageRecord,
};
use crate::error::PipelineError;
use crate::webhook::{WebhookMessage, WebhookValue};
use chrono::Utc;
use sqlx::AnyPool;
use tracing::{info, warn};
use uuid::Uuid;

pub const EVENT_AUDIO_RECEIVED: &str = "audio_received";
pub const LINK_PURPOSE_PRIMARY: &str = "primary";

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub message_id: String,
    pub media_asset_id: String,
    pub reused_message: bool,
    pub outbox_enqueued: bool,
}

/// Deterministic key for the relay event, so webhook re-delivery maps onto
/// the same (possibly already processed) outbox row.
pub fn audio_idempotency_key(wa_message_id: &str, provider_media_id: &str) -> String {
    format!("{EVENT_AUDIO_RECEIVED}:{wa_message_id}:{provider_media_id}")
}

pub async fn record_audio_message(
    pool: &AnyPool,
    kind: DbKind,
    value: &WebhookValue,
    message: &WebhookMessage,
) -> Result<IngestOutcome, PipelineError> {
    let audio = message
        .audio
        .as_ref()
        .ok_or_else(|| PipelineError::Validation("message carries no audio content".to_string()))?;

    // A message without contact information cannot be attributed to a sender.
    let contact = value.contact_for(&message.from).ok_or_else(|| {
        PipelineError::Validation(format!(
            "webhook for message {} carries no contact information",
            message.id
        ))
    })?;

    let received_at = message.received_at();
    if received_at.timestamp() == 0 && message.timestamp != "0" {
        warn!(
            wa_message_id = %message.id,
            timestamp = %message.timestamp,
            "malformed webhook timestamp, defaulting to epoch"
        );
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let (message_id, reused_message) =
        match db::get_message_by_wa_id(&mut *tx, kind, &message.id).await? {
            Some(existing) => (existing.id, true),
            None => {
                let record = MessageRecord {
                    id: Uuid::new_v4().to_string(),
                    wa_message_id: message.id.clone(),
                    direction: "inbound".to_string(),
                    kind: message.kind.clone(),
                    wa_contact_id: contact.wa_id.clone(),
                    contact_name: contact.display_name().map(|s| s.to_string()),
                    business_number_id: value.metadata.phone_number_id.clone(),
                    received_at,
                    raw_payload: serde_json::to_value(message)
                        .unwrap_or_else(|_| serde_json::json!({})),
                    has_media: true,
                    created_at: now,
                };
                db::insert_inbound_message(&mut *tx, kind, &record).await?;
                (record.id, false)
            }
        };

    let media_asset_id =
        match db::get_media_asset_by_provider_id(&mut *tx, kind, &audio.id).await? {
            Some(existing) => {
                if existing.status != MediaStatus::Downloaded {
                    db::requeue_media_download(&mut *tx, kind, &audio.id, now).await?;
                }
                existing.id
            }
            None => {
                let record = MediaAssetRecord {
                    id: Uuid::new_v4().to_string(),
                    provider_media_id: audio.id.clone(),
                    sha256: None,
                    mime_type: audio.mime_type.clone(),
                    byte_size: None,
                    storage_url: None,
                    voice: audio.voice,
                    status: MediaStatus::Pending,
                    retry_count: 0,
                    next_attempt_at: now,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                db::insert_media_asset(&mut *tx, kind, &record).await?;
                record.id
            }
        };

    let link = MediaLinkRecord {
        id: Uuid::new_v4().to_string(),
        message_id: message_id.clone(),
        media_asset_id: media_asset_id.clone(),
        purpose: LINK_PURPOSE_PRIMARY.to_string(),
        created_at: now,
    };
    db::insert_media_link(&mut *tx, kind, &link).await?;

    let payload = serde_json::json!({
        "wa_message_id": message.id,
        "wa_contact_id": contact.wa_id,
        "business_number_id": value.metadata.phone_number_id,
        "media": {"provider_media_id": audio.id},
    });
    let event = db::new_outbox_record(
        EVENT_AUDIO_RECEIVED,
        payload,
        audio_idempotency_key(&message.id, &audio.id),
        now,
    );
    let outbox_enqueued = db::insert_outbox_event(&mut *tx, kind, &event).await?;

    tx.commit().await?;

    info!(
        wa_message_id = %message.id,
        provider_media_id = %audio.id,
        reused_message,
        outbox_enqueued,
        "recorded inbound audio message"
    );

    Ok(IngestOutcome {
        message_id,
        media_asset_id,
        reused_message,
        outbox_enqueued,
    })
}
