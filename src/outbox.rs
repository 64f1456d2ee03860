//! Outbox relay. Events move through `pending → processing → processed`
//! (or `failed`, claimable again until the retry cap). Claims are conditional
//! updates, so only one dispatcher can take an event; the downstream
//! idempotency key covers re-delivery after a crash mid-publish.

use crate::config::{OutboxConfig, StreamConfig};
use crate::db::{self, DbKind, OutboxRecord, OutboxStatus};
use crate::error::{truncate_error, PipelineError};
use crate::ingest::EVENT_AUDIO_RECEIVED;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use sqlx::AnyPool;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Caller-owned retry schedule: exponential backoff with one authoritative
/// attempt cap (the entity-level retry count).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_seconds: i64,
    pub cap_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_seconds: 5,
            cap_seconds: 300,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = (retry_count.max(1) - 1).min(8) as u32;
        let base = 2_i64.pow(exponent);
        Duration::seconds((base * self.base_seconds).min(self.cap_seconds))
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a payload keyed by the event's idempotency key; the downstream
    /// consumer treats a repeated key as a safe no-op.
    async fn publish(
        &self,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<(), PipelineError>;
}

pub struct HttpStreamPublisher {
    http: Client,
    publish_url: String,
    api_token: Option<String>,
}

impl HttpStreamPublisher {
    pub fn new(http: Client, stream: &StreamConfig) -> Result<Self, PipelineError> {
        let publish_url = stream.publish_url.clone().ok_or_else(|| {
            PipelineError::Validation("stream.publish_url is not configured".to_string())
        })?;
        Ok(Self {
            http,
            publish_url,
            api_token: stream.api_token.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for HttpStreamPublisher {
    async fn publish(
        &self,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<(), PipelineError> {
        let mut req = self
            .http
            .post(&self.publish_url)
            .header("X-Idempotency-Key", idempotency_key)
            .json(payload);
        if let Some(token) = self.api_token.as_ref() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Transient(format!(
                "stream publish failed: {status} {body}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    AlreadyProcessed,
    NotClaimed,
}

/// One dispatch attempt for an outbox event identifier.
pub async fn dispatch_event(
    pool: &AnyPool,
    kind: DbKind,
    publisher: &dyn EventPublisher,
    policy: &RetryPolicy,
    event_id: &str,
) -> Result<DispatchOutcome, PipelineError> {
    let event = db::get_outbox_event(pool, kind, event_id)
        .await?
        .ok_or_else(|| PipelineError::not_found("outbox_event", event_id))?;

    // Guards against duplicate scheduling of the same identifier.
    if event.status == OutboxStatus::Processed {
        return Ok(DispatchOutcome::AlreadyProcessed);
    }

    if !db::claim_outbox_event(pool, kind, event_id, Utc::now(), policy.max_attempts).await? {
        return Ok(DispatchOutcome::NotClaimed);
    }

    run_claimed_event(pool, kind, publisher, policy, &event).await?;
    Ok(DispatchOutcome::Published)
}

/// Publish an event already claimed into `processing`, then advance its
/// status. Failures are recorded on the row before the error propagates.
pub async fn run_claimed_event(
    pool: &AnyPool,
    kind: DbKind,
    publisher: &dyn EventPublisher,
    policy: &RetryPolicy,
    event: &OutboxRecord,
) -> Result<(), PipelineError> {
    match execute_event(pool, kind, publisher, event).await {
        Ok(()) => {
            db::mark_outbox_processed(pool, kind, &event.id, Utc::now()).await?;
            info!(
                outbox_event_id = %event.id,
                event_type = %event.event_type,
                idempotency_key = %event.idempotency_key,
                "outbox event published"
            );
            Ok(())
        }
        Err(err) => {
            // A validation failure cannot succeed on retry; its counter jumps
            // past the cap so the queue stops rescheduling the event.
            let retry = if matches!(err, PipelineError::Validation(_)) {
                policy.max_attempts.max(event.retry_count + 1)
            } else {
                event.retry_count + 1
            };
            let next = Utc::now() + policy.backoff(retry);
            if let Err(mark_err) = db::mark_outbox_failed(
                pool,
                kind,
                &event.id,
                retry,
                next,
                &truncate_error(&err.to_string()),
            )
            .await
            {
                warn!(
                    outbox_event_id = %event.id,
                    error = %mark_err,
                    "failed to record outbox dispatch failure"
                );
            }
            error!(
                outbox_event_id = %event.id,
                event_type = %event.event_type,
                error_class = err.class(),
                error = %err,
                retry_count = retry,
                "outbox dispatch failed"
            );
            Err(err)
        }
    }
}

async fn execute_event(
    pool: &AnyPool,
    kind: DbKind,
    publisher: &dyn EventPublisher,
    event: &OutboxRecord,
) -> Result<(), PipelineError> {
    match event.event_type.as_str() {
        EVENT_AUDIO_RECEIVED => {
            // The payload is a self-contained snapshot; referenced rows must
            // still exist, so a missing one is a bug signal, not a retry
            // ambiguity.
            let wa_message_id = payload_str(event, "/wa_message_id")?;
            let provider_media_id = payload_str(event, "/media/provider_media_id")?;

            db::get_message_by_wa_id(pool, kind, &wa_message_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::Integrity(format!(
                        "outbox event {} references missing message {wa_message_id}",
                        event.id
                    ))
                })?;
            db::get_media_asset_by_provider_id(pool, kind, &provider_media_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::Integrity(format!(
                        "outbox event {} references missing media {provider_media_id}",
                        event.id
                    ))
                })?;

            publisher.publish(&event.payload, &event.idempotency_key).await
        }
        other => Err(PipelineError::Validation(format!(
            "unknown outbox event type: {other}"
        ))),
    }
}

fn payload_str(event: &OutboxRecord, pointer: &str) -> Result<String, PipelineError> {
    event
        .payload
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            PipelineError::Integrity(format!(
                "outbox event {} payload is missing {pointer}",
                event.id
            ))
        })
}

pub async fn start_outbox_worker(
    pool: AnyPool,
    kind: DbKind,
    publisher: Arc<dyn EventPublisher>,
    outbox: OutboxConfig,
) {
    let policy = RetryPolicy {
        max_attempts: outbox.max_retries,
        ..RetryPolicy::default()
    };
    loop {
        let now = Utc::now();

        let cutoff = now - Duration::seconds(outbox.stale_after_seconds);
        match db::reclaim_stale_processing(&pool, kind, cutoff).await {
            Ok(0) => {}
            Ok(n) => warn!(reclaimed = n, "reclaimed stale processing outbox events"),
            Err(err) => warn!(error = %err, "stale outbox reclaim failed"),
        }

        match db::list_claimable_outbox(&pool, kind, now, policy.max_attempts, outbox.batch).await {
            Ok(batch) => {
                for event in batch {
                    match db::claim_outbox_event(&pool, kind, &event.id, now, policy.max_attempts)
                        .await
                    {
                        Ok(true) => {
                            let _ =
                                run_claimed_event(&pool, kind, publisher.as_ref(), &policy, &event)
                                    .await;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(outbox_event_id = %event.id, error = %err, "outbox claim failed");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "outbox queue poll failed");
            }
        }

        sleep(std::time::Duration::from_secs(outbox.poll_seconds)).await;
    }
}
