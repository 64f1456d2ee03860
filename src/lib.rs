pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod media;
pub mod outbox;
pub mod transcode;
pub mod webhook;

pub use config::Config;

use self::config::{expand_tilde, load_config, resolve_database_url};
use self::db::DbKind;
use self::error::PipelineError;
use self::media::{HttpDiskTransfer, MediaTransfer, ObjectStoreTransfer};
use self::outbox::HttpStreamPublisher;
use self::webhook::WebhookEnvelope;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub http: reqwest::Client,
    pub db_kind: DbKind,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub messages: i64,
    pub media_assets: i64,
    pub outbox_pending: i64,
    pub outbox_failed: i64,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let state = AppState {
        config: config.clone(),
        pool: pool.clone(),
        http: reqwest::Client::new(),
        db_kind,
    };

    if config.stream.publish_url.is_some() {
        let publisher = Arc::new(HttpStreamPublisher::new(state.http.clone(), &config.stream)?);
        tokio::spawn(outbox::start_outbox_worker(
            pool.clone(),
            db_kind,
            publisher,
            config.outbox.clone(),
        ));
    }

    let transfer: Arc<dyn MediaTransfer> = if config.storage.mode == "s3" {
        Arc::new(ObjectStoreTransfer::new(
            state.http.clone(),
            &config.media,
            &config.storage,
        )?)
    } else {
        Arc::new(HttpDiskTransfer::new(
            state.http.clone(),
            &config.media,
            expand_tilde(&config.storage.local_dir),
        ))
    };
    tokio::spawn(media::start_download_worker(
        pool.clone(),
        db_kind,
        transfer,
        config.media.clone(),
    ));

    let authed_routes = Router::new()
        .route("/v1/outbox/failed", get(list_failed_outbox))
        .route("/v1/outbox/:id/retry", post(retry_outbox_event))
        .route("/v1/media/:provider_media_id", get(get_media_asset))
        .route(
            "/v1/media/:provider_media_id/retry",
            post(retry_media_download),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/webhooks/whatsapp", post(whatsapp_webhook));

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers
            .get("X-Voxrelay-Token")
            .and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn count_rows(pool: &AnyPool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let messages = count_rows(&state.pool, "SELECT COUNT(1) FROM inbound_messages").await;
    let media_assets = count_rows(&state.pool, "SELECT COUNT(1) FROM media_assets").await;
    let outbox_pending = count_rows(
        &state.pool,
        "SELECT COUNT(1) FROM outbox_events WHERE status IN ('pending', 'processing')",
    )
    .await;
    let outbox_failed = count_rows(
        &state.pool,
        "SELECT COUNT(1) FROM outbox_events WHERE status = 'failed'",
    )
    .await;
    Json(StatusResponse {
        messages,
        media_assets,
        outbox_pending,
        outbox_failed,
    })
}

async fn whatsapp_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> impl IntoResponse {
    let mut ingested = 0;
    for entry in &envelope.entry {
        for change in &entry.changes {
            let value = &change.value;
            for message in &value.messages {
                if message.kind != "audio" || message.audio.is_none() {
                    continue;
                }
                match ingest::record_audio_message(&state.pool, state.db_kind, value, message).await
                {
                    Ok(_) => ingested += 1,
                    Err(err @ PipelineError::Validation(_)) => {
                        error!(wa_message_id = %message.id, error = %err, "webhook rejected");
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": err.to_string()})),
                        )
                            .into_response();
                    }
                    Err(err) => {
                        error!(wa_message_id = %message.id, error = %err, "webhook ingest failed");
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({"error": err.to_string()})),
                        )
                            .into_response();
                    }
                }
            }
        }
    }
    Json(json!({"status": "accepted", "ingested": ingested})).into_response()
}

async fn list_failed_outbox(State(state): State<AppState>) -> impl IntoResponse {
    match db::list_failed_outbox(&state.pool, state.db_kind, 100).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            error!(error = %err, "failed outbox listing error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn retry_outbox_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match db::requeue_outbox_event(&state.pool, state.db_kind, &id, Utc::now()).await {
        Ok(true) => Json(json!({"status": "requeued"})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(outbox_event_id = %id, error = %err, "outbox requeue error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn retry_media_download(
    State(state): State<AppState>,
    Path(provider_media_id): Path<String>,
) -> impl IntoResponse {
    match db::requeue_media_download(&state.pool, state.db_kind, &provider_media_id, Utc::now())
        .await
    {
        Ok(true) => Json(json!({"status": "requeued"})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(provider_media_id = %provider_media_id, error = %err, "media requeue error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_media_asset(
    State(state): State<AppState>,
    Path(provider_media_id): Path<String>,
) -> impl IntoResponse {
    match db::get_media_asset_by_provider_id(&state.pool, state.db_kind, &provider_media_id).await {
        Ok(Some(asset)) => Json(asset).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(provider_media_id = %provider_media_id, error = %err, "media lookup error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
