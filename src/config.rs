use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub stream: StreamConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.voxrelay/state.sqlite".to_string(),
        }
    }
}

/// Where downloaded media bytes end up. `local` writes files under
/// `local_dir`; `s3` hands bytes to the upload collaborator and records an
/// `s3://bucket/key` locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub mode: String,
    pub local_dir: String,
    pub bucket: Option<String>,
    pub upload_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            local_dir: "~/.voxrelay/media".to_string(),
            bucket: None,
            upload_url: None,
        }
    }
}

/// Provider media endpoint plus the download worker's retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub poll_seconds: u64,
    pub max_retries: i32,
    pub stale_after_seconds: i64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4040/media".to_string(),
            api_token: None,
            poll_seconds: 2,
            max_retries: 5,
            stale_after_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub publish_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            publish_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_seconds: u64,
    pub batch: i64,
    pub max_retries: i32,
    pub stale_after_seconds: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 2,
            batch: 25,
            max_retries: 5,
            stale_after_seconds: 300,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8093,
            },
            auth: AuthConfig { token: None },
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            media: MediaConfig::default(),
            stream: StreamConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("VOXRELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.voxrelay/voxrelay.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(token) = env::var("VOXRELAY_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(url) = env::var("VOXRELAY_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("VOXRELAY_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(url) = env::var("VOXRELAY_MEDIA_BASE_URL") {
        if !url.trim().is_empty() {
            cfg.media.base_url = url;
        }
    }

    if let Ok(token) = env::var("VOXRELAY_MEDIA_TOKEN") {
        if !token.trim().is_empty() {
            cfg.media.api_token = Some(token);
        }
    }

    if let Ok(mode) = env::var("VOXRELAY_STORAGE_MODE") {
        if !mode.trim().is_empty() {
            cfg.storage.mode = mode;
        }
    }

    if let Ok(dir) = env::var("VOXRELAY_STORAGE_DIR") {
        if !dir.trim().is_empty() {
            cfg.storage.local_dir = dir;
        }
    }

    if let Ok(bucket) = env::var("VOXRELAY_STORAGE_BUCKET") {
        if !bucket.trim().is_empty() {
            cfg.storage.bucket = Some(bucket);
        }
    }

    if let Ok(url) = env::var("VOXRELAY_STORAGE_UPLOAD_URL") {
        if !url.trim().is_empty() {
            cfg.storage.upload_url = Some(url);
        }
    }

    if let Ok(url) = env::var("VOXRELAY_STREAM_PUBLISH_URL") {
        if !url.trim().is_empty() {
            cfg.stream.publish_url = Some(url);
        }
    }

    if let Ok(token) = env::var("VOXRELAY_STREAM_TOKEN") {
        if !token.trim().is_empty() {
            cfg.stream.api_token = Some(token);
        }
    }

    cfg
}

pub fn ensure_config_dir() {
    let path = resolve_config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
