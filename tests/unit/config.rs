use std::path::PathBuf;
use voxrelay::config::{
    expand_tilde, load_config, resolve_config_path, resolve_database_url, Config, DatabaseConfig,
};

#[test]
fn test_expand_tilde_with_home() {
    let path = expand_tilde("~/voxrelay/file.txt");
    assert!(path.to_string_lossy().contains("voxrelay/file.txt"));
    assert!(!path.to_string_lossy().starts_with('~'));
}

#[test]
fn test_expand_tilde_absolute_untouched() {
    assert_eq!(
        expand_tilde("/var/lib/voxrelay.db"),
        PathBuf::from("/var/lib/voxrelay.db")
    );
}

#[test]
fn test_resolve_database_url_prefers_explicit_url() {
    let cfg = Config {
        database: DatabaseConfig {
            url: Some("postgres://localhost/voxrelay".to_string()),
            sqlite_path: "~/.voxrelay/state.sqlite".to_string(),
        },
        ..Config::default()
    };
    assert_eq!(resolve_database_url(&cfg), "postgres://localhost/voxrelay");
}

#[test]
fn test_resolve_database_url_builds_sqlite_url() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite_path = dir.path().join("state.sqlite");
    let cfg = Config {
        database: DatabaseConfig {
            url: None,
            sqlite_path: sqlite_path.to_string_lossy().to_string(),
        },
        ..Config::default()
    };
    let url = resolve_database_url(&cfg);
    assert!(url.starts_with("sqlite://"));
    assert!(url.ends_with("state.sqlite"));
}

#[test]
fn test_config_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.server.port, 8093);
    assert!(cfg.auth.token.is_none());
    assert_eq!(cfg.storage.mode, "local");
    assert!(cfg.stream.publish_url.is_none());
    assert_eq!(cfg.outbox.max_retries, 5);
    assert_eq!(cfg.media.max_retries, 5);
}

// env mutations live in one test; cargo runs tests in the same process.
#[test]
fn test_env_overrides() {
    std::env::set_var("VOXRELAY_CONFIG", "/custom/voxrelay.json");
    assert_eq!(resolve_config_path(), PathBuf::from("/custom/voxrelay.json"));

    std::env::set_var("VOXRELAY_CONFIG", "/nonexistent/voxrelay.json");
    std::env::set_var("VOXRELAY_TOKEN", "secret-token");
    std::env::set_var("VOXRELAY_STORAGE_MODE", "s3");
    std::env::set_var("VOXRELAY_STORAGE_BUCKET", "voice-media");
    std::env::set_var("VOXRELAY_STREAM_PUBLISH_URL", "http://stream.local/publish");

    let cfg = load_config();
    assert_eq!(cfg.auth.token.as_deref(), Some("secret-token"));
    assert_eq!(cfg.storage.mode, "s3");
    assert_eq!(cfg.storage.bucket.as_deref(), Some("voice-media"));
    assert_eq!(
        cfg.stream.publish_url.as_deref(),
        Some("http://stream.local/publish")
    );

    std::env::remove_var("VOXRELAY_CONFIG");
    std::env::remove_var("VOXRELAY_TOKEN");
    std::env::remove_var("VOXRELAY_STORAGE_MODE");
    std::env::remove_var("VOXRELAY_STORAGE_BUCKET");
    std::env::remove_var("VOXRELAY_STREAM_PUBLISH_URL");
}
