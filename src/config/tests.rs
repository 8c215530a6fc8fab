//! Config resolution tests
//!
//! These exercise the FileConfig -> Config layer directly, without touching
//! the filesystem or process environment.

use super::*;

#[test]
fn defaults_when_file_empty() {
    let config = Config::resolve(FileConfig::default());
    assert_eq!(config.bind_addr.port(), 9090);
    assert_eq!(config.filelog.retention_days, 7);
    assert_eq!(config.supervisor.health_timeout, Duration::from_secs(60));
    assert_eq!(config.hub.buffer_capacity, 256);
    assert!(config.auth.enabled);
}

#[test]
fn file_sections_override_defaults() {
    let file: FileConfig = toml::from_str(
        r#"
        bind_addr = "0.0.0.0:8000"

        [filelog]
        retention_days = 30
        max_records_per_day = 0

        [supervisor]
        health_timeout_secs = 120
        backoff_base_ms = 500

        [hub]
        buffer_capacity = 64
        "#,
    )
    .unwrap();

    let config = Config::resolve(file);
    assert_eq!(config.bind_addr.port(), 8000);
    assert_eq!(config.filelog.retention_days, 30);
    assert_eq!(config.filelog.max_records_per_day, 0);
    assert_eq!(config.supervisor.health_timeout, Duration::from_secs(120));
    assert_eq!(config.supervisor.backoff_base, Duration::from_millis(500));
    assert_eq!(config.hub.buffer_capacity, 64);
}

#[test]
fn filelog_minimums_are_clamped() {
    let file: FileConfig = toml::from_str(
        r#"
        [filelog]
        retention_days = 0
        cleanup_interval_hours = 0
        "#,
    )
    .unwrap();

    let config = Config::resolve(file);
    assert_eq!(config.filelog.retention_days, 1);
    assert_eq!(config.filelog.cleanup_interval, Duration::from_secs(3600));
}

#[test]
fn unknown_keys_are_tolerated() {
    // Users hand-edit this file; a stray key must not break startup
    let file: Result<FileConfig, _> = toml::from_str(
        r#"
        some_future_key = "value"

        [filelog]
        retention_days = 5
        "#,
    );
    let config = Config::resolve(file.unwrap());
    assert_eq!(config.filelog.retention_days, 5);
}
