//! Configuration for the control plane
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/tunneldeck/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to
    pub bind_addr: SocketAddr,

    /// Path to the SQLite database file
    pub db_path: PathBuf,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Authentication settings
    pub auth: AuthConfig,

    /// Per-tunnel file log ring settings
    pub filelog: FileLogConfig,

    /// Raw SSE event retention settings
    pub events: EventRetention,

    /// Endpoint SSE supervisor settings
    pub supervisor: SupervisorConfig,

    /// Metrics aggregator settings
    pub metrics: MetricsConfig,

    /// Fan-out hub settings
    pub hub: HubConfig,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is unset: trace|debug|info|warn|error
    pub level: String,
    /// Optional directory for a daily-rotated log file; None = stdout only
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
        }
    }
}

/// Authentication settings
///
/// The password is stored hashed in memory as soon as the config is loaded;
/// the plaintext never leaves this module.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    /// hex(sha256(password))
    pub password_hash: String,
    pub session_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            username: "admin".to_string(),
            password_hash: crate::auth::hash_password("admin"),
            session_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Per-tunnel file log ring settings
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    pub enabled: bool,
    /// Base directory; layout is {base}/endpoint_{id}/{instance}/YYYY-MM-DD.log
    pub base_dir: PathBuf,
    /// Files older than today - retention_days are removed by cleanup
    pub retention_days: u32,
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
    /// Per-day line cap enforced by cleanup; 0 = unlimited
    pub max_records_per_day: u64,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: PathBuf::from("./data/logs"),
            retention_days: 7,
            cleanup_interval: Duration::from_secs(3600),
            max_records_per_day: 10_000,
        }
    }
}

impl FileLogConfig {
    /// Clamp user-provided values to the documented minimums
    pub fn sanitized(mut self) -> Self {
        if self.retention_days < 1 {
            self.retention_days = 1;
        }
        if self.cleanup_interval < Duration::from_secs(3600) {
            self.cleanup_interval = Duration::from_secs(3600);
        }
        self
    }
}

/// Raw SSE event retention settings
#[derive(Debug, Clone)]
pub struct EventRetention {
    /// Rows older than this many days are purged
    pub retention_days: u32,
    /// Cap on stored rows per endpoint per day; 0 = unlimited
    pub max_per_day: u64,
}

impl Default for EventRetention {
    fn default() -> Self {
        Self {
            retention_days: 3,
            max_per_day: 50_000,
        }
    }
}

/// Endpoint SSE supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// No frame for this long => endpoint offline + reconnect
    pub health_timeout: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay ceiling
    pub backoff_cap: Duration,
    /// Bounded per-endpoint frame queue into the ingestor
    pub queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            queue_capacity: 1024,
        }
    }
}

/// Metrics aggregator settings
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Buckets with no sample for this long are flushed by the ticker
    pub flush_grace: Duration,
    /// Ticker period for the stale-bucket sweep
    pub tick_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_grace: Duration::from_secs(75),
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// Fan-out hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-subscriber event buffer; oldest dropped on overflow
    pub buffer_capacity: usize,
    /// SSE keep-alive interval for idle-client detection
    pub heartbeat: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            heartbeat: Duration::from_secs(15),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".parse().unwrap(),
            db_path: PathBuf::from("./data/tunneldeck.db"),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
            filelog: FileLogConfig::default(),
            events: EventRetention::default(),
            supervisor: SupervisorConfig::default(),
            metrics: MetricsConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [auth] section
    pub auth: Option<FileAuth>,

    /// Optional [filelog] section
    pub filelog: Option<FileFileLog>,

    /// Optional [events] section
    pub events: Option<FileEvents>,

    /// Optional [supervisor] section
    pub supervisor: Option<FileSupervisor>,

    /// Optional [metrics] section
    pub metrics: Option<FileMetrics>,

    /// Optional [hub] section
    pub hub: Option<FileHub>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileAuth {
    pub enabled: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_ttl_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileFileLog {
    pub enabled: Option<bool>,
    pub base_dir: Option<String>,
    pub retention_days: Option<u32>,
    pub cleanup_interval_hours: Option<u64>,
    pub max_records_per_day: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileEvents {
    pub retention_days: Option<u32>,
    pub max_per_day: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileSupervisor {
    pub health_timeout_secs: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_secs: Option<u64>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileMetrics {
    pub flush_grace_secs: Option<u64>,
    pub tick_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileHub {
    pub buffer_capacity: Option<usize>,
    pub heartbeat_secs: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/tunneldeck/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("tunneldeck").join("config.toml"))
    }

    /// Load file config if it exists
    ///
    /// A broken config fails fast with a clear error instead of silently
    /// falling back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse {}: {}", path.display(), e);
                    eprintln!("To reset, delete the file and restart tunneldeck.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        Self::resolve(file)
    }

    pub(crate) fn resolve(file: FileConfig) -> Self {
        let defaults = Config::default();

        // Bind address: env > file > default
        let bind_addr = std::env::var("TUNNELDECK_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|s| s.parse().expect("Invalid bind address"))
            .unwrap_or(defaults.bind_addr);

        // DB path: env > file > default
        let db_path = std::env::var("TUNNELDECK_DB_PATH")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let logging = {
            let f = file.logging.unwrap_or_default();
            LoggingConfig {
                level: f.level.unwrap_or_else(|| "info".to_string()),
                file_dir: f.file_dir.map(PathBuf::from),
            }
        };

        let auth = {
            let f = file.auth.unwrap_or_default();
            let username = std::env::var("TUNNELDECK_USERNAME")
                .ok()
                .or(f.username)
                .unwrap_or_else(|| "admin".to_string());
            let password = std::env::var("TUNNELDECK_PASSWORD").ok().or(f.password);
            AuthConfig {
                enabled: f.enabled.unwrap_or(true),
                username,
                password_hash: password
                    .map(|p| crate::auth::hash_password(&p))
                    .unwrap_or_else(|| AuthConfig::default().password_hash),
                session_ttl: Duration::from_secs(f.session_ttl_hours.unwrap_or(24) * 3600),
            }
        };

        let filelog = {
            let f = file.filelog.unwrap_or_default();
            let base_dir = std::env::var("TUNNELDECK_LOG_DIR")
                .ok()
                .or(f.base_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| FileLogConfig::default().base_dir);
            FileLogConfig {
                enabled: f.enabled.unwrap_or(true),
                base_dir,
                retention_days: f.retention_days.unwrap_or(7),
                cleanup_interval: Duration::from_secs(f.cleanup_interval_hours.unwrap_or(1) * 3600),
                max_records_per_day: f.max_records_per_day.unwrap_or(10_000),
            }
            .sanitized()
        };

        let events = {
            let f = file.events.unwrap_or_default();
            EventRetention {
                retention_days: f.retention_days.unwrap_or(3).max(1),
                max_per_day: f.max_per_day.unwrap_or(50_000),
            }
        };

        let supervisor = {
            let f = file.supervisor.unwrap_or_default();
            let d = SupervisorConfig::default();
            SupervisorConfig {
                health_timeout: f
                    .health_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.health_timeout),
                backoff_base: f
                    .backoff_base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(d.backoff_base),
                backoff_cap: f
                    .backoff_cap_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.backoff_cap),
                queue_capacity: f.queue_capacity.unwrap_or(d.queue_capacity).max(16),
            }
        };

        let metrics = {
            let f = file.metrics.unwrap_or_default();
            let d = MetricsConfig::default();
            MetricsConfig {
                flush_grace: f
                    .flush_grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.flush_grace),
                tick_interval: f
                    .tick_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.tick_interval),
            }
        };

        let hub = {
            let f = file.hub.unwrap_or_default();
            let d = HubConfig::default();
            HubConfig {
                buffer_capacity: f.buffer_capacity.unwrap_or(d.buffer_capacity).max(4),
                heartbeat: f
                    .heartbeat_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.heartbeat),
            }
        };

        Self {
            bind_addr,
            db_path,
            logging,
            auth,
            filelog,
            events,
            supervisor,
            metrics,
            hub,
        }
    }
}
