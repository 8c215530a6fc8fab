//! Typed persistence for the control plane
//!
//! The store owns every row. Each aggregate gets its own module with typed
//! operations; nothing outside this module speaks SQL. All mutating
//! operations run inside a transaction, and callers go through the shared
//! retry wrapper which re-runs closures on transient SQLite errors
//! (busy/locked) with bounded attempts and exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! Ingestion / Aggregator / HTTP API
//!         │
//!         └──→ Store (r2d2 pool)
//!                 │
//!                 ├──→ SQLite Connection 1
//!                 ├──→ SQLite Connection 2
//!                 └──→ SQLite Connection N (max 8)
//!                         │
//!                         └──→ WAL file (concurrent readers, single writer)
//! ```

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

mod dashboard;
mod endpoints;
mod history;
mod oplog;
mod recycle;
mod sessions;
mod sse_events;
mod tunnels;

pub use dashboard::DashboardStats;
pub use endpoints::NewEndpoint;
pub use history::DailyTraffic;
pub use sse_events::{NewSseEvent, PurgeStats};
pub use tunnels::{
    TunnelCounters, TunnelListItem, TunnelQueryParams, TunnelQueryResult, TunnelUpsert,
};

/// Retry attempts for transient failures before giving up
const RETRY_ATTEMPTS: u32 = 5;
/// First retry delay; doubles per attempt, capped below
const RETRY_BASE: Duration = Duration::from_millis(25);
const RETRY_CAP: Duration = Duration::from_millis(500);

/// Shared handle to the SQLite-backed store
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::internal(format!("create db dir: {e}")))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                PRAGMA foreign_keys=ON;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(AppError::from)?;

        let store = Self { pool };
        store.with_retry(|conn| init_schema(conn).map_err(AppError::from))?;
        Ok(store)
    }

    /// In-memory store for tests
    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_DB: AtomicU64 = AtomicU64::new(0);

        // A named shared-cache URI keeps all pooled connections on one
        // database; the counter keeps parallel tests on separate ones
        let name = format!(
            "file:memdb{}?mode=memory&cache=shared",
            NEXT_DB.fetch_add(1, Ordering::Relaxed)
        );
        let manager = SqliteConnectionManager::file(name)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(AppError::from)?;
        let store = Self { pool };
        store.with_retry(|conn| init_schema(conn).map_err(AppError::from))?;
        Ok(store)
    }

    /// Run `op` against a pooled connection, retrying transient failures
    ///
    /// Non-transient errors return immediately. Exhaustion returns the last
    /// underlying error.
    pub fn with_retry<T>(
        &self,
        op: impl Fn(&mut Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut delay = RETRY_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .pool
                .get()
                .map_err(AppError::from)
                .and_then(|mut conn| op(&mut conn));
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Store retry after transient error: {}",
                        e
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(RETRY_CAP);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Initialize database schema and run migrations
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'),
                0
            )",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_schema_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn apply_schema_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Metadata table (created first for version tracking)
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        -- Remote agents
        CREATE TABLE IF NOT EXISTS endpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            api_path TEXT NOT NULL,
            api_key TEXT NOT NULL,
            hostname TEXT,
            status TEXT NOT NULL DEFAULT 'offline',
            tunnel_count INTEGER NOT NULL DEFAULT 0,
            version TEXT,
            tls TEXT,
            log TEXT,
            color TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_check TEXT,
            UNIQUE(url, api_path)
        );

        -- Forwarding rules, one row per agent instance
        CREATE TABLE IF NOT EXISTS tunnels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
            instance_id TEXT,
            name TEXT NOT NULL,
            alias TEXT,
            type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'stopped',
            tunnel_address TEXT NOT NULL DEFAULT '',
            tunnel_port INTEGER NOT NULL DEFAULT 0,
            target_address TEXT NOT NULL DEFAULT '',
            target_port INTEGER NOT NULL DEFAULT 0,
            extend_target_address TEXT NOT NULL DEFAULT '[]',
            tls_mode TEXT NOT NULL DEFAULT 'inherit',
            log_level TEXT NOT NULL DEFAULT 'info',
            password TEXT,
            cert_path TEXT,
            key_path TEXT,
            min INTEGER,
            max INTEGER,
            slot INTEGER,
            pool INTEGER,
            ping INTEGER,
            mode INTEGER,
            restart INTEGER NOT NULL DEFAULT 0,
            listen_type TEXT NOT NULL DEFAULT 'ALL',
            command_line TEXT NOT NULL DEFAULT '',
            config_line TEXT NOT NULL DEFAULT '',
            sorts INTEGER NOT NULL DEFAULT 0,
            tcps INTEGER,
            udps INTEGER,
            tcp_rx INTEGER NOT NULL DEFAULT 0,
            tcp_tx INTEGER NOT NULL DEFAULT 0,
            udp_rx INTEGER NOT NULL DEFAULT 0,
            udp_tx INTEGER NOT NULL DEFAULT 0,
            peer TEXT,
            tags TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tunnels_endpoint_instance
            ON tunnels(endpoint_id, instance_id) WHERE instance_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_tunnels_endpoint ON tunnels(endpoint_id);
        CREATE INDEX IF NOT EXISTS idx_tunnels_status ON tunnels(status);

        -- Raw telemetry buffer, bounded by retention
        CREATE TABLE IF NOT EXISTS sse_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
            instance_id TEXT,
            event_type TEXT NOT NULL,
            push_type TEXT,
            event_time TEXT NOT NULL,
            logs TEXT,
            tcp_rx INTEGER,
            tcp_tx INTEGER,
            udp_rx INTEGER,
            udp_tx INTEGER,
            pool INTEGER,
            ping INTEGER,
            tcps INTEGER,
            udps INTEGER,
            alias TEXT,
            restart INTEGER,
            raw TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sse_events_endpoint_time
            ON sse_events(endpoint_id, event_time);
        CREATE INDEX IF NOT EXISTS idx_sse_events_time ON sse_events(event_time);

        -- One aggregated minute per instance
        CREATE TABLE IF NOT EXISTS service_history (
            instance_id TEXT NOT NULL,
            record_time TEXT NOT NULL,
            avg_ping REAL NOT NULL DEFAULT 0,
            avg_pool REAL NOT NULL DEFAULT 0,
            delta_tcp_in INTEGER NOT NULL DEFAULT 0,
            delta_tcp_out INTEGER NOT NULL DEFAULT 0,
            delta_udp_in INTEGER NOT NULL DEFAULT 0,
            delta_udp_out INTEGER NOT NULL DEFAULT 0,
            avg_speed_in REAL NOT NULL DEFAULT 0,
            avg_speed_out REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (instance_id, record_time)
        );
        CREATE INDEX IF NOT EXISTS idx_service_history_time ON service_history(record_time);

        -- Append-only audit trail for the dashboard
        CREATE TABLE IF NOT EXISTS operation_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            tunnel_name TEXT NOT NULL,
            status TEXT NOT NULL,
            message TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_operation_log_created ON operation_log(created_at DESC);

        -- Soft-deleted tunnel snapshots
        CREATE TABLE IF NOT EXISTS recycle (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id INTEGER NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            config_line TEXT NOT NULL,
            command_line TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            deleted_at TEXT NOT NULL
        );

        -- Browser sessions
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        INSERT INTO metadata (key, value) VALUES ('schema_version', '1');
        "#,
    )?;

    tracing::info!("Initialized store schema (v1)");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row-mapping helpers shared by the aggregate modules
// ─────────────────────────────────────────────────────────────────────────────

/// Format a timestamp the way every table stores them
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp; a corrupt value is a programming error upstream,
/// so it degrades to the epoch rather than failing the whole row
pub(crate) fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_once() {
        let store = Store::open_in_memory().unwrap();
        // Running init again must be a no-op, not a duplicate-table error
        store
            .with_retry(|conn| init_schema(conn).map_err(AppError::from))
            .unwrap();
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = ts_from_sql(&ts_to_sql(now));
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn corrupt_timestamp_degrades_to_epoch() {
        assert_eq!(ts_from_sql("not a date"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
