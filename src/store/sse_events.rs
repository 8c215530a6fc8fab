//! Raw SSE event buffer, bounded by the retention window

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::SseEventRow;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

/// Fields persisted for one incoming frame
#[derive(Debug, Clone, Default)]
pub struct NewSseEvent {
    pub endpoint_id: i64,
    pub instance_id: Option<String>,
    pub event_type: String,
    pub push_type: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub logs: Option<String>,
    pub tcp_rx: Option<i64>,
    pub tcp_tx: Option<i64>,
    pub udp_rx: Option<i64>,
    pub udp_tx: Option<i64>,
    pub pool: Option<i64>,
    pub ping: Option<i64>,
    pub tcps: Option<i64>,
    pub udps: Option<i64>,
    pub alias: Option<String>,
    pub restart: Option<bool>,
    pub raw: String,
}

/// What the purge pass removed, reported by the cleanup surface
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeStats {
    pub expired: u64,
    pub over_cap: u64,
}

impl Store {
    pub fn insert_sse_event(&self, event: &NewSseEvent) -> AppResult<i64> {
        let event = event.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO sse_events (
                    endpoint_id, instance_id, event_type, push_type, event_time, logs,
                    tcp_rx, tcp_tx, udp_rx, udp_tx, pool, ping, tcps, udps,
                    alias, restart, raw
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    event.endpoint_id,
                    event.instance_id,
                    event.event_type,
                    event.push_type,
                    ts_to_sql(event.event_time.unwrap_or_else(Utc::now)),
                    event.logs,
                    event.tcp_rx,
                    event.tcp_tx,
                    event.udp_rx,
                    event.udp_tx,
                    event.pool,
                    event.ping,
                    event.tcps,
                    event.udps,
                    event.alias,
                    event.restart.map(|b| b as i64),
                    event.raw,
                ],
            )
            .map_err(AppError::from)?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Recent raw events for one instance, newest first
    pub fn list_sse_events(
        &self,
        endpoint_id: i64,
        instance_id: Option<&str>,
        limit: u32,
    ) -> AppResult<Vec<SseEventRow>> {
        let instance_id = instance_id.map(str::to_string);
        self.with_retry(move |conn| {
            let limit = limit.min(1000) as i64;
            let rows = match &instance_id {
                Some(instance) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT * FROM sse_events
                             WHERE endpoint_id = ?1 AND instance_id = ?2
                             ORDER BY event_time DESC, id DESC LIMIT ?3",
                        )
                        .map_err(AppError::from)?;
                    let result = stmt
                        .query_map(params![endpoint_id, instance, limit], sse_event_from_row)
                        .map_err(AppError::from)?
                        .collect::<Result<Vec<_>, _>>();
                    result
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT * FROM sse_events WHERE endpoint_id = ?1
                             ORDER BY event_time DESC, id DESC LIMIT ?2",
                        )
                        .map_err(AppError::from)?;
                    let result = stmt
                        .query_map(params![endpoint_id, limit], sse_event_from_row)
                        .map_err(AppError::from)?
                        .collect::<Result<Vec<_>, _>>();
                    result
                }
            }
            .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Purge events past the retention window and over the per-day cap
    ///
    /// The cap keeps the newest rows of each (endpoint, day) and is skipped
    /// when `max_per_day` is 0.
    pub fn purge_sse_events(&self, retention_days: u32, max_per_day: u64) -> AppResult<PurgeStats> {
        self.with_retry(move |conn| {
            let cutoff = Utc::now() - Duration::days(retention_days as i64);
            let expired = conn
                .execute(
                    "DELETE FROM sse_events WHERE event_time < ?1",
                    params![ts_to_sql(cutoff)],
                )
                .map_err(AppError::from)? as u64;

            let mut over_cap = 0u64;
            if max_per_day > 0 {
                // Rank rows per (endpoint, day) newest-first; delete the tail
                over_cap = conn
                    .execute(
                        "DELETE FROM sse_events WHERE id IN (
                            SELECT id FROM (
                                SELECT id, ROW_NUMBER() OVER (
                                    PARTITION BY endpoint_id, substr(event_time, 1, 10)
                                    ORDER BY event_time DESC, id DESC
                                ) AS rn
                                FROM sse_events
                            ) WHERE rn > ?1
                        )",
                        params![max_per_day as i64],
                    )
                    .map_err(AppError::from)? as u64;
            }

            if expired > 0 || over_cap > 0 {
                tracing::info!(expired, over_cap, "Purged raw SSE events");
            }
            Ok(PurgeStats { expired, over_cap })
        })
    }
}

fn sse_event_from_row(row: &Row<'_>) -> rusqlite::Result<SseEventRow> {
    let event_time: String = row.get("event_time")?;
    let restart: Option<i64> = row.get("restart")?;
    Ok(SseEventRow {
        id: row.get("id")?,
        endpoint_id: row.get("endpoint_id")?,
        instance_id: row.get("instance_id")?,
        event_type: row.get("event_type")?,
        push_type: row.get("push_type")?,
        event_time: ts_from_sql(&event_time),
        logs: row.get("logs")?,
        tcp_rx: row.get("tcp_rx")?,
        tcp_tx: row.get("tcp_tx")?,
        udp_rx: row.get("udp_rx")?,
        udp_tx: row.get("udp_tx")?,
        pool: row.get("pool")?,
        ping: row.get("ping")?,
        tcps: row.get("tcps")?,
        udps: row.get("udps")?,
        alias: row.get("alias")?,
        restart: restart.map(|v| v != 0),
        raw: row.get("raw")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewEndpoint;

    fn store_with_endpoint() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let ep = store
            .insert_endpoint(&NewEndpoint {
                name: "edge".into(),
                url: "http://edge:3000".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                color: None,
            })
            .unwrap();
        (store, ep.id)
    }

    fn log_event(endpoint_id: i64, time: DateTime<Utc>) -> NewSseEvent {
        NewSseEvent {
            endpoint_id,
            instance_id: Some("inst-1".into()),
            event_type: "log".into(),
            event_time: Some(time),
            logs: Some("line".into()),
            raw: "{}".into(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_list_newest_first() {
        let (store, ep) = store_with_endpoint();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_sse_event(&log_event(ep, base + Duration::seconds(i)))
                .unwrap();
        }
        let rows = store.list_sse_events(ep, Some("inst-1"), 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].event_time > rows[2].event_time);
    }

    #[test]
    fn purge_removes_expired_and_over_cap() {
        let (store, ep) = store_with_endpoint();
        let now = Utc::now();
        // Two stale rows and six fresh ones
        for i in 0..2 {
            store
                .insert_sse_event(&log_event(ep, now - Duration::days(10) + Duration::seconds(i)))
                .unwrap();
        }
        for i in 0..6 {
            store
                .insert_sse_event(&log_event(ep, now + Duration::seconds(i)))
                .unwrap();
        }

        let stats = store.purge_sse_events(3, 4).unwrap();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.over_cap, 2);

        let rows = store.list_sse_events(ep, None, 100).unwrap();
        assert_eq!(rows.len(), 4);
        // The newest rows survived the cap
        assert!(rows.iter().all(|r| r.event_time >= now));
    }

    #[test]
    fn cap_zero_means_unlimited() {
        let (store, ep) = store_with_endpoint();
        for i in 0..10 {
            store
                .insert_sse_event(&log_event(ep, Utc::now() + Duration::seconds(i)))
                .unwrap();
        }
        let stats = store.purge_sse_events(3, 0).unwrap();
        assert_eq!(stats.over_cap, 0);
        assert_eq!(store.list_sse_events(ep, None, 100).unwrap().len(), 10);
    }
}
