//! ServiceHistory aggregate: one row per (instance, minute)

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::ServiceHistoryRow;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

/// Daily traffic rollup used by the dashboard's weekly view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTraffic {
    /// YYYY-MM-DD (UTC)
    pub date: String,
    pub tcp_in: i64,
    pub tcp_out: i64,
    pub udp_in: i64,
    pub udp_out: i64,
}

impl Store {
    /// Upsert one aggregated minute; a second flush for the same minute
    /// replaces the row
    pub fn insert_service_history(&self, row: &ServiceHistoryRow) -> AppResult<()> {
        let row = row.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO service_history (
                    instance_id, record_time, avg_ping, avg_pool,
                    delta_tcp_in, delta_tcp_out, delta_udp_in, delta_udp_out,
                    avg_speed_in, avg_speed_out
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(instance_id, record_time) DO UPDATE SET
                    avg_ping = excluded.avg_ping,
                    avg_pool = excluded.avg_pool,
                    delta_tcp_in = excluded.delta_tcp_in,
                    delta_tcp_out = excluded.delta_tcp_out,
                    delta_udp_in = excluded.delta_udp_in,
                    delta_udp_out = excluded.delta_udp_out,
                    avg_speed_in = excluded.avg_speed_in,
                    avg_speed_out = excluded.avg_speed_out",
                params![
                    row.instance_id,
                    ts_to_sql(row.record_time),
                    row.avg_ping,
                    row.avg_pool,
                    row.delta_tcp_in,
                    row.delta_tcp_out,
                    row.delta_udp_in,
                    row.delta_udp_out,
                    row.avg_speed_in,
                    row.avg_speed_out,
                ],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    /// Rows for one instance since `since`, oldest first
    pub fn query_service_history(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<ServiceHistoryRow>> {
        let instance_id = instance_id.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM service_history
                     WHERE instance_id = ?1 AND record_time >= ?2
                     ORDER BY record_time ASC",
                )
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![instance_id, ts_to_sql(since)], history_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Traffic summed per UTC day over the trailing week, all instances
    pub fn weekly_traffic(&self) -> AppResult<Vec<DailyTraffic>> {
        self.with_retry(|conn| {
            let since = Utc::now() - Duration::days(7);
            let mut stmt = conn
                .prepare(
                    "SELECT substr(record_time, 1, 10) AS day,
                            SUM(delta_tcp_in), SUM(delta_tcp_out),
                            SUM(delta_udp_in), SUM(delta_udp_out)
                     FROM service_history
                     WHERE record_time >= ?1
                     GROUP BY day ORDER BY day ASC",
                )
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![ts_to_sql(since)], |row| {
                    Ok(DailyTraffic {
                        date: row.get(0)?,
                        tcp_in: row.get(1)?,
                        tcp_out: row.get(2)?,
                        udp_in: row.get(3)?,
                        udp_out: row.get(4)?,
                    })
                })
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Traffic summed per UTC hour since `since`, all instances
    pub fn hourly_traffic(&self, since: DateTime<Utc>) -> AppResult<Vec<DailyTraffic>> {
        self.with_retry(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT substr(record_time, 1, 13) AS hour,
                            SUM(delta_tcp_in), SUM(delta_tcp_out),
                            SUM(delta_udp_in), SUM(delta_udp_out)
                     FROM service_history
                     WHERE record_time >= ?1
                     GROUP BY hour ORDER BY hour ASC",
                )
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![ts_to_sql(since)], |row| {
                    Ok(DailyTraffic {
                        date: row.get(0)?,
                        tcp_in: row.get(1)?,
                        tcp_out: row.get(2)?,
                        udp_in: row.get(3)?,
                        udp_out: row.get(4)?,
                    })
                })
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Drop minute rows for instances that no longer exist anywhere
    pub fn prune_orphan_history(&self) -> AppResult<u64> {
        self.with_retry(|conn| {
            let n = conn
                .execute(
                    "DELETE FROM service_history WHERE instance_id NOT IN
                        (SELECT instance_id FROM tunnels WHERE instance_id IS NOT NULL)",
                    [],
                )
                .map_err(AppError::from)?;
            Ok(n as u64)
        })
    }
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceHistoryRow> {
    let record_time: String = row.get("record_time")?;
    Ok(ServiceHistoryRow {
        instance_id: row.get("instance_id")?,
        record_time: ts_from_sql(&record_time),
        avg_ping: row.get("avg_ping")?,
        avg_pool: row.get("avg_pool")?,
        delta_tcp_in: row.get("delta_tcp_in")?,
        delta_tcp_out: row.get("delta_tcp_out")?,
        delta_udp_in: row.get("delta_udp_in")?,
        delta_udp_out: row.get("delta_udp_out")?,
        avg_speed_in: row.get("avg_speed_in")?,
        avg_speed_out: row.get("avg_speed_out")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Utc};

    fn minute_row(instance: &str, minute: DateTime<Utc>, delta: i64) -> ServiceHistoryRow {
        ServiceHistoryRow {
            instance_id: instance.into(),
            record_time: minute,
            avg_ping: 10.0,
            avg_pool: 4.0,
            delta_tcp_in: delta,
            delta_tcp_out: 0,
            delta_udp_in: 0,
            delta_udp_out: 0,
            avg_speed_in: delta as f64 / 60.0,
            avg_speed_out: 0.0,
        }
    }

    fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
        t.with_second(0).unwrap().with_nanosecond(0).unwrap()
    }

    #[test]
    fn insert_is_idempotent_on_minute() {
        let store = Store::open_in_memory().unwrap();
        let minute = truncate_minute(Utc::now());

        store
            .insert_service_history(&minute_row("inst-1", minute, 500))
            .unwrap();
        // Same minute again with different deltas: replace, not duplicate
        store
            .insert_service_history(&minute_row("inst-1", minute, 700))
            .unwrap();

        let rows = store
            .query_service_history("inst-1", minute - Duration::minutes(5))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta_tcp_in, 700);
    }

    #[test]
    fn query_is_ordered_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        let base = truncate_minute(Utc::now()) - Duration::minutes(10);
        for i in 0..10 {
            store
                .insert_service_history(&minute_row("inst-1", base + Duration::minutes(i), i))
                .unwrap();
        }
        let rows = store
            .query_service_history("inst-1", base + Duration::minutes(5))
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].record_time < w[1].record_time));
    }
}
