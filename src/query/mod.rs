//! Read-only query surface over the store and the file log ring
//!
//! These adapters shape persisted state for the browser UI: the filtered
//! tunnel list, tunnel details with a parsed config view, aligned trend
//! series from ServiceHistory, bounded log reads, and the dashboard
//! aggregates. Nothing here mutates state.

use crate::agent::url::TunnelUrl;
use crate::error::AppResult;
use crate::filelog::FileLog;
use crate::metrics::truncate_to_minute;
use crate::model::{Endpoint, ServiceHistoryRow, Tunnel};
use crate::store::{Store, TunnelQueryParams, TunnelQueryResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-side facade shared by the HTTP handlers
#[derive(Clone)]
pub struct QuerySurface {
    store: Store,
    filelog: Arc<FileLog>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// Tunnel details joined with its endpoint snapshot and parsed config
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDetails {
    pub tunnel: Tunnel,
    pub endpoint: Endpoint,
    /// Parsed view of `config_line`; absent when it does not parse
    pub config: Option<ConfigView>,
}

/// Decomposed tunnel URL for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub scheme: String,
    pub tunnel_address: String,
    pub tunnel_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub extra_targets: Vec<String>,
    pub tls: Option<String>,
    pub log: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub listen_type: String,
}

/// Five parallel arrays on one timestamp axis; one point per minute
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSeries {
    /// Unix milliseconds, ascending, spaced exactly 60 000 apart
    pub created_at: Vec<i64>,
    pub ping: Vec<f64>,
    pub pool: Vec<f64>,
    /// Bytes per minute: sum of TCP+UDP in+out deltas
    pub traffic: Vec<i64>,
    pub speed_in: Vec<f64>,
    pub speed_out: Vec<f64>,
}

/// Bounded log read for one date
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub date: String,
    /// Newest first
    pub lines: Vec<String>,
    /// Every date that has a log file, newest first
    pub available_dates: Vec<String>,
    /// Whether dates other than the requested one exist
    pub has_more_dates: bool,
}

impl QuerySurface {
    pub fn new(store: Store, filelog: Arc<FileLog>) -> Self {
        Self { store, filelog }
    }

    /// Filtered, sorted, paginated tunnel list
    pub fn list_tunnels(&self, params: &TunnelQueryParams) -> AppResult<TunnelQueryResult> {
        self.store.query_tunnels(params)
    }

    /// Tunnel row plus endpoint snapshot plus parsed config line
    pub fn tunnel_details(&self, instance_id: &str) -> AppResult<TunnelDetails> {
        let tunnel = self.store.get_tunnel_by_instance(instance_id)?;
        let endpoint = self.store.get_endpoint(tunnel.endpoint_id)?;
        let config = TunnelUrl::parse(&tunnel.config_line).ok().map(|url| {
            let primary = url.primary_target().clone();
            ConfigView {
                scheme: url.scheme.as_str().to_string(),
                tunnel_address: url.host.clone(),
                tunnel_port: url.port,
                target_address: primary.host,
                target_port: primary.port,
                extra_targets: url
                    .targets
                    .iter()
                    .skip(1)
                    .map(|t| format!("{}:{}", t.host, t.port))
                    .collect(),
                tls: url.tls.map(|t| t.as_str().to_string()),
                log: url.log.clone(),
                min: url.min,
                max: url.max,
                listen_type: url.listen_type().as_str().to_string(),
            }
        });
        Ok(TunnelDetails {
            tunnel,
            endpoint,
            config,
        })
    }

    /// Aligned per-minute series over the trailing `hours`
    ///
    /// Every minute of the window gets a point; minutes without a stored
    /// row carry zeros, so the UI never has to interpolate gaps.
    pub fn trend(&self, instance_id: &str, hours: u32) -> AppResult<TrendSeries> {
        self.trend_at(instance_id, hours, Utc::now())
    }

    /// `trend` with an explicit "now", for deterministic tests
    pub fn trend_at(
        &self,
        instance_id: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> AppResult<TrendSeries> {
        let hours = hours.clamp(1, 24 * 7);
        let minutes = hours as i64 * 60;
        let end = truncate_to_minute(now);
        let start = end - Duration::minutes(minutes);

        let rows = self.store.query_service_history(instance_id, start)?;
        let by_minute: HashMap<i64, &ServiceHistoryRow> = rows
            .iter()
            .map(|r| (r.record_time.timestamp_millis(), r))
            .collect();

        let mut series = TrendSeries {
            created_at: Vec::with_capacity(minutes as usize),
            ping: Vec::with_capacity(minutes as usize),
            pool: Vec::with_capacity(minutes as usize),
            traffic: Vec::with_capacity(minutes as usize),
            speed_in: Vec::with_capacity(minutes as usize),
            speed_out: Vec::with_capacity(minutes as usize),
        };

        for i in 0..minutes {
            let minute = start + Duration::minutes(i);
            let ms = minute.timestamp_millis();
            series.created_at.push(ms);
            match by_minute.get(&ms) {
                Some(row) => {
                    series.ping.push(row.avg_ping);
                    series.pool.push(row.avg_pool);
                    series.traffic.push(
                        row.delta_tcp_in
                            + row.delta_tcp_out
                            + row.delta_udp_in
                            + row.delta_udp_out,
                    );
                    series.speed_in.push(row.avg_speed_in);
                    series.speed_out.push(row.avg_speed_out);
                }
                None => {
                    series.ping.push(0.0);
                    series.pool.push(0.0);
                    series.traffic.push(0);
                    series.speed_in.push(0.0);
                    series.speed_out.push(0.0);
                }
            }
        }

        Ok(series)
    }

    /// File-log lines for one date, newest first, with date inventory
    pub fn logs_by_date(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        date: NaiveDate,
        limit: usize,
    ) -> AppResult<LogPage> {
        let lines = self
            .filelog
            .read(endpoint_id, instance_id, date, limit.clamp(1, 5000))
            .map_err(|e| crate::error::AppError::internal(e.to_string()))?;
        let dates = self
            .filelog
            .available_dates(endpoint_id, instance_id)
            .map_err(|e| crate::error::AppError::internal(e.to_string()))?;
        let date_str = date.format("%Y-%m-%d").to_string();
        let available_dates: Vec<String> = dates
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();
        let has_more_dates = available_dates.iter().any(|d| *d != date_str);
        Ok(LogPage {
            date: date_str,
            lines,
            available_dates,
            has_more_dates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLogConfig;
    use crate::model::{TunnelStatus, TunnelType};
    use crate::store::{NewEndpoint, TunnelUpsert};
    use chrono::TimeZone;

    fn surface() -> (QuerySurface, Store, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let endpoint_id = store
            .insert_endpoint(&NewEndpoint {
                name: "edge".into(),
                url: "http://edge:3000".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                color: None,
            })
            .unwrap()
            .id;
        let filelog = Arc::new(
            FileLog::new(FileLogConfig {
                enabled: true,
                base_dir: dir.path().to_path_buf(),
                retention_days: 7,
                cleanup_interval: std::time::Duration::from_secs(3600),
                max_records_per_day: 0,
            })
            .unwrap(),
        );
        let surface = QuerySurface::new(store.clone(), filelog);
        (surface, store, endpoint_id, dir)
    }

    #[test]
    fn trend_alignment_zero_fills_missing_minutes() {
        let (surface, store, _ep, _dir) = surface();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 15, 0, 30).unwrap();

        // Rows only at now-55min and now-54min
        for (offset, delta) in [(55i64, 600), (54, 1200)] {
            store
                .insert_service_history(&ServiceHistoryRow {
                    instance_id: "inst".into(),
                    record_time: truncate_to_minute(now) - Duration::minutes(offset),
                    avg_ping: 12.0,
                    avg_pool: 3.0,
                    delta_tcp_in: delta,
                    delta_tcp_out: 0,
                    delta_udp_in: 0,
                    delta_udp_out: 0,
                    avg_speed_in: delta as f64 / 60.0,
                    avg_speed_out: 0.0,
                })
                .unwrap();
        }

        let series = surface.trend_at("inst", 1, now).unwrap();
        assert_eq!(series.created_at.len(), 60);
        assert_eq!(series.traffic.iter().filter(|&&t| t > 0).count(), 2);
        assert_eq!(series.ping.iter().filter(|&&p| p > 0.0).count(), 2);
        assert_eq!(series.traffic.iter().filter(|&&t| t == 0).count(), 58);

        // Timestamps ascend in exact 60 000 ms steps
        for pair in series.created_at.windows(2) {
            assert_eq!(pair[1] - pair[0], 60_000);
        }
        assert_eq!(series.traffic[5], 600);
        assert_eq!(series.traffic[6], 1200);
    }

    #[test]
    fn trend_on_empty_history_is_all_zeros() {
        let (surface, _store, _ep, _dir) = surface();
        let series = surface
            .trend_at("ghost", 1, Utc.with_ymd_and_hms(2025, 3, 1, 15, 0, 0).unwrap())
            .unwrap();
        assert_eq!(series.created_at.len(), 60);
        assert!(series.traffic.iter().all(|&t| t == 0));
        assert!(series.ping.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn details_include_parsed_config() {
        let (surface, store, ep, _dir) = surface();
        store
            .upsert_tunnel_by_instance(
                ep,
                "inst-1",
                &TunnelUpsert {
                    name: "web".into(),
                    tunnel_type: Some(TunnelType::Server),
                    status: Some(TunnelStatus::Running),
                    tunnel_address: "0.0.0.0".into(),
                    tunnel_port: 10101,
                    target_address: "127.0.0.1".into(),
                    target_port: 8080,
                    config_line: "server://0.0.0.0:10101/127.0.0.1:8080?tls=1&log=warn".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let details = surface.tunnel_details("inst-1").unwrap();
        assert_eq!(details.endpoint.name, "edge");
        let config = details.config.unwrap();
        assert_eq!(config.scheme, "server");
        assert_eq!(config.tunnel_port, 10101);
        assert_eq!(config.tls.as_deref(), Some("1"));
        assert_eq!(config.log.as_deref(), Some("warn"));
    }

    #[test]
    fn logs_page_reports_other_dates() {
        let (surface, _store, ep, _dir) = surface();
        let day1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap();
        surface.filelog.append(ep, "inst", "one", day1);
        surface.filelog.append(ep, "inst", "two", day2);
        surface.filelog.sync().unwrap();

        let page = surface
            .logs_by_date(ep, "inst", day1.date_naive(), 100)
            .unwrap();
        assert_eq!(page.lines, vec!["one"]);
        assert!(page.has_more_dates);
        assert_eq!(page.available_dates.len(), 2);
    }
}
