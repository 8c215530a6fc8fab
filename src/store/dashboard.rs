//! Dashboard aggregates: status counts and traffic totals

use super::Store;
use crate::error::{AppError, AppResult};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;

/// Headline numbers for the dashboard landing view
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub endpoint_total: u64,
    /// status -> count
    pub endpoints_by_status: HashMap<String, u64>,
    pub tunnel_total: u64,
    pub tunnels_by_status: HashMap<String, u64>,
    pub total_tcp_rx: i64,
    pub total_tcp_tx: i64,
    pub total_udp_rx: i64,
    pub total_udp_tx: i64,
}

impl Store {
    pub fn dashboard_stats(&self) -> AppResult<DashboardStats> {
        self.with_retry(|conn| {
            let mut stats = DashboardStats::default();

            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM endpoints GROUP BY status")
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })
                .map_err(AppError::from)?;
            for row in rows {
                let (status, count) = row.map_err(AppError::from)?;
                stats.endpoint_total += count;
                stats.endpoints_by_status.insert(status, count);
            }

            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM tunnels GROUP BY status")
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })
                .map_err(AppError::from)?;
            for row in rows {
                let (status, count) = row.map_err(AppError::from)?;
                stats.tunnel_total += count;
                stats.tunnels_by_status.insert(status, count);
            }

            let (tcp_rx, tcp_tx, udp_rx, udp_tx) = conn
                .query_row(
                    "SELECT COALESCE(SUM(tcp_rx), 0), COALESCE(SUM(tcp_tx), 0),
                            COALESCE(SUM(udp_rx), 0), COALESCE(SUM(udp_tx), 0)
                     FROM tunnels",
                    params![],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .map_err(AppError::from)?;
            stats.total_tcp_rx = tcp_rx;
            stats.total_tcp_tx = tcp_tx;
            stats.total_udp_rx = udp_rx;
            stats.total_udp_tx = udp_tx;

            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TunnelStatus, TunnelType};
    use crate::store::{NewEndpoint, TunnelUpsert};

    #[test]
    fn aggregates_counts_and_traffic() {
        let store = Store::open_in_memory().unwrap();
        let ep = store
            .insert_endpoint(&NewEndpoint {
                name: "edge".into(),
                url: "http://edge:1".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                color: None,
            })
            .unwrap();

        for (i, status) in [TunnelStatus::Running, TunnelStatus::Stopped].iter().enumerate() {
            store
                .upsert_tunnel_by_instance(
                    ep.id,
                    &format!("inst-{i}"),
                    &TunnelUpsert {
                        name: format!("t{i}"),
                        tunnel_type: Some(TunnelType::Server),
                        status: Some(*status),
                        tcp_rx: Some(100),
                        tcp_tx: Some(50),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let stats = store.dashboard_stats().unwrap();
        assert_eq!(stats.endpoint_total, 1);
        assert_eq!(stats.tunnel_total, 2);
        assert_eq!(stats.tunnels_by_status.get("running"), Some(&1));
        assert_eq!(stats.total_tcp_rx, 200);
        assert_eq!(stats.total_tcp_tx, 100);
    }
}
