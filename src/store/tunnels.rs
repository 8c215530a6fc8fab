//! Tunnel aggregate operations
//!
//! Tunnels are keyed by `(endpoint_id, instance_id)` once the agent has
//! assigned an instance id. Every insert/delete recomputes the owning
//! endpoint's denormalised `tunnel_count` inside the same transaction.

use super::endpoints::recount_tunnels;
use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::{ListenType, TlsMode, Tunnel, TunnelStatus, TunnelType};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

/// Full set of fields written when materialising a tunnel from agent state
#[derive(Debug, Clone, Default)]
pub struct TunnelUpsert {
    pub name: String,
    pub alias: Option<String>,
    pub tunnel_type: Option<TunnelType>,
    pub status: Option<TunnelStatus>,
    pub tunnel_address: String,
    pub tunnel_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub extend_target_address: Vec<String>,
    pub tls_mode: Option<TlsMode>,
    pub log_level: Option<String>,
    pub password: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub slot: Option<i64>,
    pub pool: Option<i64>,
    pub ping: Option<i64>,
    pub mode: Option<i64>,
    pub restart: Option<bool>,
    pub listen_type: Option<ListenType>,
    pub command_line: String,
    pub config_line: String,
    pub tcps: Option<i64>,
    pub udps: Option<i64>,
    pub tcp_rx: Option<i64>,
    pub tcp_tx: Option<i64>,
    pub udp_rx: Option<i64>,
    pub udp_tx: Option<i64>,
    pub peer: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Counter/gauge sample applied by the ingestor on `update` frames
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelCounters {
    pub tcp_rx: Option<i64>,
    pub tcp_tx: Option<i64>,
    pub udp_rx: Option<i64>,
    pub udp_tx: Option<i64>,
    pub pool: Option<i64>,
    pub ping: Option<i64>,
    pub tcps: Option<i64>,
    pub udps: Option<i64>,
}

/// Filters, sort, and paging for the tunnel list
#[derive(Debug, Clone, Default)]
pub struct TunnelQueryParams {
    /// Matches name, alias, or instance id (substring)
    pub search: Option<String>,
    pub status: Option<TunnelStatus>,
    pub endpoint_id: Option<i64>,
    /// Matches either the listen port or the target port
    pub port: Option<u16>,
    /// Matches the `group` tag
    pub group: Option<String>,
    /// name | status | created_at | sorts | tcp_rx | tcp_tx | udp_rx | udp_tx
    pub sort_by: Option<String>,
    pub sort_desc: bool,
    pub page: u32,
    pub page_size: u32,
}

impl TunnelQueryParams {
    pub const DEFAULT_PAGE_SIZE: u32 = 10;
    pub const MAX_PAGE_SIZE: u32 = 1000;

    fn effective_page_size(&self) -> u32 {
        match self.page_size {
            0 => Self::DEFAULT_PAGE_SIZE,
            n => n.min(Self::MAX_PAGE_SIZE),
        }
    }
}

/// One page of tunnels with their endpoint join
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelQueryResult {
    pub items: Vec<TunnelListItem>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Tunnel row plus the endpoint snapshot the list view renders
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelListItem {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub endpoint_name: String,
    pub endpoint_hostname: Option<String>,
    pub endpoint_version: Option<String>,
}

impl Store {
    /// Insert or update the tunnel bound to `(endpoint_id, instance_id)`
    pub fn upsert_tunnel_by_instance(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        fields: &TunnelUpsert,
    ) -> AppResult<Tunnel> {
        let instance_id = instance_id.to_string();
        let fields = fields.clone();
        self.with_retry(move |conn| {
            let tx = conn.transaction().map_err(AppError::from)?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tunnels WHERE endpoint_id = ?1 AND instance_id = ?2",
                    params![endpoint_id, instance_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(AppError::from)?;

            let now = ts_to_sql(Utc::now());
            let tags_json = fields
                .tags
                .as_ref()
                .map(|t| serde_json::to_string(t).unwrap_or_else(|_| "{}".into()));
            let extend_json =
                serde_json::to_string(&fields.extend_target_address).unwrap_or_else(|_| "[]".into());

            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE tunnels SET
                            name = ?2,
                            alias = COALESCE(?3, alias),
                            type = COALESCE(?4, type),
                            status = COALESCE(?5, status),
                            tunnel_address = ?6, tunnel_port = ?7,
                            target_address = ?8, target_port = ?9,
                            extend_target_address = ?10,
                            tls_mode = COALESCE(?11, tls_mode),
                            log_level = COALESCE(?12, log_level),
                            password = COALESCE(?13, password),
                            cert_path = COALESCE(?14, cert_path),
                            key_path = COALESCE(?15, key_path),
                            min = COALESCE(?16, min), max = COALESCE(?17, max),
                            slot = COALESCE(?18, slot),
                            pool = COALESCE(?19, pool), ping = COALESCE(?20, ping),
                            mode = COALESCE(?21, mode),
                            restart = COALESCE(?22, restart),
                            listen_type = COALESCE(?23, listen_type),
                            command_line = ?24, config_line = ?25,
                            tcps = COALESCE(?26, tcps), udps = COALESCE(?27, udps),
                            tcp_rx = COALESCE(?28, tcp_rx), tcp_tx = COALESCE(?29, tcp_tx),
                            udp_rx = COALESCE(?30, udp_rx), udp_tx = COALESCE(?31, udp_tx),
                            peer = COALESCE(?32, peer),
                            tags = COALESCE(?33, tags),
                            updated_at = ?34
                         WHERE id = ?1",
                        params![
                            id,
                            fields.name,
                            fields.alias,
                            fields.tunnel_type.map(TunnelType::as_str),
                            fields.status.map(TunnelStatus::as_str),
                            fields.tunnel_address,
                            fields.tunnel_port,
                            fields.target_address,
                            fields.target_port,
                            extend_json,
                            fields.tls_mode.map(TlsMode::as_str),
                            fields.log_level,
                            fields.password,
                            fields.cert_path,
                            fields.key_path,
                            fields.min,
                            fields.max,
                            fields.slot,
                            fields.pool,
                            fields.ping,
                            fields.mode,
                            fields.restart.map(|b| b as i64),
                            fields.listen_type.map(ListenType::as_str),
                            fields.command_line,
                            fields.config_line,
                            fields.tcps,
                            fields.udps,
                            fields.tcp_rx,
                            fields.tcp_tx,
                            fields.udp_rx,
                            fields.udp_tx,
                            fields.peer,
                            tags_json,
                            now,
                        ],
                    )
                    .map_err(AppError::from)?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO tunnels (
                            endpoint_id, instance_id, name, alias, type, status,
                            tunnel_address, tunnel_port, target_address, target_port,
                            extend_target_address, tls_mode, log_level,
                            password, cert_path, key_path,
                            min, max, slot, pool, ping, mode, restart, listen_type,
                            command_line, config_line, tcps, udps,
                            tcp_rx, tcp_tx, udp_rx, udp_tx, peer, tags,
                            created_at, updated_at
                         ) VALUES (
                            ?1, ?2, ?3, ?4, ?5, ?6,
                            ?7, ?8, ?9, ?10,
                            ?11, ?12, ?13,
                            ?14, ?15, ?16,
                            ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                            ?25, ?26, ?27, ?28,
                            ?29, ?30, ?31, ?32, ?33, ?34,
                            ?35, ?35
                         )",
                        params![
                            endpoint_id,
                            instance_id,
                            fields.name,
                            fields.alias,
                            fields.tunnel_type.unwrap_or(TunnelType::Server).as_str(),
                            fields.status.unwrap_or(TunnelStatus::Stopped).as_str(),
                            fields.tunnel_address,
                            fields.tunnel_port,
                            fields.target_address,
                            fields.target_port,
                            extend_json,
                            fields.tls_mode.unwrap_or(TlsMode::Inherit).as_str(),
                            fields.log_level.as_deref().unwrap_or("info"),
                            fields.password,
                            fields.cert_path,
                            fields.key_path,
                            fields.min,
                            fields.max,
                            fields.slot,
                            fields.pool,
                            fields.ping,
                            fields.mode,
                            fields.restart.unwrap_or(false) as i64,
                            fields.listen_type.unwrap_or(ListenType::All).as_str(),
                            fields.command_line,
                            fields.config_line,
                            fields.tcps,
                            fields.udps,
                            fields.tcp_rx.unwrap_or(0),
                            fields.tcp_tx.unwrap_or(0),
                            fields.udp_rx.unwrap_or(0),
                            fields.udp_tx.unwrap_or(0),
                            fields.peer,
                            tags_json.as_deref().unwrap_or("{}"),
                            now,
                        ],
                    )
                    .map_err(AppError::from)?;
                    let id = tx.last_insert_rowid();
                    recount_tunnels(&tx, endpoint_id)?;
                    id
                }
            };

            let tunnel = get_tunnel_inner(&tx, id)?;
            tx.commit().map_err(AppError::from)?;
            Ok(tunnel)
        })
    }

    /// Insert a tunnel that is not (yet) bound to an agent instance
    ///
    /// Used by the import path; the row's `instance_id` stays NULL until an
    /// agent snapshot binds it.
    pub fn insert_local_tunnel(&self, endpoint_id: i64, fields: &TunnelUpsert) -> AppResult<Tunnel> {
        let fields = fields.clone();
        self.with_retry(move |conn| {
            let tx = conn.transaction().map_err(AppError::from)?;
            let now = ts_to_sql(Utc::now());
            let tags_json = fields
                .tags
                .as_ref()
                .map(|t| serde_json::to_string(t).unwrap_or_else(|_| "{}".into()));
            let extend_json =
                serde_json::to_string(&fields.extend_target_address).unwrap_or_else(|_| "[]".into());
            tx.execute(
                "INSERT INTO tunnels (
                    endpoint_id, instance_id, name, alias, type, status,
                    tunnel_address, tunnel_port, target_address, target_port,
                    extend_target_address, tls_mode, log_level,
                    command_line, config_line, tags, created_at, updated_at
                 ) VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
                params![
                    endpoint_id,
                    fields.name,
                    fields.alias,
                    fields.tunnel_type.unwrap_or(TunnelType::Server).as_str(),
                    fields.status.unwrap_or(TunnelStatus::Stopped).as_str(),
                    fields.tunnel_address,
                    fields.tunnel_port,
                    fields.target_address,
                    fields.target_port,
                    extend_json,
                    fields.tls_mode.unwrap_or(TlsMode::Inherit).as_str(),
                    fields.log_level.as_deref().unwrap_or("info"),
                    fields.command_line,
                    fields.config_line,
                    tags_json.as_deref().unwrap_or("{}"),
                    now,
                ],
            )
            .map_err(AppError::from)?;
            let id = tx.last_insert_rowid();
            recount_tunnels(&tx, endpoint_id)?;
            let tunnel = get_tunnel_inner(&tx, id)?;
            tx.commit().map_err(AppError::from)?;
            Ok(tunnel)
        })
    }

    /// Apply one counter/gauge sample in a single statement
    pub fn update_tunnel_counters_atomic(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        counters: TunnelCounters,
        status: Option<TunnelStatus>,
    ) -> AppResult<()> {
        let instance_id = instance_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE tunnels SET
                    tcp_rx = COALESCE(?3, tcp_rx), tcp_tx = COALESCE(?4, tcp_tx),
                    udp_rx = COALESCE(?5, udp_rx), udp_tx = COALESCE(?6, udp_tx),
                    pool = COALESCE(?7, pool), ping = COALESCE(?8, ping),
                    tcps = COALESCE(?9, tcps), udps = COALESCE(?10, udps),
                    status = COALESCE(?11, status),
                    updated_at = ?12
                 WHERE endpoint_id = ?1 AND instance_id = ?2",
                params![
                    endpoint_id,
                    instance_id,
                    counters.tcp_rx,
                    counters.tcp_tx,
                    counters.udp_rx,
                    counters.udp_tx,
                    counters.pool,
                    counters.ping,
                    counters.tcps,
                    counters.udps,
                    status.map(TunnelStatus::as_str),
                    ts_to_sql(Utc::now()),
                ],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    /// Update operator-editable local fields (alias, sort weight, tags)
    pub fn update_tunnel_local_fields(
        &self,
        id: i64,
        alias: Option<&str>,
        sorts: Option<i64>,
        tags: Option<&HashMap<String, String>>,
    ) -> AppResult<Tunnel> {
        let alias = alias.map(str::to_string);
        let tags_json = tags.map(|t| serde_json::to_string(t).unwrap_or_else(|_| "{}".into()));
        self.with_retry(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tunnels SET
                        alias = COALESCE(?2, alias),
                        sorts = COALESCE(?3, sorts),
                        tags = COALESCE(?4, tags),
                        updated_at = ?5
                     WHERE id = ?1",
                    params![id, alias, sorts, tags_json, ts_to_sql(Utc::now())],
                )
                .map_err(AppError::from)?;
            if changed == 0 {
                return Err(AppError::not_found(format!("tunnel {id}")));
            }
            get_tunnel_inner(conn, id)
        })
    }

    /// Mark every tunnel of an endpoint with one status, in one transaction
    ///
    /// Used on `shutdown` frames and on supervisor-observed offline.
    pub fn set_endpoint_tunnels_status(
        &self,
        endpoint_id: i64,
        status: TunnelStatus,
    ) -> AppResult<usize> {
        self.with_retry(move |conn| {
            let n = conn
                .execute(
                    "UPDATE tunnels SET status = ?2, updated_at = ?3 WHERE endpoint_id = ?1",
                    params![endpoint_id, status.as_str(), ts_to_sql(Utc::now())],
                )
                .map_err(AppError::from)?;
            Ok(n)
        })
    }

    /// Delete a tunnel; if `preserve` is set, snapshot it into recycle first.
    ///
    /// The snapshot and the delete commit atomically, and the endpoint's
    /// tunnel count is recomputed in the same transaction.
    pub fn delete_tunnel_by_instance(
        &self,
        endpoint_id: i64,
        instance_id: &str,
    ) -> AppResult<Option<Tunnel>> {
        let instance_id = instance_id.to_string();
        self.with_retry(move |conn| {
            let tx = conn.transaction().map_err(AppError::from)?;
            let tunnel: Option<Tunnel> = tx
                .query_row(
                    "SELECT * FROM tunnels WHERE endpoint_id = ?1 AND instance_id = ?2",
                    params![endpoint_id, instance_id],
                    tunnel_from_row,
                )
                .optional()
                .map_err(AppError::from)?;

            let Some(tunnel) = tunnel else {
                // Already gone; deletes are idempotent from the agent's view
                return Ok(None);
            };

            if tunnel.wants_recycle() {
                super::recycle::insert_snapshot(&tx, &tunnel)?;
            }
            tx.execute("DELETE FROM tunnels WHERE id = ?1", params![tunnel.id])
                .map_err(AppError::from)?;
            recount_tunnels(&tx, endpoint_id)?;
            tx.commit().map_err(AppError::from)?;
            Ok(Some(tunnel))
        })
    }

    pub fn get_tunnel(&self, id: i64) -> AppResult<Tunnel> {
        self.with_retry(move |conn| get_tunnel_inner(conn, id))
    }

    pub fn get_tunnel_by_instance(&self, instance_id: &str) -> AppResult<Tunnel> {
        let instance_id = instance_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                "SELECT * FROM tunnels WHERE instance_id = ?1",
                params![instance_id],
                tunnel_from_row,
            )
            .optional()
            .map_err(AppError::from)?
            .ok_or_else(|| AppError::not_found(format!("tunnel instance {instance_id}")))
        })
    }

    pub fn list_tunnels_for_endpoint(&self, endpoint_id: i64) -> AppResult<Vec<Tunnel>> {
        self.with_retry(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM tunnels WHERE endpoint_id = ?1 ORDER BY sorts, id")
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![endpoint_id], tunnel_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Filtered, sorted, paginated tunnel list with the endpoint join
    pub fn query_tunnels(&self, query: &TunnelQueryParams) -> AppResult<TunnelQueryResult> {
        let query = query.clone();
        self.with_retry(move |conn| {
            let mut where_clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(search) = &query.search {
                let like = format!("%{}%", search);
                where_clauses.push(
                    "(t.name LIKE ? OR t.alias LIKE ? OR t.instance_id LIKE ?)".to_string(),
                );
                args.push(Box::new(like.clone()));
                args.push(Box::new(like.clone()));
                args.push(Box::new(like));
            }
            if let Some(status) = query.status {
                where_clauses.push("t.status = ?".to_string());
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(endpoint_id) = query.endpoint_id {
                where_clauses.push("t.endpoint_id = ?".to_string());
                args.push(Box::new(endpoint_id));
            }
            if let Some(port) = query.port {
                where_clauses.push("(t.tunnel_port = ? OR t.target_port = ?)".to_string());
                args.push(Box::new(port as i64));
                args.push(Box::new(port as i64));
            }
            if let Some(group) = &query.group {
                // tags is a JSON object; match the "group" key exactly
                where_clauses.push("json_extract(t.tags, '$.group') = ?".to_string());
                args.push(Box::new(group.clone()));
            }

            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            // Sort column is whitelisted; anything else falls back to sorts
            let sort_col = match query.sort_by.as_deref() {
                Some("name") => "t.name",
                Some("status") => "t.status",
                Some("created_at") => "t.created_at",
                Some("tcp_rx") => "t.tcp_rx",
                Some("tcp_tx") => "t.tcp_tx",
                Some("udp_rx") => "t.udp_rx",
                Some("udp_tx") => "t.udp_tx",
                _ => "t.sorts",
            };
            let direction = if query.sort_desc { "DESC" } else { "ASC" };

            let total: u64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM tunnels t {}", where_sql),
                    params_from_iter(args.iter().map(|a| a.as_ref())),
                    |row| row.get::<_, i64>(0),
                )
                .map_err(AppError::from)? as u64;

            let page_size = query.effective_page_size();
            let page = query.page.max(1);
            let offset = (page - 1) as i64 * page_size as i64;

            let sql = format!(
                "SELECT t.*, e.name AS endpoint_name, e.hostname AS endpoint_hostname,
                        e.version AS endpoint_version
                 FROM tunnels t
                 JOIN endpoints e ON e.id = t.endpoint_id
                 {}
                 ORDER BY {} {}, t.id ASC
                 LIMIT {} OFFSET {}",
                where_sql, sort_col, direction, page_size, offset
            );

            let mut stmt = conn.prepare(&sql).map_err(AppError::from)?;
            let items = stmt
                .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                    Ok(TunnelListItem {
                        tunnel: tunnel_from_row(row)?,
                        endpoint_name: row.get("endpoint_name")?,
                        endpoint_hostname: row.get("endpoint_hostname")?,
                        endpoint_version: row.get("endpoint_version")?,
                    })
                })
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;

            Ok(TunnelQueryResult {
                items,
                total,
                page,
                page_size,
            })
        })
    }
}

fn get_tunnel_inner(conn: &Connection, id: i64) -> AppResult<Tunnel> {
    conn.query_row(
        "SELECT * FROM tunnels WHERE id = ?1",
        params![id],
        tunnel_from_row,
    )
    .optional()
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::not_found(format!("tunnel {id}")))
}

pub(super) fn tunnel_from_row(row: &Row<'_>) -> rusqlite::Result<Tunnel> {
    let tunnel_type: String = row.get("type")?;
    let status: String = row.get("status")?;
    let tls_mode: String = row.get("tls_mode")?;
    let listen_type: String = row.get("listen_type")?;
    let extend_json: String = row.get("extend_target_address")?;
    let tags_json: String = row.get("tags")?;
    let restart: i64 = row.get("restart")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Tunnel {
        id: row.get("id")?,
        endpoint_id: row.get("endpoint_id")?,
        instance_id: row.get("instance_id")?,
        name: row.get("name")?,
        alias: row.get("alias")?,
        tunnel_type: TunnelType::parse(&tunnel_type).unwrap_or(TunnelType::Server),
        status: TunnelStatus::parse(&status).unwrap_or(TunnelStatus::Offline),
        tunnel_address: row.get("tunnel_address")?,
        tunnel_port: row.get::<_, i64>("tunnel_port")? as u16,
        target_address: row.get("target_address")?,
        target_port: row.get::<_, i64>("target_port")? as u16,
        extend_target_address: serde_json::from_str(&extend_json).unwrap_or_default(),
        tls_mode: TlsMode::parse(&tls_mode).unwrap_or(TlsMode::Inherit),
        log_level: row.get("log_level")?,
        password: row.get("password")?,
        cert_path: row.get("cert_path")?,
        key_path: row.get("key_path")?,
        min: row.get("min")?,
        max: row.get("max")?,
        slot: row.get("slot")?,
        pool: row.get("pool")?,
        ping: row.get("ping")?,
        mode: row.get("mode")?,
        restart: restart != 0,
        listen_type: ListenType::parse(&listen_type).unwrap_or(ListenType::All),
        command_line: row.get("command_line")?,
        config_line: row.get("config_line")?,
        sorts: row.get("sorts")?,
        tcps: row.get("tcps")?,
        udps: row.get("udps")?,
        tcp_rx: row.get("tcp_rx")?,
        tcp_tx: row.get("tcp_tx")?,
        udp_rx: row.get("udp_rx")?,
        udp_tx: row.get("udp_tx")?,
        peer: row.get("peer")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
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

    fn upsert_fields(name: &str) -> TunnelUpsert {
        TunnelUpsert {
            name: name.into(),
            tunnel_type: Some(TunnelType::Server),
            status: Some(TunnelStatus::Running),
            tunnel_address: "0.0.0.0".into(),
            tunnel_port: 10101,
            target_address: "127.0.0.1".into(),
            target_port: 8080,
            config_line: "server://0.0.0.0:10101/127.0.0.1:8080".into(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let (store, ep) = store_with_endpoint();
        let t1 = store
            .upsert_tunnel_by_instance(ep, "inst-1", &upsert_fields("web"))
            .unwrap();
        assert_eq!(t1.name, "web");
        assert_eq!(store.get_endpoint(ep).unwrap().tunnel_count, 1);

        let mut changed = upsert_fields("web-renamed");
        changed.status = Some(TunnelStatus::Stopped);
        let t2 = store
            .upsert_tunnel_by_instance(ep, "inst-1", &changed)
            .unwrap();
        assert_eq!(t2.id, t1.id);
        assert_eq!(t2.name, "web-renamed");
        assert_eq!(t2.status, TunnelStatus::Stopped);
        // Update must not bump the count
        assert_eq!(store.get_endpoint(ep).unwrap().tunnel_count, 1);
    }

    #[test]
    fn counters_update_atomically() {
        let (store, ep) = store_with_endpoint();
        store
            .upsert_tunnel_by_instance(ep, "inst-1", &upsert_fields("web"))
            .unwrap();
        store
            .update_tunnel_counters_atomic(
                ep,
                "inst-1",
                TunnelCounters {
                    tcp_rx: Some(1000),
                    tcp_tx: Some(500),
                    ping: Some(12),
                    pool: Some(4),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let t = store.get_tunnel_by_instance("inst-1").unwrap();
        assert_eq!(t.tcp_rx, 1000);
        assert_eq!(t.ping, Some(12));
        // Fields absent from the sample keep their previous value
        assert_eq!(t.udp_rx, 0);
    }

    #[test]
    fn delete_with_preserve_tag_recycles() {
        let (store, ep) = store_with_endpoint();
        let mut fields = upsert_fields("keep-me");
        let mut tags = HashMap::new();
        tags.insert("preserve".to_string(), "true".to_string());
        fields.tags = Some(tags);
        store
            .upsert_tunnel_by_instance(ep, "inst-1", &fields)
            .unwrap();

        let deleted = store.delete_tunnel_by_instance(ep, "inst-1").unwrap();
        assert!(deleted.is_some());
        assert_eq!(store.get_endpoint(ep).unwrap().tunnel_count, 0);
        let recycled = store.list_recycle(ep).unwrap();
        assert_eq!(recycled.len(), 1);
        assert_eq!(recycled[0].name, "keep-me");

        // Second delete is a no-op, not an error
        assert!(store.delete_tunnel_by_instance(ep, "inst-1").unwrap().is_none());
    }

    #[test]
    fn delete_without_tag_skips_recycle() {
        let (store, ep) = store_with_endpoint();
        store
            .upsert_tunnel_by_instance(ep, "inst-1", &upsert_fields("scratch"))
            .unwrap();
        store.delete_tunnel_by_instance(ep, "inst-1").unwrap();
        assert!(store.list_recycle(ep).unwrap().is_empty());
    }

    #[test]
    fn query_filters_and_paginates() {
        let (store, ep) = store_with_endpoint();
        for i in 0..25 {
            let mut fields = upsert_fields(&format!("tunnel-{i:02}"));
            fields.tunnel_port = 10000 + i as u16;
            if i % 2 == 0 {
                fields.status = Some(TunnelStatus::Stopped);
            }
            store
                .upsert_tunnel_by_instance(ep, &format!("inst-{i}"), &fields)
                .unwrap();
        }

        // Default page size
        let page = store.query_tunnels(&TunnelQueryParams::default()).unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 10);
        assert_eq!(page.page_size, 10);

        // Status filter
        let stopped = store
            .query_tunnels(&TunnelQueryParams {
                status: Some(TunnelStatus::Stopped),
                page_size: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stopped.total, 13);

        // Port filter matches listen port
        let by_port = store
            .query_tunnels(&TunnelQueryParams {
                port: Some(10007),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_port.total, 1);
        assert_eq!(by_port.items[0].tunnel.name, "tunnel-07");

        // Search by name, sorted descending
        let found = store
            .query_tunnels(&TunnelQueryParams {
                search: Some("tunnel-1".into()),
                sort_by: Some("name".into()),
                sort_desc: true,
                page_size: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.total, 10);
        assert_eq!(found.items[0].tunnel.name, "tunnel-19");
        assert_eq!(found.items[0].endpoint_name, "edge");
    }

    #[test]
    fn shutdown_marks_all_tunnels() {
        let (store, ep) = store_with_endpoint();
        for i in 0..3 {
            store
                .upsert_tunnel_by_instance(ep, &format!("inst-{i}"), &upsert_fields("t"))
                .unwrap();
        }
        let n = store
            .set_endpoint_tunnels_status(ep, TunnelStatus::Offline)
            .unwrap();
        assert_eq!(n, 3);
        for t in store.list_tunnels_for_endpoint(ep).unwrap() {
            assert_eq!(t.status, TunnelStatus::Offline);
        }
    }
}
