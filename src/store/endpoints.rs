//! Endpoint aggregate operations

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::{Endpoint, EndpointStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Fields required to register a new endpoint
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    pub color: Option<String>,
}

impl Store {
    /// Register an endpoint; `(url, api_path)` must be unique
    pub fn insert_endpoint(&self, new: &NewEndpoint) -> AppResult<Endpoint> {
        let new = new.clone();
        self.with_retry(move |conn| {
            let now = ts_to_sql(Utc::now());
            let result = conn.execute(
                "INSERT INTO endpoints (name, url, api_path, api_key, color, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'offline', ?6, ?6)",
                params![new.name, new.url, new.api_path, new.api_key, new.color, now],
            );
            match result {
                Ok(_) => {
                    let id = conn.last_insert_rowid();
                    get_endpoint_inner(conn, id)
                }
                Err(e) => {
                    let app: AppError = e.into();
                    if app.kind == crate::error::ErrorKind::Conflict {
                        Err(AppError::conflict(format!(
                            "endpoint already exists for {}{}",
                            new.url, new.api_path
                        )))
                    } else {
                        Err(app)
                    }
                }
            }
        })
    }

    /// Insert unless an endpoint with the same `(url, api_path)` exists
    ///
    /// Returns the endpoint and whether it was newly inserted. This is the
    /// import path; it must be idempotent.
    pub fn import_endpoint(&self, new: &NewEndpoint) -> AppResult<(Endpoint, bool)> {
        let new = new.clone();
        self.with_retry(move |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM endpoints WHERE url = ?1 AND api_path = ?2",
                    params![new.url, new.api_path],
                    |row| row.get(0),
                )
                .optional()
                .map_err(AppError::from)?;

            if let Some(id) = existing {
                return Ok((get_endpoint_inner(conn, id)?, false));
            }

            let now = ts_to_sql(Utc::now());
            conn.execute(
                "INSERT INTO endpoints (name, url, api_path, api_key, color, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'offline', ?6, ?6)",
                params![new.name, new.url, new.api_path, new.api_key, new.color, now],
            )
            .map_err(AppError::from)?;
            let id = conn.last_insert_rowid();
            Ok((get_endpoint_inner(conn, id)?, true))
        })
    }

    /// Update the operator-editable fields
    pub fn update_endpoint(
        &self,
        id: i64,
        name: &str,
        url: &str,
        api_path: &str,
        api_key: &str,
        color: Option<&str>,
    ) -> AppResult<Endpoint> {
        let (name, url, api_path, api_key) = (
            name.to_string(),
            url.to_string(),
            api_path.to_string(),
            api_key.to_string(),
        );
        let color = color.map(str::to_string);
        self.with_retry(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE endpoints SET name = ?2, url = ?3, api_path = ?4, api_key = ?5,
                            color = ?6, updated_at = ?7
                     WHERE id = ?1",
                    params![id, name, url, api_path, api_key, color, ts_to_sql(Utc::now())],
                )
                .map_err(AppError::from)?;
            if changed == 0 {
                return Err(AppError::not_found(format!("endpoint {id}")));
            }
            get_endpoint_inner(conn, id)
        })
    }

    /// Record a supervisor-observed status transition
    pub fn set_endpoint_status(
        &self,
        id: i64,
        status: EndpointStatus,
        last_check: DateTime<Utc>,
    ) -> AppResult<()> {
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE endpoints SET status = ?2, last_check = ?3, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts_to_sql(last_check)],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    /// Store agent-reported facts from the initial frame
    pub fn set_endpoint_info(
        &self,
        id: i64,
        hostname: Option<&str>,
        version: Option<&str>,
        tls: Option<&str>,
        log: Option<&str>,
    ) -> AppResult<()> {
        let (hostname, version, tls, log) = (
            hostname.map(str::to_string),
            version.map(str::to_string),
            tls.map(str::to_string),
            log.map(str::to_string),
        );
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE endpoints SET
                    hostname = COALESCE(?2, hostname),
                    version = COALESCE(?3, version),
                    tls = COALESCE(?4, tls),
                    log = COALESCE(?5, log),
                    updated_at = ?6
                 WHERE id = ?1",
                params![id, hostname, version, tls, log, ts_to_sql(Utc::now())],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    pub fn get_endpoint(&self, id: i64) -> AppResult<Endpoint> {
        self.with_retry(move |conn| get_endpoint_inner(conn, id))
    }

    pub fn list_endpoints(&self) -> AppResult<Vec<Endpoint>> {
        self.with_retry(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM endpoints ORDER BY name, id")
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map([], endpoint_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    /// Delete an endpoint; tunnels, raw events, and recycle rows cascade.
    ///
    /// Returns the deleted row so the caller can remove the file-log
    /// directory and stop the supervisor.
    pub fn delete_endpoint(&self, id: i64) -> AppResult<Endpoint> {
        self.with_retry(move |conn| {
            let tx = conn.transaction().map_err(AppError::from)?;
            let endpoint = {
                let ep = tx
                    .query_row(
                        "SELECT * FROM endpoints WHERE id = ?1",
                        params![id],
                        endpoint_from_row,
                    )
                    .optional()
                    .map_err(AppError::from)?;
                ep.ok_or_else(|| AppError::not_found(format!("endpoint {id}")))?
            };
            tx.execute("DELETE FROM endpoints WHERE id = ?1", params![id])
                .map_err(AppError::from)?;
            tx.commit().map_err(AppError::from)?;
            Ok(endpoint)
        })
    }
}

/// Recompute the denormalised tunnel count inside the caller's transaction
pub(super) fn recount_tunnels(conn: &Connection, endpoint_id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE endpoints SET tunnel_count =
            (SELECT COUNT(*) FROM tunnels WHERE endpoint_id = ?1)
         WHERE id = ?1",
        params![endpoint_id],
    )
    .map_err(AppError::from)?;
    Ok(())
}

fn get_endpoint_inner(conn: &Connection, id: i64) -> AppResult<Endpoint> {
    conn.query_row(
        "SELECT * FROM endpoints WHERE id = ?1",
        params![id],
        endpoint_from_row,
    )
    .optional()
    .map_err(AppError::from)?
    .ok_or_else(|| AppError::not_found(format!("endpoint {id}")))
}

pub(super) fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Endpoint> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_check: Option<String> = row.get("last_check")?;
    Ok(Endpoint {
        id: row.get("id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        api_path: row.get("api_path")?,
        api_key: row.get("api_key")?,
        hostname: row.get("hostname")?,
        status: EndpointStatus::parse(&status).unwrap_or(EndpointStatus::Offline),
        tunnel_count: row.get("tunnel_count")?,
        version: row.get("version")?,
        tls: row.get("tls")?,
        log: row.get("log")?,
        color: row.get("color")?,
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
        last_check: last_check.as_deref().map(ts_from_sql),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(url: &str) -> NewEndpoint {
        NewEndpoint {
            name: "edge-1".into(),
            url: url.into(),
            api_path: "/api/v1".into(),
            api_key: "secret".into(),
            color: None,
        }
    }

    #[test]
    fn insert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let ep = store.insert_endpoint(&sample("http://10.0.0.2:3000")).unwrap();
        assert_eq!(ep.status, EndpointStatus::Offline);
        assert_eq!(ep.tunnel_count, 0);
        assert_eq!(store.get_endpoint(ep.id).unwrap().name, "edge-1");
    }

    #[test]
    fn duplicate_url_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.insert_endpoint(&sample("http://a:1")).unwrap();
        let err = store.insert_endpoint(&sample("http://a:1")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn import_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let (_, inserted) = store.import_endpoint(&sample("http://a:1")).unwrap();
        assert!(inserted);
        let (_, inserted) = store.import_endpoint(&sample("http://a:1")).unwrap();
        assert!(!inserted);
        assert_eq!(store.list_endpoints().unwrap().len(), 1);
    }

    #[test]
    fn status_transition_persists() {
        let store = Store::open_in_memory().unwrap();
        let ep = store.insert_endpoint(&sample("http://a:1")).unwrap();
        let now = Utc::now();
        store
            .set_endpoint_status(ep.id, EndpointStatus::Online, now)
            .unwrap();
        let ep = store.get_endpoint(ep.id).unwrap();
        assert_eq!(ep.status, EndpointStatus::Online);
        assert!(ep.last_check.is_some());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.delete_endpoint(42).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
