//! Recycle aggregate: soft-deleted tunnel snapshots

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::{RecycleEntry, Tunnel, TunnelType};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Snapshot a tunnel inside the caller's delete transaction
///
/// Called by the tunnel delete path so the snapshot and the delete commit
/// or roll back together.
pub(super) fn insert_snapshot(conn: &Connection, tunnel: &Tunnel) -> AppResult<()> {
    let tags_json = serde_json::to_string(&tunnel.tags).unwrap_or_else(|_| "{}".into());
    conn.execute(
        "INSERT INTO recycle (endpoint_id, name, type, config_line, command_line, tags, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            tunnel.endpoint_id,
            tunnel.name,
            tunnel.tunnel_type.as_str(),
            tunnel.config_line,
            tunnel.command_line,
            tags_json,
            ts_to_sql(Utc::now()),
        ],
    )
    .map_err(AppError::from)?;
    Ok(())
}

impl Store {
    pub fn list_recycle(&self, endpoint_id: i64) -> AppResult<Vec<RecycleEntry>> {
        self.with_retry(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM recycle WHERE endpoint_id = ?1 ORDER BY deleted_at DESC, id DESC",
                )
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![endpoint_id], recycle_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    pub fn list_all_recycle(&self) -> AppResult<Vec<RecycleEntry>> {
        self.with_retry(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM recycle ORDER BY deleted_at DESC, id DESC")
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map([], recycle_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    pub fn get_recycle(&self, id: i64) -> AppResult<RecycleEntry> {
        self.with_retry(move |conn| {
            conn.query_row("SELECT * FROM recycle WHERE id = ?1", params![id], recycle_from_row)
                .optional()
                .map_err(AppError::from)?
                .ok_or_else(|| AppError::not_found(format!("recycle entry {id}")))
        })
    }

    pub fn delete_recycle(&self, id: i64) -> AppResult<()> {
        self.with_retry(move |conn| {
            let n = conn
                .execute("DELETE FROM recycle WHERE id = ?1", params![id])
                .map_err(AppError::from)?;
            if n == 0 {
                return Err(AppError::not_found(format!("recycle entry {id}")));
            }
            Ok(())
        })
    }
}

fn recycle_from_row(row: &Row<'_>) -> rusqlite::Result<RecycleEntry> {
    let tunnel_type: String = row.get("type")?;
    let tags_json: String = row.get("tags")?;
    let deleted_at: String = row.get("deleted_at")?;
    Ok(RecycleEntry {
        id: row.get("id")?,
        endpoint_id: row.get("endpoint_id")?,
        name: row.get("name")?,
        tunnel_type: TunnelType::parse(&tunnel_type).unwrap_or(TunnelType::Server),
        config_line: row.get("config_line")?,
        command_line: row.get("command_line")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        deleted_at: ts_from_sql(&deleted_at),
    })
}
