//! Operation log aggregate: append-only audit rows for the dashboard

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::{OperationLogRow, OperationStatus};
use chrono::Utc;
use rusqlite::{params, Row};

impl Store {
    pub fn append_operation(
        &self,
        action: &str,
        tunnel_name: &str,
        status: OperationStatus,
        message: Option<&str>,
    ) -> AppResult<()> {
        let (action, tunnel_name) = (action.to_string(), tunnel_name.to_string());
        let message = message.map(str::to_string);
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO operation_log (action, tunnel_name, status, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    action,
                    tunnel_name,
                    status.as_str(),
                    message,
                    ts_to_sql(Utc::now())
                ],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    /// Newest first
    pub fn list_operations(&self, limit: u32, offset: u32) -> AppResult<Vec<OperationLogRow>> {
        self.with_retry(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM operation_log
                     ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )
                .map_err(AppError::from)?;
            let rows = stmt
                .query_map(params![limit.min(1000) as i64, offset as i64], oplog_from_row)
                .map_err(AppError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::from)?;
            Ok(rows)
        })
    }

    pub fn count_operations(&self) -> AppResult<u64> {
        self.with_retry(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM operation_log", [], |row| row.get(0))
                .map_err(AppError::from)?;
            Ok(n as u64)
        })
    }

    pub fn clear_operations(&self) -> AppResult<u64> {
        self.with_retry(|conn| {
            let n = conn
                .execute("DELETE FROM operation_log", [])
                .map_err(AppError::from)?;
            Ok(n as u64)
        })
    }
}

fn oplog_from_row(row: &Row<'_>) -> rusqlite::Result<OperationLogRow> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(OperationLogRow {
        id: row.get("id")?,
        action: row.get("action")?,
        tunnel_name: row.get("tunnel_name")?,
        status: OperationStatus::parse(&status).unwrap_or(OperationStatus::Pending),
        message: row.get("message")?,
        created_at: ts_from_sql(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_list_clear() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_operation("create", "web", OperationStatus::Success, None)
            .unwrap();
        store
            .append_operation("delete", "web", OperationStatus::Failed, Some("agent 502"))
            .unwrap();

        let rows = store.list_operations(10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "delete");
        assert_eq!(store.count_operations().unwrap(), 2);

        assert_eq!(store.clear_operations().unwrap(), 2);
        assert!(store.list_operations(10, 0).unwrap().is_empty());
    }
}
