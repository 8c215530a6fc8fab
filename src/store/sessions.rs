//! Browser session aggregate

use super::{ts_from_sql, ts_to_sql, Store};
use crate::error::{AppError, AppResult};
use crate::model::SessionRow;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

impl Store {
    pub fn insert_session(&self, session: &SessionRow) -> AppResult<()> {
        let session = session.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (session_id, username, expires_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    session.session_id,
                    session.username,
                    ts_to_sql(session.expires_at)
                ],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: &str) -> AppResult<Option<SessionRow>> {
        let session_id = session_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE session_id = ?1",
                params![session_id],
                session_from_row,
            )
            .optional()
            .map_err(AppError::from)
        })
    }

    pub fn delete_session(&self, session_id: &str) -> AppResult<()> {
        let session_id = session_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(AppError::from)?;
            Ok(())
        })
    }

    /// Drop sessions past their expiry; called opportunistically on login
    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.with_retry(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM sessions WHERE expires_at <= ?1",
                    params![ts_to_sql(now)],
                )
                .map_err(AppError::from)?;
            Ok(n as u64)
        })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let expires_at: String = row.get("expires_at")?;
    Ok(SessionRow {
        session_id: row.get("session_id")?,
        username: row.get("username")?,
        expires_at: ts_from_sql(&expires_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn session_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_session(&SessionRow {
                session_id: "abc".into(),
                username: "admin".into(),
                expires_at: now + Duration::hours(1),
            })
            .unwrap();

        let found = store.get_session("abc").unwrap().unwrap();
        assert_eq!(found.username, "admin");
        assert!(!found.is_expired(now));

        store.delete_session("abc").unwrap();
        assert!(store.get_session("abc").unwrap().is_none());
    }

    #[test]
    fn expired_sessions_are_purged() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_session(&SessionRow {
                session_id: "old".into(),
                username: "admin".into(),
                expires_at: now - Duration::hours(1),
            })
            .unwrap();
        store
            .insert_session(&SessionRow {
                session_id: "fresh".into(),
                username: "admin".into(),
                expires_at: now + Duration::hours(1),
            })
            .unwrap();

        assert_eq!(store.purge_expired_sessions(now).unwrap(), 1);
        assert!(store.get_session("old").unwrap().is_none());
        assert!(store.get_session("fresh").unwrap().is_some());
    }
}
