//! Session authentication
//!
//! A single configured operator account; passwords are compared as SHA-256
//! digests and never kept in plaintext past config load. Sessions are
//! stored rows validated on each protected request, with opportunistic
//! purging of expired ones.

use crate::config::AuthConfig;
use crate::error::{AppError, AppResult};
use crate::model::SessionRow;
use crate::store::Store;
use chrono::Utc;
use sha2::{Digest, Sha256};

/// hex(sha256(password)); also used at config load
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Opaque, unguessable session token
///
/// Hashes process-unique entropy (RandomState seed) with the timestamp;
/// no dedicated RNG dependency needed for a single-operator control plane.
fn generate_token() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = Sha256::new();
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    for _ in 0..4 {
        hasher.update(RandomState::new().build_hasher().finish().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Login/validate/logout over the stored session table
#[derive(Clone)]
pub struct AuthService {
    store: Store,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(store: Store, config: AuthConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Verify credentials and mint a session
    pub fn login(&self, username: &str, password: &str) -> AppResult<SessionRow> {
        // Expired sessions pile up only as fast as logins happen
        let _ = self.store.purge_expired_sessions(Utc::now());

        if username != self.config.username || hash_password(password) != self.config.password_hash
        {
            return Err(AppError::unauthorized("invalid username or password"));
        }

        let session = SessionRow {
            session_id: generate_token(),
            username: username.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.config.session_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
        };
        self.store.insert_session(&session)?;
        tracing::info!(user = username, "Session created");
        Ok(session)
    }

    /// Resolve a token to its live session
    pub fn validate(&self, token: &str) -> AppResult<SessionRow> {
        let session = self
            .store
            .get_session(token)?
            .ok_or_else(|| AppError::unauthorized("unknown session"))?;
        if session.is_expired(Utc::now()) {
            let _ = self.store.delete_session(token);
            return Err(AppError::unauthorized("session expired"));
        }
        Ok(session)
    }

    pub fn is_authenticated(&self, token: &str) -> bool {
        self.validate(token).is_ok()
    }

    pub fn logout(&self, token: &str) -> AppResult<()> {
        self.store.delete_session(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service(ttl: Duration) -> AuthService {
        let store = Store::open_in_memory().unwrap();
        AuthService::new(
            store,
            AuthConfig {
                enabled: true,
                username: "admin".into(),
                password_hash: hash_password("hunter2"),
                session_ttl: ttl,
            },
        )
    }

    #[test]
    fn login_validate_logout() {
        let auth = service(Duration::from_secs(3600));
        let session = auth.login("admin", "hunter2").unwrap();
        assert!(auth.is_authenticated(&session.session_id));

        auth.logout(&session.session_id).unwrap();
        assert!(!auth.is_authenticated(&session.session_id));
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let auth = service(Duration::from_secs(3600));
        assert!(auth.login("admin", "wrong").is_err());
        assert!(auth.login("root", "hunter2").is_err());
    }

    #[test]
    fn expired_sessions_fail_validation() {
        let auth = service(Duration::from_secs(0));
        let session = auth.login("admin", "hunter2").unwrap();
        assert!(!auth.is_authenticated(&session.session_id));
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
