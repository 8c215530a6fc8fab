//! Error taxonomy shared across the control plane
//!
//! Every fallible surface that crosses a component boundary returns
//! [`AppError`], which carries one of a fixed set of kinds. The HTTP layer
//! maps kinds to status codes; the Store retry wrapper keys off
//! [`ErrorKind::Transient`] to decide whether a closure is worth re-running.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

/// Classification of an error, independent of where it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: malformed URL, invalid filter, broken config
    ConfigInvalid,
    /// The referenced entity does not exist
    NotFound,
    /// Uniqueness or state conflict (duplicate endpoint, tunnel already bound)
    Conflict,
    /// Missing or invalid credentials / session
    Unauthorized,
    /// The remote agent could not be reached
    UpstreamUnavailable,
    /// The remote agent answered with something we cannot interpret
    UpstreamProtocol,
    /// The remote agent does not support the requested operation
    /// (HTTP 404/405 on in-place update; caller falls back to delete+recreate)
    UpstreamUnsupported,
    /// DB busy / network blip; retried by the shared wrapper
    Transient,
    /// Anything else; a bug if it happens under normal operation
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::ConfigInvalid => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::UpstreamUnavailable | ErrorKind::UpstreamProtocol => {
                StatusCode::BAD_GATEWAY
            }
            // No native verb for "the agent can't do that"; 502 keeps the
            // caller's fallback logic on the upstream path
            ErrorKind::UpstreamUnsupported => StatusCode::BAD_GATEWAY,
            ErrorKind::Transient | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error with a kind and a human-readable message
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn upstream_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorKind::Transient
            }
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorKind::Conflict
            }
            _ => ErrorKind::Internal,
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        // Pool exhaustion / checkout timeout behaves like DB busy
        AppError::new(ErrorKind::Transient, err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            ErrorKind::UpstreamUnavailable
        } else if err.is_decode() {
            ErrorKind::UpstreamProtocol
        } else {
            ErrorKind::UpstreamUnavailable
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        if status.is_server_error() {
            tracing::error!("API error: {} - {}", status, self.message);
        } else {
            tracing::debug!("API error: {} - {}", status, self.message);
        }

        let body = Json(json!({
            "success": false,
            "error": self.message,
        }));

        (status, body).into_response()
    }
}

/// Shorthand result type for component boundaries
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(AppError::from(err).is_transient());
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let err = rusqlite::Error::QueryReturnedNoRows;
        assert_eq!(AppError::from(err).kind, ErrorKind::NotFound);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::ConfigInvalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::UpstreamUnavailable.status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
