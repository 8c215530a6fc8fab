//! Version endpoint

use super::ok;
use axum::Json;
use serde_json::json;

/// GET /api/version/current
pub async fn current() -> Json<serde_json::Value> {
    ok(json!({ "version": crate::config::VERSION }))
}
