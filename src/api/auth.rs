//! Admin key check for the `/api/admin` routes

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};

use super::ApiState;
use super::admin::{ApiError, error_response};

/// Admin key carried as `Authorization: Bearer <key>`; the scheme is
/// case-insensitive
fn bearer_key(req: &Request) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, key) = value.split_once(' ')?;
    let key = key.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !key.is_empty()).then_some(key)
}

/// Refuse admin calls that do not carry the configured key
pub async fn require_admin_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // No key configured: the router warned once at startup
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    match bearer_key(&req) {
        Some(key) if key == expected => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "admin call with wrong key");
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid API key"))
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "admin call without key");
            Err(error_response(StatusCode::UNAUTHORIZED, "API key required"))
        }
    }
}
