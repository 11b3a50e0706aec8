//! Device gate middleware

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::ApiState;
use crate::gate::{Decision, RequestInfo};

/// Header carrying the caller's device id
pub const DEVICE_ID_HEADER: &str = "x-device-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Gate-relevant facts about a request
fn request_info(req: &Request) -> RequestInfo {
    let headers = req.headers();
    let forwarded = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    RequestInfo {
        device_id: header(headers, DEVICE_ID_HEADER).map(ToString::to_string),
        endpoint: req.uri().path().to_string(),
        user_agent: header(headers, "user-agent").map(ToString::to_string),
        ip_address: forwarded.or(peer),
    }
}

/// Reject requests from blocked devices with 403
pub async fn require_unblocked_device(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    match state.control.gate().check(&request_info(&req)) {
        Decision::Allow => next.run(req).await,
        Decision::Deny(body) => (StatusCode::FORBIDDEN, Json(body)).into_response(),
    }
}
