//! Admin API endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiState, auth::require_admin_key};
use crate::Error;
use crate::commands::{CommandKind, Target};
use crate::devices::{DeviceSession, DeviceStatus};

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct BlockRequest {
    pub blocked: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Serialize)]
pub struct DeviceListResponse {
    pub success: bool,
    pub devices: Vec<DeviceSession>,
    pub count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResponse {
    pub success: bool,
    pub device_id: String,
    pub status: DeviceStatus,
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSentResponse {
    pub success: bool,
    pub message: &'static str,
    pub target_device_id: String,
    pub issued_at: i64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

pub(super) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(super) fn error_response(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.to_string(),
        }),
    )
}

/// Map a crate error to the status an admin caller should see
fn from_error(e: &Error) -> ApiError {
    let status = match e {
        Error::InvalidDeviceId(_) | Error::UnknownCommand(_) | Error::InvalidPath(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "admin request failed");
    }
    error_response(status, &e.to_string())
}

// --- Handlers ---

/// List every known device with its current status
async fn list_devices(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let control = &state.control;
    let mut devices = control
        .registry()
        .list()
        .await
        .map_err(|e| from_error(&e))?;

    // The gate's cache is the status the fleet actually enforces
    let gate = control.gate();
    if gate.is_populated() {
        for device in &mut devices {
            device.status = if gate.is_blocked(&device.id) {
                DeviceStatus::Blocked
            } else {
                DeviceStatus::Active
            };
        }
    }

    Ok(Json(DeviceListResponse {
        success: true,
        count: devices.len(),
        devices,
    }))
}

/// Block or unblock a device
async fn set_blocked(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<BlockResponse>, ApiError> {
    let status = if req.blocked {
        DeviceStatus::Blocked
    } else {
        DeviceStatus::Active
    };

    state
        .control
        .registry()
        .set_status(&device_id, status, req.reason.as_deref())
        .await
        .map_err(|e| from_error(&e))?;

    let verb = if req.blocked { "blocked" } else { "unblocked" };
    Ok(Json(BlockResponse {
        success: true,
        device_id,
        status,
        message: format!("Device {verb} successfully"),
    }))
}

/// Send a command to one device, or to every device with `"all"`
async fn send_command(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandSentResponse>, ApiError> {
    let (Some(device_id), Some(command)) = (
        req.device_id.filter(|id| !id.is_empty()),
        req.command.filter(|c| !c.is_empty()),
    ) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "deviceId and command are required",
        ));
    };

    let kind: CommandKind = command.parse().map_err(|e| from_error(&e))?;
    let target = Target::parse(&device_id).map_err(|e| from_error(&e))?;

    let issued = state
        .control
        .bus()
        .send(target, kind, req.data.unwrap_or(Value::Null))
        .await
        .map_err(|e| from_error(&e))?;

    Ok(Json(CommandSentResponse {
        success: true,
        message: "Command sent successfully",
        target_device_id: issued.target.as_wire().to_string(),
        issued_at: issued.issued_at,
    }))
}

/// Build admin router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{id}/block", post(set_blocked))
        .route("/commands", post(send_command))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_admin_key,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::path;

    #[test]
    fn errors_map_to_client_or_server_status() {
        let (status, _) = from_error(&Error::UnknownCommand("x".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = from_error(&Error::InvalidDeviceId(path::ALL_DEVICES.to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = from_error(&Error::StoreUnavailable);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
