use axum::{Json, Router, extract::State, routing::get, routing::post};
use chrono::Utc;
use common::api::{CommandRequest, ControlResponse, DeviceSnapshot};
use tracing::info;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    gateway::GatewayError,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/device/control", post(send_command))
        .route("/api/device/snapshot", get(latest_snapshot))
}

/// Accepts a validated command and publishes it to the broker. The response
/// only acknowledges the publish; device-side effects show up in telemetry.
async fn send_command(
    State(state): State<AppState>,
    Json(body): Json<CommandRequest>,
) -> ApiResult<Json<ControlResponse>> {
    body.validate()
        .map_err(|err| AppError::bad_request(err.to_string()))?;

    if !state.gateway.is_connected() {
        info!("broker link down, connecting before command dispatch");
        state
            .gateway
            .connect()
            .await
            .map_err(|err| AppError::service_unavailable(format!("broker unavailable: {err}")))?;
    }

    match state.gateway.send_command(&body).await {
        Ok(()) => {
            info!(kind = body.kind(), "control command accepted for publish");
            Ok(Json(ControlResponse {
                success: true,
                message: "command accepted for publish".to_string(),
                timestamp: Utc::now(),
            }))
        }
        Err(GatewayError::NotConnected) => Err(AppError::service_unavailable("broker link lost")),
        Err(GatewayError::InvalidCommand(err)) => Err(AppError::bad_request(err.to_string())),
        Err(err) => Err(AppError::bad_gateway(format!("publish failed: {err}"))),
    }
}

async fn latest_snapshot(State(state): State<AppState>) -> ApiResult<Json<DeviceSnapshot>> {
    match state.gateway.latest_snapshot() {
        Some(snapshot) => Ok(Json(*snapshot)),
        None => Err(AppError::not_found("no telemetry received yet")),
    }
}
