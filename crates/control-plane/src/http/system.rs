use axum::{Json, Router, extract::State, routing::get};
use common::api::HealthResponse;

use crate::app_state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::version::VERSION.to_string(),
        schema_version: state.schema.latest_applied,
        broker_connected: state.gateway.is_connected(),
    })
}
