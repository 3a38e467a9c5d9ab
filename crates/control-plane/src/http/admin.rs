use axum::{
    Json, Router,
    extract::{Query, State},
    middleware,
    routing::get,
};
use common::api::{BanCreateRequest, BanListResponse, BanResponse, BanSource, RateLimitSettings};
use serde::Deserialize;
use tracing::info;

use crate::{
    app_state::AppState,
    auth::require_operator_auth,
    error::{ApiResult, AppError},
    persistence::bans::{self, BanOrigin, BannedClientRecord, NewBan},
    persistence::settings as settings_store,
};

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/admin/bans",
            get(list_bans).post(create_ban).delete(remove_ban),
        )
        .route(
            "/api/admin/rate-limit",
            get(get_rate_limit).put(update_rate_limit),
        )
        .layer(middleware::from_fn_with_state(state, require_operator_auth))
}

async fn list_bans(State(state): State<AppState>) -> ApiResult<Json<BanListResponse>> {
    let records = bans::list_bans(&state.db).await?;
    let bans = records.into_iter().map(to_response).collect();
    Ok(Json(BanListResponse { bans }))
}

/// Operator-issued ban. Persists durably and primes the admission cache so
/// the ban takes effect on the next request without waiting for a restart.
async fn create_ban(
    State(state): State<AppState>,
    Json(body): Json<BanCreateRequest>,
) -> ApiResult<Json<BanResponse>> {
    let ip = body.ip.trim();
    if ip.is_empty() {
        return Err(AppError::bad_request("ip cannot be empty"));
    }

    let record = bans::insert_ban(
        &state.db,
        NewBan {
            ip: ip.to_string(),
            reason: body.reason.clone(),
            source: BanOrigin::Manual,
            banned_by: Some("operator".to_string()),
            expires_at: body.expires_at,
        },
    )
    .await?;

    state.admission.seed_ban(ip, body.expires_at);
    info!(ip, "manual ban created");

    Ok(Json(to_response(record)))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    ip: String,
}

/// Lifts a ban in the durable store and drops the client's local admission
/// state. The durable store is authoritative, so this alone is enough even
/// when another check is mid-flight.
async fn remove_ban(
    State(state): State<AppState>,
    Query(params): Query<RemoveParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = bans::delete_ban(&state.db, &params.ip).await?;
    if deleted == 0 {
        return Err(AppError::not_found("ban not found"));
    }

    state.admission.clear_client(&params.ip);
    info!(ip = %params.ip, "ban removed");

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn get_rate_limit(State(state): State<AppState>) -> ApiResult<Json<RateLimitSettings>> {
    let settings = settings_store::get_rate_limit_settings(&state.db).await?;
    Ok(Json(settings))
}

/// Writes the durable settings row and applies the values to the live
/// controller immediately; other processes pick them up on their next
/// refresh tick.
async fn update_rate_limit(
    State(state): State<AppState>,
    Json(body): Json<RateLimitSettings>,
) -> ApiResult<Json<RateLimitSettings>> {
    if body.window_secs == 0 {
        return Err(AppError::bad_request("window_secs must be > 0"));
    }
    if body.violation_limit == 0 {
        return Err(AppError::bad_request("violation_limit must be > 0"));
    }

    settings_store::update_rate_limit_settings(&state.db, &body).await?;
    state.admission.apply_settings(body);
    info!(
        limit = body.limit,
        window_secs = body.window_secs,
        "rate limit settings updated"
    );

    Ok(Json(body))
}

fn to_response(record: BannedClientRecord) -> BanResponse {
    BanResponse {
        ip: record.ip,
        reason: record.reason,
        source: match record.source {
            BanOrigin::Auto => BanSource::Auto,
            BanOrigin::Manual => BanSource::Manual,
        },
        banned_by: record.banned_by,
        expires_at: record.expires_at,
        created_at: record.created_at,
    }
}
