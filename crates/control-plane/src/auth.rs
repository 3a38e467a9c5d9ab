use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, header::AUTHORIZATION},
    middleware::Next,
};
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
};

/// Bearer-token gate for the operator management surface. This is
/// infrastructure auth, not user auth; user sessions live in the layer
/// in front of this service.
pub async fn require_operator_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let token = extract_bearer_from_header(
        req.headers(),
        &state.operator_auth.header_name,
        "operator authorization header",
    )?;

    if !state.operator_auth.is_valid_token(&token) {
        warn!(path = %req.uri().path(), "operator auth rejected");
        return Err(AppError::forbidden("invalid operator token"));
    }

    Ok(next.run(req).await)
}

pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    extract_bearer_from_header(headers, &AUTHORIZATION, "authorization header")
}

pub fn extract_bearer_from_header(
    headers: &HeaderMap,
    header: &HeaderName,
    context: &str,
) -> ApiResult<String> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("missing {context}")))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("invalid {context}")))?;

    let prefix = "Bearer ";
    if !value.starts_with(prefix) {
        return Err(AppError::unauthorized(format!("invalid {context} scheme")));
    }

    Ok(value[prefix.len()..].to_string())
}
