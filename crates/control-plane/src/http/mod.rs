use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
};

mod admin;
mod control;
mod stream;
mod system;
mod tasks;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            code: self.code.to_string(),
        });
        let mut response = (self.status, body).into_response();
        if let Some(extra) = self.headers {
            for (name, value) in extra.iter() {
                response.headers_mut().insert(name.clone(), value.clone());
            }
        }
        response
    }
}

pub fn build_router(state: AppState) -> Router<AppState> {
    let api = Router::<AppState>::new()
        .merge(control::router())
        .merge(stream::router())
        .merge(tasks::router())
        .merge(admin::router(state.clone()))
        .layer(middleware::from_fn_with_state(state, admission_guard));

    Router::<AppState>::new().merge(system::router()).merge(api)
}

pub fn build_metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(render_metrics))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// Consulted on every API request before any handler runs. Denials are 429
/// for rate limiting (back off and retry) and 403 for bans (stop).
pub async fn admission_guard(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> ApiResult<Response> {
    let ip = client_ip(&req);
    let decision = state.admission.check(&ip).await;

    if decision.allowed {
        return Ok(next.run(req).await);
    }

    if decision.banned {
        crate::metrics::record_admission_denied("banned");
        return Err(AppError::banned("access denied").with_headers(decision.headers()));
    }

    crate::metrics::record_admission_denied("rate_limited");
    Err(AppError::too_many_requests("rate limit exceeded").with_headers(decision.headers()))
}

/// Client identity for admission control, CDN-aware: Cloudflare header, then
/// the first X-Forwarded-For hop, then X-Real-IP, then the socket peer.
fn client_ip<B>(req: &Request<B>) -> String {
    if let Some(ip) = header_str(req, "cf-connecting-ip") {
        return ip.to_string();
    }

    if let Some(forwarded) = header_str(req, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(ip) = header_str(req, "x-real-ip") {
        return ip.to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown-ip".to_string())
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
