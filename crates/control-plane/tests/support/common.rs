#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderName, Request as HttpRequest, StatusCode, header::CONTENT_TYPE},
    response::Response,
};
use control_plane::{
    admission::AdmissionController,
    app_state::{AppState, OperatorAuth},
    config::{AdmissionConfig, MqttConfig},
    gateway::BrokerGateway,
    http::{build_metrics_router, build_router},
    metrics::{init_metrics_recorder, record_build_info},
    persistence as db,
    persistence::migrations,
    scheduler::Scheduler,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";

pub struct TestApp {
    pub app: Router,
    pub metrics_app: Router,
    pub db: db::Db,
    pub state: AppState,
}

pub fn default_admission() -> AdmissionConfig {
    AdmissionConfig {
        limit: 1000,
        window_secs: 60,
        violation_limit: 100,
        ban_duration_secs: 3600,
        settings_refresh_secs: 60,
        cleanup_interval_secs: 300,
    }
}

/// Broker config pointing at a port nothing listens on, so connect attempts
/// fail fast and tests exercise the disconnected paths deterministically.
pub fn unreachable_mqtt() -> MqttConfig {
    MqttConfig {
        host: "127.0.0.1".into(),
        port: 1,
        username: String::new(),
        password: String::new(),
        use_tls: false,
        keep_alive_secs: 60,
        connect_timeout_secs: 1,
        telemetry_topic: "canopy/env_data".into(),
        command_topic: "canopy/cmd/set".into(),
    }
}

pub async fn setup_app() -> TestApp {
    setup_app_with_admission(default_admission()).await
}

pub async fn setup_app_with_admission(admission_cfg: AdmissionConfig) -> TestApp {
    let pool = migrations::init_pool("sqlite::memory:").await.expect("db init");
    let schema = migrations::run_migrations(&pool).await.expect("migrations");
    let metrics_handle = init_metrics_recorder();
    record_build_info(schema.latest_applied);

    let gateway = BrokerGateway::new(unreachable_mqtt());
    let admission = AdmissionController::new(pool.clone(), &admission_cfg);
    let scheduler = Scheduler::new(pool.clone(), Arc::new(gateway.clone()))
        .await
        .expect("scheduler");
    scheduler.init().await.expect("scheduler init");

    let state = AppState {
        db: pool.clone(),
        gateway,
        scheduler,
        admission,
        operator_auth: OperatorAuth {
            tokens: vec![TEST_OPERATOR_TOKEN.to_string()],
            header_name: HeaderName::from_static("authorization"),
        },
        metrics_handle,
        schema,
    };

    let app = build_router(state.clone()).with_state(state.clone());
    let metrics_app = build_metrics_router().with_state(state.clone());

    TestApp {
        app,
        metrics_app,
        db: pool,
        state,
    }
}

pub fn json_request(
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn operator_request(
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header("authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"));
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn client_request(method: &str, uri: &str, client_ip: &str) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", client_ip)
        .body(Body::empty())
        .unwrap()
}

pub async fn send(app: &Router, request: HttpRequest<Body>) -> Response {
    app.clone().oneshot(request).await.expect("request")
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn send_json(
    app: &Router,
    request: HttpRequest<Body>,
) -> (StatusCode, serde_json::Value) {
    let response = send(app, request).await;
    let status = response.status();
    (status, body_json(response).await)
}
