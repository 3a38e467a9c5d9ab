use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;

use crate::{
    admission::AdmissionController, gateway::BrokerGateway, persistence, scheduler::Scheduler,
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub gateway: BrokerGateway,
    pub scheduler: Scheduler,
    pub admission: AdmissionController,
    pub operator_auth: OperatorAuth,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

/// Operator authentication configuration.
#[derive(Clone)]
pub struct OperatorAuth {
    pub tokens: Vec<String>,
    pub header_name: HeaderName,
}

impl OperatorAuth {
    pub fn is_valid_token(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| {
            if token.len() != candidate.len() {
                return false;
            }
            token.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
