use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::Error as SqlxError;

static METRICS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .add_global_label("app_version", crate::version::VERSION)
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub fn record_build_info(schema_version: Option<i64>) {
    gauge!(
        "control_plane_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA,
    )
    .set(1.0);
    gauge!("control_plane_schema_version").set(schema_version.unwrap_or_default() as f64);
}

pub fn record_snapshot_received() {
    counter!("control_plane_telemetry_snapshots_total").increment(1);
}

pub fn record_command_published(kind: &'static str) {
    counter!("control_plane_commands_published_total", "kind" => kind).increment(1);
}

pub fn record_command_failed(kind: &'static str) {
    counter!("control_plane_commands_failed_total", "kind" => kind).increment(1);
}

pub fn record_task_fired(kind: &'static str) {
    counter!("control_plane_scheduler_fires_total", "kind" => kind).increment(1);
}

pub fn record_admission_denied(reason: &'static str) {
    counter!("control_plane_admission_denied_total", "reason" => reason).increment(1);
}

pub fn record_auto_ban() {
    counter!("control_plane_admission_auto_bans_total").increment(1);
}

pub(crate) fn record_internal_error(err: &anyhow::Error) {
    counter!("control_plane_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::Io(_) => "io",
            _ => "other",
        };
        counter!("control_plane_db_errors_total", "kind" => kind).increment(1);
    }
}
