pub mod admission;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod rate_limit;
pub mod scheduler;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::http::HeaderName;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::admission::AdmissionController;
use crate::app_state::{AppState, OperatorAuth};
use crate::gateway::BrokerGateway;
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::scheduler::Scheduler;

/// Boot the control-plane and serve until the process is signalled.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let operator_tokens: Vec<String> = app_config
        .operator
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if operator_tokens.is_empty() {
        return Err(anyhow::anyhow!("operator.tokens cannot be empty"));
    }
    let operator_header = app_config
        .operator
        .header_name
        .parse::<HeaderName>()
        .map_err(|err| anyhow::anyhow!("invalid operator header name: {}", err))?;

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    let schema = persistence::migrations::run_migrations(&db_pool).await?;
    info!(
        current_version = schema.latest_applied,
        target_version = schema.latest_available,
        "database schema ready"
    );
    record_build_info(schema.latest_applied);

    let gateway = BrokerGateway::new(app_config.mqtt.clone());
    if let Err(err) = gateway.connect().await {
        // Callers reconnect on demand; a dead broker at boot only delays
        // telemetry, it does not stop the control-plane.
        warn!(%err, "initial broker connect failed");
    }

    let admission = AdmissionController::new(db_pool.clone(), &app_config.admission);
    tokio::spawn(admission::settings_refresh_loop(
        admission.clone(),
        Duration::from_secs(app_config.admission.settings_refresh_secs),
    ));

    let scheduler = Scheduler::new(db_pool.clone(), Arc::new(gateway.clone())).await?;
    scheduler.init().await?;

    let state = AppState {
        db: db_pool,
        gateway,
        scheduler,
        admission,
        operator_auth: OperatorAuth {
            tokens: operator_tokens,
            header_name: operator_header,
        },
        metrics_handle,
        schema,
    };

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app = http::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app = http::build_metrics_router().with_state(state.clone());
    let metrics_service = metrics_app.into_make_service();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control-plane listening");
    info!(%metrics_addr, "control-plane metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control-plane task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))?;
            metrics_task
                .await
                .map_err(|err| anyhow::anyhow!("control-plane metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane metrics server failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control-plane metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane metrics server failed: {err}"))?;
            api_task
                .await
                .map_err(|err| anyhow::anyhow!("control-plane task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))?;
        }
    }

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
