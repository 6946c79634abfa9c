//! Scheduler Service
//!
//! Runs the database-backed, event-driven scheduling subsystem: the
//! reminder/notification and status-transition daemons, their paired retry
//! daemons, and a `/healthz` + `/metrics` HTTP surface.
//!
//! # Usage
//!
//! ```bash
//! # Apply migrations and declare broker topology, then exit without
//! # starting any daemon.
//! scheduler-service --migrate-only
//!
//! # Run the service.
//! scheduler-service
//! ```

use scheduler_runtime::metrics::MetricsServer;
use scheduler_service::{Config, ServiceApp};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,scheduler_service=debug,scheduler_runtime=debug,sqlx=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let migrate_only = std::env::args().any(|arg| arg == "--migrate-only");

    tracing::info!("starting scheduler service");
    let config = Config::from_env();

    let app = match ServiceApp::new(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup failure");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("✓ service resources initialized");

    if migrate_only {
        tracing::info!("--migrate-only: migrations and topology applied, exiting");
        return ExitCode::SUCCESS;
    }

    let mut metrics_server = MetricsServer::new(
        format!("{}:{}", app.config().server.host, app.config().server.port)
            .parse()
            .unwrap_or_else(|_| "0.0.0.0:9090".parse().expect("fallback address is valid")),
    );
    if let Err(e) = metrics_server.start() {
        tracing::error!(error = %e, "fatal failure installing metrics recorder");
        return ExitCode::FAILURE;
    }

    let health_state = scheduler_service::health::AppState {
        pool: app.pool().clone(),
        broker: app.broker(),
        metrics: Arc::new(metrics_server),
    };
    let router = scheduler_service::health::build_router(health_state);

    let listener = match tokio::net::TcpListener::bind((
        app.config().server.host.as_str(),
        app.config().server.port,
    ))
    .await
    {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "fatal failure binding health/metrics listener");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        host = %app.config().server.host,
        port = app.config().server.port,
        "serving /healthz and /metrics"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon_handles = app.spawn_daemons(&shutdown_rx);

    let server_shutdown_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(server_shutdown_rx))
            .await
    });

    tracing::info!("scheduler service is running, press Ctrl+C to shut down");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown signalled, waiting for daemons to finish their current round");
    let _ = shutdown_tx.send(true);

    let mut failed = false;
    for handle in daemon_handles {
        if handle.await.is_err() {
            failed = true;
        }
    }
    if server_handle.await.is_err() {
        failed = true;
    }

    if failed {
        tracing::error!("one or more tasks exited with an error during shutdown");
        ExitCode::FAILURE
    } else {
        tracing::info!("shut down cleanly");
        ExitCode::SUCCESS
    }
}

/// Resolves once `shutdown` is set to `true`, for `axum::serve`'s graceful
/// shutdown hook.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
