//! Health and metrics HTTP surface for the scheduler service.
//!
//! Mirrors `examples/ticketing/src/server`'s health-check module, adapted to
//! report schedule-store and broker reachability instead of the ticketing
//! app's auth/event-bus dependencies. `scheduler_runtime::metrics::MetricsServer`
//! only installs the Prometheus recorder — binding `/metrics` to an HTTP
//! route is this binary's job, per that module's doc comment.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use scheduler_broker::AmqpBrokerGateway;
use scheduler_runtime::metrics::MetricsServer;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared state for the health/metrics router.
#[derive(Clone)]
pub struct AppState {
    /// Schedule store's connection pool, probed for liveness.
    pub pool: PgPool,
    /// Broker gateway, probed for liveness.
    pub broker: Arc<AmqpBrokerGateway>,
    /// Installed Prometheus recorder.
    pub metrics: Arc<MetricsServer>,
}

/// Readiness response body.
#[derive(Serialize)]
pub struct ReadinessResponse {
    /// Overall readiness: `database && broker`.
    pub ready: bool,
    /// `Postgres` connectivity.
    pub database: bool,
    /// AMQP broker connectivity.
    pub broker: bool,
}

/// Liveness/readiness probe target for an orchestrator.
///
/// Returns `200` if both the schedule store and the broker are reachable,
/// `503` otherwise.
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let broker = state.broker.is_connected();
    let ready = database && broker;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, database, broker }))
}

/// Serves the current Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics.render() {
        Some(text) => (StatusCode::OK, text),
        None => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
    }
}

/// Build the health/metrics router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}
