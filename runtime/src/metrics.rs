//! Prometheus metrics for observability and monitoring.
//!
//! This module installs the global Prometheus recorder and registers
//! descriptions for every metric the scheduling subsystem emits:
//! - Schedule row lifecycle (insert, claim, exhaustion)
//! - Dispatch latency and outcome
//! - Dead-letter queue retries and abandonment
//! - Notification channel reconnects
//! - Circuit breaker state and retry attempts (generic ambient infra, shared
//!   by every crate that reaches for [`crate::retry`] or
//!   [`crate::circuit_breaker`])
//!
//! # Example
//!
//! ```rust,no_run
//! use scheduler_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Render current metrics text for an HTTP handler to serve.
//! let _text = server.render();
//! # Ok(())
//! # }
//! ```
//!
//! `start()` only installs the recorder; it does not itself bind an HTTP
//! listener. The binary crate serves `render()`'s output on its own
//! `/metrics` route.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics recorder.
///
/// Installs the global recorder and renders current metric state as text;
/// binding an HTTP listener for `/metrics` is the binary crate's job.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to the given address (informational
    /// only — `start` does not itself listen on `addr`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the global Prometheus
    /// recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built. If a recorder is
    /// already installed (common across tests in the same process), this is
    /// treated as success rather than an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "scheduler.rows.inserted",
        "Total number of schedule rows inserted"
    );
    describe_counter!(
        "scheduler.rows.exhausted",
        "Total number of schedule rows cancelled for exceeding max attempts"
    );
    describe_counter!(
        "scheduler.claims.total",
        "Total number of schedule rows claimed by the daemon"
    );
    describe_histogram!(
        "scheduler.dispatch.duration_seconds",
        "Time taken to build and publish a schedule row's event"
    );
    describe_counter!(
        "scheduler.dispatch.succeeded_total",
        "Total number of successful dispatches"
    );
    describe_counter!(
        "scheduler.dispatch.failed_total",
        "Total number of failed dispatches"
    );
    describe_counter!(
        "scheduler.notify.reconnects",
        "Total number of notification channel reconnects"
    );
    describe_counter!(
        "scheduler.dlq.retried",
        "Total number of dead-lettered messages reinserted into the schedule store"
    );
    describe_counter!(
        "scheduler.dlq.abandoned",
        "Total number of dead-lettered messages archived and given up on"
    );
    describe_counter!(
        "scheduler.broker.published",
        "Total number of events published to the broker"
    );

    // Circuit breaker metrics (generic ambient infra).
    describe_gauge!(
        "circuit_breaker.state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker.calls_total",
        "Total number of calls through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker.successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker.failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "circuit_breaker.rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Retry metrics (generic ambient infra).
    describe_counter!("retry.attempts_total", "Total number of retry attempts");
    describe_counter!("retry.successes_total", "Total number of successful retries");
    describe_counter!(
        "retry.exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Scheduler dispatch metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a successful claim.
    pub fn record_claim(table_id: &str) {
        counter!("scheduler.claims.total", "table_id" => table_id.to_string()).increment(1);
    }

    /// Record a dispatch attempt's outcome and duration.
    pub fn record_dispatch(table_id: &str, duration: Duration, succeeded: bool) {
        histogram!("scheduler.dispatch.duration_seconds", "table_id" => table_id.to_string())
            .record(duration.as_secs_f64());
        if succeeded {
            counter!("scheduler.dispatch.succeeded_total", "table_id" => table_id.to_string())
                .increment(1);
        } else {
            counter!("scheduler.dispatch.failed_total", "table_id" => table_id.to_string())
                .increment(1);
        }
    }
}

/// Dead-letter queue metrics recorder.
pub struct DlqMetrics;

impl DlqMetrics {
    /// Record a dead-lettered message reinserted into the schedule store.
    pub fn record_retried(queue_name: &str) {
        counter!("scheduler.dlq.retried", "queue" => queue_name.to_string()).increment(1);
    }

    /// Record a dead-lettered message archived and abandoned.
    pub fn record_abandoned(queue_name: &str) {
        counter!("scheduler.dlq.abandoned", "queue" => queue_name.to_string()).increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(state: f64) {
        gauge!("circuit_breaker.state").set(state);
    }

    /// Record a call attempt.
    pub fn record_call() {
        counter!("circuit_breaker.calls_total").increment(1);
    }

    /// Record a successful call.
    pub fn record_success() {
        counter!("circuit_breaker.successes_total").increment(1);
    }

    /// Record a failed call.
    pub fn record_failure() {
        counter!("circuit_breaker.failures_total").increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection() {
        counter!("circuit_breaker.rejections_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry.attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry.successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry.exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_server_creation_has_no_handle_until_started() {
        let addr = "127.0.0.1:0".parse().expect("valid address");
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn metrics_server_start_is_idempotent_across_tests() {
        let addr = "127.0.0.1:0".parse().expect("valid address");
        let mut server = MetricsServer::new(addr);
        assert!(server.start().is_ok());
    }

    #[tokio::test]
    async fn render_includes_scheduler_metric_names() {
        let addr = "127.0.0.1:0".parse().expect("valid address");
        let mut server = MetricsServer::new(addr);
        server.start().ok();

        SchedulerMetrics::record_claim("game_reminder");
        DlqMetrics::record_abandoned("game_reminder_dispatch.dlq");

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("scheduler_claims_total") || rendered.contains("scheduler.claims.total"));
        }
    }
}
