//! Application coordinator: wires together the schedule store, the broker
//! gateway, and one daemon pair per schedule table.
//!
//! Mirrors `examples/ticketing/src/app/coordinator.rs`'s `TicketingApp`: a
//! single struct built once at startup that owns every long-lived resource,
//! with a `spawn_daemons` step analogous to that coordinator's `start`.

use crate::config::{Config, ScheduleTableSettings};
use scheduler_broker::{AmqpBrokerGateway, QueueTopology};
use scheduler_core::broker::BrokerGateway as _;
use scheduler_core::clock::{Clock, SystemClock};
use scheduler_postgres::{AbandonedMessageArchive, PgNotifyListener, PgScheduleStore};
use scheduler_runtime::daemon::{ScheduleTableConfig, SchedulerDaemon};
use scheduler_runtime::event_builder::{
    reminder_event_builder, status_transition_event_builder,
};
use scheduler_runtime::retry::RetryPolicy;
use scheduler_runtime::retry_daemon::{RetryDaemon, RetryDaemonConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors standing up the service's resources. All are fatal at startup,
/// per spec.md §7's fatal tier.
#[derive(Error, Debug)]
pub enum AppError {
    /// The schedule store's database connection or migrations failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migrations failed to apply.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The broker connection or topology bootstrap failed.
    #[error("broker error: {0}")]
    Broker(String),
}

/// Owns every long-lived resource the scheduling subsystem needs: the
/// schedule store, the `LISTEN/NOTIFY` client, the broker gateway, and the
/// DLQ archive. Built once at startup; daemons borrow `Arc` clones of these.
pub struct ServiceApp {
    pool: PgPool,
    store: Arc<PgScheduleStore>,
    notify: Arc<PgNotifyListener>,
    broker: Arc<AmqpBrokerGateway>,
    archive: Arc<AbandonedMessageArchive>,
    config: Config,
}

impl ServiceApp {
    /// Connect to `Postgres` and the broker, run migrations, and declare
    /// broker topology. Does not start any daemon — call
    /// [`ServiceApp::spawn_daemons`] once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the database is unreachable, migrations fail,
    /// or the broker cannot be connected to or its topology declared.
    pub async fn new(config: Config) -> Result<Self, AppError> {
        tracing::info!(url = %config.postgres.url, "connecting to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(config.postgres.max_connections)
            .min_connections(config.postgres.min_connections)
            .acquire_timeout(config.postgres.connect_timeout())
            .connect(&config.postgres.url)
            .await?;

        tracing::info!("running schedule store migrations");
        PgScheduleStore::migrate(&pool).await?;
        tracing::info!("✓ migrations applied");

        let store = Arc::new(PgScheduleStore::new(pool.clone()));
        let archive = Arc::new(AbandonedMessageArchive::new(pool.clone()));
        let notify = Arc::new(PgNotifyListener::new(config.postgres.url.clone()));

        tracing::info!(url = %config.amqp.url, "connecting to AMQP broker");
        let queues = config
            .schedule_tables()
            .iter()
            .map(|table| QueueTopology {
                queue: table.queue.clone(),
                routing_key: table.routing_key.clone(),
                ttl: Duration::from_secs(table.message_ttl_secs),
            })
            .collect();
        let broker = Arc::new(
            AmqpBrokerGateway::connect(
                &config.amqp.url,
                config.amqp.exchange.clone(),
                config.amqp.dlx_exchange.clone(),
                queues,
            )
            .await
            .map_err(|e| AppError::Broker(e.to_string()))?,
        );
        tracing::info!("✓ broker connected");

        tracing::info!("declaring broker topology");
        broker
            .bootstrap_topology()
            .await
            .map_err(|e| AppError::Broker(e.to_string()))?;
        tracing::info!("✓ broker topology declared");

        Ok(Self {
            pool,
            store,
            notify,
            broker,
            archive,
            config,
        })
    }

    /// This service's loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The schedule store's connection pool, for the health/metrics router.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The broker gateway, for the health/metrics router.
    #[must_use]
    pub fn broker(&self) -> Arc<AmqpBrokerGateway> {
        Arc::clone(&self.broker)
    }

    /// Spawn one scheduler daemon per schedule table and one retry daemon
    /// per DLQ, all sharing `shutdown`. Finishing an in-flight claim+publish
    /// round before returning is each daemon's own responsibility (see
    /// `scheduler_runtime::daemon::SchedulerDaemon::run`).
    #[must_use]
    pub fn spawn_daemons(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        vec![
            self.spawn_scheduler_daemon(
                Arc::clone(&clock),
                &self.config.reminder,
                reminder_event_builder,
                shutdown.clone(),
            ),
            self.spawn_scheduler_daemon(
                Arc::clone(&clock),
                &self.config.status_transition,
                status_transition_event_builder,
                shutdown.clone(),
            ),
            self.spawn_retry_daemon(Arc::clone(&clock), &self.config.reminder, shutdown.clone()),
            self.spawn_retry_daemon(
                Arc::clone(&clock),
                &self.config.status_transition,
                shutdown.clone(),
            ),
        ]
    }

    fn spawn_scheduler_daemon(
        &self,
        clock: Arc<dyn Clock>,
        settings: &ScheduleTableSettings,
        event_builder: scheduler_runtime::event_builder::EventBuilder,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let daemon = SchedulerDaemon::new(
            Arc::clone(&self.store),
            Arc::clone(&self.notify),
            Arc::clone(&self.broker),
            clock,
            table_config(settings),
            event_builder,
        );
        let table_id = settings.table_id.clone();

        tokio::spawn(async move {
            if let Err(e) = daemon.run(shutdown).await {
                tracing::error!(table_id, error = %e, "scheduler daemon exited with an error");
            }
        })
    }

    fn spawn_retry_daemon(
        &self,
        clock: Arc<dyn Clock>,
        settings: &ScheduleTableSettings,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let daemon = RetryDaemon::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            Arc::clone(&self.archive),
            clock,
            retry_config(settings),
        );
        let dlq_queue = settings.dlq_queue();

        tokio::spawn(async move {
            if let Err(e) = daemon.run(shutdown).await {
                tracing::error!(dlq_queue, error = %e, "retry daemon exited with an error");
            }
        })
    }
}

fn table_config(settings: &ScheduleTableSettings) -> ScheduleTableConfig {
    ScheduleTableConfig {
        table_id: settings.table_id.clone(),
        notify_channel: settings.notify_channel.clone(),
        routing_key_template: settings.routing_key.clone(),
        reset_stale_claims_after: Duration::from_secs(settings.reset_stale_claims_after_secs),
        max_attempts: settings.max_attempts,
        message_ttl: Duration::from_secs(settings.message_ttl_secs),
        dispatch_backoff: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(settings.dispatch_backoff_initial_ms))
            .max_delay(Duration::from_millis(settings.dispatch_backoff_max_ms))
            .multiplier(settings.dispatch_backoff_multiplier)
            .build(),
    }
}

fn retry_config(settings: &ScheduleTableSettings) -> RetryDaemonConfig {
    RetryDaemonConfig {
        dlq_queue: settings.dlq_queue(),
        table_id: settings.table_id.clone(),
        drain_interval: Duration::from_millis(settings.retry_drain_interval_ms),
        batch_cap: settings.retry_batch_cap,
        abandon_threshold: settings.retry_abandon_threshold,
        backoff: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(settings.retry_backoff_initial_ms))
            .max_delay(Duration::from_millis(settings.retry_backoff_max_ms))
            .build(),
    }
}
