//! End-to-end smoke test for [`ServiceApp`]: boots the full service against
//! real `Postgres` and `RabbitMQ` containers, inserts a due schedule row
//! directly, and asserts it is claimed, published, and consumable from the
//! reminder dispatch queue — exercising the same wiring
//! `examples/ticketing/src/bin/server.rs` exercises at process startup.
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is
//! acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use futures::StreamExt;
use scheduler_broker::{AmqpBrokerGateway, QueueTopology};
use scheduler_core::broker::BrokerGateway as _;
use scheduler_core::kind::ScheduleKind;
use scheduler_core::schedule_store::ScheduleStore as _;
use scheduler_core::subject::SubjectKey;
use scheduler_postgres::PgScheduleStore;
use scheduler_service::config::{
    AmqpConfig, Config, PostgresConfig, ScheduleTableSettings, ServerConfig,
};
use scheduler_service::ServiceApp;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio::sync::watch;

fn table_settings(table_id: &str, queue: &str, routing_key: &str) -> ScheduleTableSettings {
    ScheduleTableSettings {
        table_id: table_id.to_string(),
        queue: queue.to_string(),
        routing_key: routing_key.to_string(),
        notify_channel: format!("schedule_wakeup_{table_id}"),
        message_ttl_secs: 30,
        reset_stale_claims_after_secs: 300,
        max_attempts: 5,
        dispatch_backoff_initial_ms: 50,
        dispatch_backoff_max_ms: 1000,
        dispatch_backoff_multiplier: 2.0,
        retry_drain_interval_ms: 200,
        retry_batch_cap: 50,
        retry_abandon_threshold: 5,
        retry_backoff_initial_ms: 100,
        retry_backoff_max_ms: 5000,
    }
}

#[tokio::test]
async fn service_app_dispatches_a_due_row_end_to_end() {
    let postgres = Postgres::default()
        .start()
        .await
        .expect("failed to start Postgres container");
    let pg_host = postgres.get_host().await.expect("failed to get pg host");
    let pg_port = postgres
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get pg port");
    let database_url = format!("postgres://postgres:postgres@{pg_host}:{pg_port}/postgres");

    let rabbitmq = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let amqp_host = rabbitmq.get_host().await.expect("failed to get amqp host");
    let amqp_port = rabbitmq
        .get_host_port_ipv4(5672)
        .await
        .expect("failed to get amqp port");
    let amqp_url = format!("amqp://guest:guest@{amqp_host}:{amqp_port}/%2f");

    let config = Config {
        postgres: PostgresConfig {
            url: database_url,
            max_connections: 5,
            min_connections: 1,
            connect_timeout: 10,
        },
        amqp: AmqpConfig {
            url: amqp_url,
            exchange: "scheduler_events".to_string(),
            dlx_exchange: "scheduler_events.dlx".to_string(),
        },
        reminder: table_settings(
            "game_reminder",
            "game_reminder_dispatch",
            "game.reminder_due",
        ),
        status_transition: table_settings(
            "game_status_transition",
            "game_status_transition_dispatch",
            "game.status_transition",
        ),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            shutdown_timeout: 5,
        },
    };

    let app = ServiceApp::new(config.clone())
        .await
        .expect("ServiceApp::new failed");

    // A second bootstrap against the same topology must stay a no-op.
    AmqpBrokerGateway::connect(
        &config.amqp.url,
        config.amqp.exchange.clone(),
        config.amqp.dlx_exchange.clone(),
        vec![QueueTopology {
            queue: config.reminder.queue.clone(),
            routing_key: config.reminder.routing_key.clone(),
            ttl: Duration::from_secs(config.reminder.message_ttl_secs),
        }],
    )
    .await
    .expect("second connect failed")
    .bootstrap_topology()
    .await
    .expect("idempotent bootstrap failed");

    let store = PgScheduleStore::new(app.pool().clone());
    store
        .insert(
            &config.reminder.table_id,
            SubjectKey::new("session-e2e"),
            ScheduleKind::new("reminder"),
            Utc::now() + chrono::Duration::milliseconds(1),
            serde_json::json!({"channel_id": "456"}),
        )
        .await
        .expect("insert failed");

    let broker = app.broker();
    let mut stream = broker
        .consume(&config.reminder.queue)
        .await
        .expect("consume failed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = app.spawn_daemons(&shutdown_rx);

    let delivery = tokio::time::timeout(Duration::from_secs(15), stream.next())
        .await
        .expect("timed out waiting for dispatch")
        .expect("stream ended unexpectedly")
        .expect("delivery error");

    assert_eq!(delivery.routing_key, "game.reminder_due");
    assert_eq!(delivery.death_count, 0);
    broker.ack(delivery.ack_handle).await.expect("ack failed");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await.expect("daemon task panicked");
    }
}

#[tokio::test]
async fn service_app_reports_healthy_readiness_state() {
    let postgres = Postgres::default()
        .start()
        .await
        .expect("failed to start Postgres container");
    let pg_host = postgres.get_host().await.expect("failed to get pg host");
    let pg_port = postgres
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get pg port");
    let database_url = format!("postgres://postgres:postgres@{pg_host}:{pg_port}/postgres");

    let rabbitmq = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let amqp_host = rabbitmq.get_host().await.expect("failed to get amqp host");
    let amqp_port = rabbitmq
        .get_host_port_ipv4(5672)
        .await
        .expect("failed to get amqp port");
    let amqp_url = format!("amqp://guest:guest@{amqp_host}:{amqp_port}/%2f");

    let config = Config {
        postgres: PostgresConfig {
            url: database_url,
            max_connections: 5,
            min_connections: 1,
            connect_timeout: 10,
        },
        amqp: AmqpConfig {
            url: amqp_url,
            exchange: "scheduler_events".to_string(),
            dlx_exchange: "scheduler_events.dlx".to_string(),
        },
        reminder: table_settings(
            "game_reminder",
            "game_reminder_dispatch",
            "game.reminder_due",
        ),
        status_transition: table_settings(
            "game_status_transition",
            "game_status_transition_dispatch",
            "game.status_transition",
        ),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            shutdown_timeout: 5,
        },
    };

    let app = ServiceApp::new(config).await.expect("ServiceApp::new failed");

    assert!(sqlx::query("SELECT 1")
        .execute(app.pool())
        .await
        .is_ok());
    assert!(app.broker().is_connected());
}
