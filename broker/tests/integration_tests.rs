//! Integration tests for [`AmqpBrokerGateway`] against a real `RabbitMQ`
//! instance.
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is
//! acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use scheduler_broker::{AmqpBrokerGateway, QueueTopology};
use scheduler_core::broker::{BrokerGateway, OutgoingEvent};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;

async fn gateway(amqp_url: &str, queue: &str, routing_key: &str, ttl: Duration) -> AmqpBrokerGateway {
    let gateway = AmqpBrokerGateway::connect(
        amqp_url,
        "scheduler_events",
        "scheduler_events.dlx",
        vec![QueueTopology {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            ttl,
        }],
    )
    .await
    .expect("failed to connect to RabbitMQ");

    gateway
        .bootstrap_topology()
        .await
        .expect("failed to declare topology");

    gateway
}

#[tokio::test]
async fn publish_then_consume_round_trip() {
    let rabbitmq = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let host = rabbitmq.get_host().await.expect("failed to get host");
    let port = rabbitmq
        .get_host_port_ipv4(5672)
        .await
        .expect("failed to get port");
    let amqp_url = format!("amqp://guest:guest@{host}:{port}/%2f");

    let gateway = gateway(
        &amqp_url,
        "game_reminder_dispatch",
        "game.reminder_due",
        Duration::from_secs(30),
    )
    .await;

    gateway
        .publish(&OutgoingEvent {
            routing_key: "game.reminder_due".to_string(),
            body: br#"{"schedule_id":1}"#.to_vec(),
            ttl: Some(Duration::from_secs(30)),
        })
        .await
        .expect("publish failed");

    let mut stream = gateway
        .consume("game_reminder_dispatch")
        .await
        .expect("consume failed");

    let delivery = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended unexpectedly")
        .expect("delivery error");

    assert_eq!(delivery.routing_key, "game.reminder_due");
    assert_eq!(delivery.body, br#"{"schedule_id":1}"#);
    assert_eq!(delivery.death_count, 0);

    gateway.ack(delivery.ack_handle).await.expect("ack failed");
}

#[tokio::test]
async fn nacked_message_is_routed_to_dead_letter_queue() {
    let rabbitmq = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let host = rabbitmq.get_host().await.expect("failed to get host");
    let port = rabbitmq
        .get_host_port_ipv4(5672)
        .await
        .expect("failed to get port");
    let amqp_url = format!("amqp://guest:guest@{host}:{port}/%2f");

    let gateway = gateway(
        &amqp_url,
        "game_status_transition_dispatch",
        "game.status_transition",
        Duration::from_secs(30),
    )
    .await;

    gateway
        .publish(&OutgoingEvent {
            routing_key: "game.status_transition".to_string(),
            body: br#"{"schedule_id":2}"#.to_vec(),
            ttl: Some(Duration::from_secs(30)),
        })
        .await
        .expect("publish failed");

    let mut stream = gateway
        .consume("game_status_transition_dispatch")
        .await
        .expect("consume failed");

    let delivery = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended unexpectedly")
        .expect("delivery error");

    gateway
        .nack_no_requeue(delivery.ack_handle)
        .await
        .expect("nack failed");

    let mut dlq_stream = gateway
        .consume("game_status_transition_dispatch.dlq")
        .await
        .expect("dlq consume failed");

    let dead_lettered = tokio::time::timeout(Duration::from_secs(10), dlq_stream.next())
        .await
        .expect("timed out waiting for dead-lettered delivery")
        .expect("dlq stream ended unexpectedly")
        .expect("delivery error");

    assert_eq!(dead_lettered.body, br#"{"schedule_id":2}"#);
    assert_eq!(dead_lettered.death_count, 1);

    gateway
        .ack(dead_lettered.ack_handle)
        .await
        .expect("ack failed");
}

#[tokio::test]
async fn bootstrap_topology_is_idempotent() {
    let rabbitmq = RabbitMq::default()
        .start()
        .await
        .expect("failed to start RabbitMQ container");
    let host = rabbitmq.get_host().await.expect("failed to get host");
    let port = rabbitmq
        .get_host_port_ipv4(5672)
        .await
        .expect("failed to get port");
    let amqp_url = format!("amqp://guest:guest@{host}:{port}/%2f");

    let gateway = gateway(
        &amqp_url,
        "game_reminder_dispatch",
        "game.reminder_due",
        Duration::from_secs(30),
    )
    .await;

    gateway
        .bootstrap_topology()
        .await
        .expect("second bootstrap_topology call should be a no-op, not an error");
}
