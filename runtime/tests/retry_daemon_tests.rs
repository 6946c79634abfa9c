//! Integration tests for [`RetryDaemon`] driven by the in-memory test
//! doubles: draining a DLQ and reinserting through the schedule store,
//! abandoning once the death count exceeds the configured threshold, and
//! archiving a message whose body cannot be decoded.

use scheduler_core::broker::{BrokerGateway, OutgoingEvent};
use scheduler_core::clock::{Clock, SystemClock};
use scheduler_core::schedule_store::ScheduleStore;
use scheduler_runtime::retry::RetryPolicy;
use scheduler_runtime::retry_daemon::{RetryDaemon, RetryDaemonConfig};
use scheduler_testing::{
    InMemoryAbandonmentSink, InMemoryBrokerGateway, InMemoryNotificationChannel,
    InMemoryQueueTopology, InMemoryScheduleStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn retry_config() -> RetryDaemonConfig {
    RetryDaemonConfig {
        dlq_queue: "game_reminder_dispatch.dlq".to_string(),
        table_id: "game_reminder".to_string(),
        drain_interval: Duration::from_millis(20),
        batch_cap: 10,
        abandon_threshold: 3,
        backoff: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(50))
            .build(),
    }
}

fn broker() -> Arc<InMemoryBrokerGateway> {
    Arc::new(InMemoryBrokerGateway::new(vec![InMemoryQueueTopology {
        queue: "game_reminder_dispatch".to_string(),
        routing_key: "game.reminder_due".to_string(),
    }]))
}

#[tokio::test]
async fn drains_and_reinserts_through_the_schedule_store() {
    let broker = broker();
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryScheduleStore::new(notify, Arc::clone(&clock)));
    let archive = Arc::new(InMemoryAbandonmentSink::new());

    broker
        .publish(&OutgoingEvent {
            routing_key: "game.reminder_due".to_string(),
            body: br#"{"subject_key":"game-1"}"#.to_vec(),
            ttl: None,
        })
        .await
        .expect("publish failed");
    // Move the message to its DLQ as a broker would after repeated failed
    // deliveries, leaving a death_count of 1.
    let mut consumer = broker
        .consume("game_reminder_dispatch")
        .await
        .expect("consume failed");
    let delivery = futures::StreamExt::next(&mut consumer)
        .await
        .expect("stream ended")
        .expect("delivery error");
    broker
        .nack_no_requeue(delivery.ack_handle)
        .await
        .expect("nack failed");

    let daemon = RetryDaemon::new(Arc::clone(&broker), Arc::clone(&store), archive, clock, retry_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.peek_next("game_reminder").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was never reinserted through the schedule store");

    shutdown_tx.send(true).expect("failed to signal shutdown");
    handle.await.expect("retry daemon task panicked").expect("retry daemon returned an error");
}

#[tokio::test]
async fn abandons_a_message_once_death_count_exceeds_the_threshold() {
    let broker = broker();
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryScheduleStore::new(notify, Arc::clone(&clock)));
    let archive = Arc::new(InMemoryAbandonmentSink::new());

    broker
        .publish(&OutgoingEvent {
            routing_key: "game.reminder_due".to_string(),
            body: br#"{"subject_key":"game-2"}"#.to_vec(),
            ttl: None,
        })
        .await
        .expect("publish failed");
    // A single nack gives the message a death_count of 1, which is enough
    // to exceed a threshold of 0 without relying on the in-memory broker's
    // dead-lettering to be re-nackable across nested `.dlq.dlq` queues.
    let mut consumer = broker
        .consume("game_reminder_dispatch")
        .await
        .expect("consume failed");
    let delivery = futures::StreamExt::next(&mut consumer)
        .await
        .expect("stream ended")
        .expect("delivery error");
    broker.nack_no_requeue(delivery.ack_handle).await.expect("nack failed");

    let mut config = retry_config();
    config.abandon_threshold = 0;

    let daemon = RetryDaemon::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&archive),
        clock,
        config,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !archive.entries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was never abandoned");

    let entries = archive.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].death_count, 1);
    assert!(store.peek_next("game_reminder").await.unwrap().is_none());

    shutdown_tx.send(true).expect("failed to signal shutdown");
    handle.await.expect("retry daemon task panicked").expect("retry daemon returned an error");
}

#[tokio::test]
async fn archives_a_message_with_an_undecodable_body() {
    let broker = broker();
    let notify = Arc::new(InMemoryNotificationChannel::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryScheduleStore::new(notify, Arc::clone(&clock)));
    let archive = Arc::new(InMemoryAbandonmentSink::new());

    broker
        .publish(&OutgoingEvent {
            routing_key: "game.reminder_due".to_string(),
            body: b"not json".to_vec(),
            ttl: None,
        })
        .await
        .expect("publish failed");
    let mut consumer = broker
        .consume("game_reminder_dispatch")
        .await
        .expect("consume failed");
    let delivery = futures::StreamExt::next(&mut consumer)
        .await
        .expect("stream ended")
        .expect("delivery error");
    broker.nack_no_requeue(delivery.ack_handle).await.expect("nack failed");

    let daemon = RetryDaemon::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&archive),
        clock,
        retry_config(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !archive.entries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("undecodable message was never archived");

    let entries = archive.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "undecodable message body");
    assert!(store.peek_next("game_reminder").await.unwrap().is_none());

    shutdown_tx.send(true).expect("failed to signal shutdown");
    handle.await.expect("retry daemon task panicked").expect("retry daemon returned an error");
}
