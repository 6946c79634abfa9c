//! AMQP broker gateway for the scheduling subsystem.
//!
//! This crate provides [`AmqpBrokerGateway`], a `lapin`-based implementation
//! of `scheduler_core::broker::BrokerGateway`. It owns the topology the
//! scheduler daemon and retry daemon depend on: a durable topic exchange for
//! outgoing events, a durable dead-letter exchange, and one queue (plus its
//! paired dead-letter queue) per consumer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   publish (confirmed)   ┌──────────────────┐
//! │ scheduler      │ ───────────────────────▶│  topic exchange  │
//! │ daemon         │                          └────────┬─────────┘
//! └───────────────┘                                   │ routing key
//!                                                      ▼
//!                                           ┌─────────────────────┐
//!                                           │   consumer queue     │
//!                                           │ (x-message-ttl,      │
//!                                           │  x-dead-letter-*)    │
//!                                           └──────────┬───────────┘
//!                                        ttl expiry /  │ nack
//!                                        nack-no-requeue
//!                                                      ▼
//!                                           ┌─────────────────────┐
//!                                           │        DLX           │
//!                                           └──────────┬───────────┘
//!                                                      ▼
//!                                           ┌─────────────────────┐
//!                                           │  <queue>.dlq          │
//!                                           └─────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with explicit ack/nack:
//! - `publish` does not return until the broker has confirmed the message
//!   (publisher confirms), so a successful call means the message is durably
//!   queued.
//! - Consumers must explicitly ack or nack-without-requeue every delivery;
//!   there is no auto-ack mode. Requeueing to the same queue is never used —
//!   a message that cannot be processed is nacked so it expires (TTL) or is
//!   ultimately routed to its dead-letter queue by the broker itself.
//! - `death_count` is read from the broker's `x-death` header array so the
//!   retry daemon can tell a first dead-lettering from a message that has
//!   cycled through the DLQ before.

use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use scheduler_core::broker::{
    AckHandle, BrokerError, BrokerGateway, Delivery, DeliveryStream, OutgoingEvent,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Declares one consumer queue and its pairing with the dead-letter exchange.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    /// Queue name (e.g. `"game_reminder_dispatch"`).
    pub queue: String,
    /// Routing key this queue binds to on the main exchange.
    pub routing_key: String,
    /// Per-message TTL before the broker dead-letters an unacked message.
    pub ttl: std::time::Duration,
}

impl QueueTopology {
    /// Name of this queue's paired dead-letter queue.
    #[must_use]
    pub fn dlq_name(&self) -> String {
        format!("{}.dlq", self.queue)
    }

    /// Routing key the DLQ binds to on the dead-letter exchange.
    #[must_use]
    pub fn dlq_routing_key(&self) -> String {
        format!("{}.dlq", self.routing_key)
    }
}

/// `lapin`-based implementation of `BrokerGateway`.
///
/// Holds one long-lived connection, a dedicated channel with publisher
/// confirms enabled for `publish`, and an in-process registry mapping the
/// synthetic `AckHandle` ids handed out by `consume` back to the `lapin`
/// `Acker` needed to actually ack or nack a delivery.
pub struct AmqpBrokerGateway {
    connection: Connection,
    publish_channel: Channel,
    exchange: String,
    dlx_exchange: String,
    queues: Vec<QueueTopology>,
    ack_registry: Arc<Mutex<HashMap<u64, Acker>>>,
    next_handle: Arc<AtomicU64>,
}

impl AmqpBrokerGateway {
    /// Connect to the broker at `amqp_url` and prepare a confirmed publish
    /// channel. Does not declare topology; call
    /// [`bootstrap_topology`](BrokerGateway::bootstrap_topology) once
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the connection or
    /// channel setup fails.
    pub async fn connect(
        amqp_url: &str,
        exchange: impl Into<String>,
        dlx_exchange: impl Into<String>,
        queues: Vec<QueueTopology>,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            connection,
            publish_channel,
            exchange: exchange.into(),
            dlx_exchange: dlx_exchange.into(),
            queues,
            ack_registry: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
        })
    }

    fn register_acker(
        registry: &Mutex<HashMap<u64, Acker>>,
        next_handle: &AtomicU64,
        acker: Acker,
    ) -> AckHandle {
        let id = next_handle.fetch_add(1, Ordering::Relaxed);
        let mut registry = registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.insert(id, acker);
        AckHandle(id)
    }

    /// Whether the underlying AMQP connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn take_acker(&self, handle: &AckHandle) -> Result<Acker, BrokerError> {
        let mut registry = self
            .ack_registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry
            .remove(&handle.0)
            .ok_or_else(|| BrokerError::AckFailed(format!("unknown ack handle {}", handle.0)))
    }
}

impl BrokerGateway for AmqpBrokerGateway {
    fn bootstrap_topology(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

            channel
                .exchange_declare(
                    &self.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

            channel
                .exchange_declare(
                    &self.dlx_exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

            for queue in &self.queues {
                channel
                    .queue_declare(
                        &queue.dlq_name(),
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

                channel
                    .queue_bind(
                        &queue.dlq_name(),
                        &self.dlx_exchange,
                        &queue.dlq_routing_key(),
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

                let mut args = FieldTable::default();
                args.insert(
                    ShortString::from("x-dead-letter-exchange"),
                    AMQPValue::LongString(LongString::from(self.dlx_exchange.clone())),
                );
                args.insert(
                    ShortString::from("x-dead-letter-routing-key"),
                    AMQPValue::LongString(LongString::from(queue.dlq_routing_key())),
                );
                args.insert(
                    ShortString::from("x-message-ttl"),
                    AMQPValue::LongUInt(u32::try_from(queue.ttl.as_millis()).unwrap_or(u32::MAX)),
                );

                channel
                    .queue_declare(
                        &queue.queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        args,
                    )
                    .await
                    .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

                channel
                    .queue_bind(
                        &queue.queue,
                        &self.exchange,
                        &queue.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

                tracing::info!(
                    queue = %queue.queue,
                    dlq = %queue.dlq_name(),
                    routing_key = %queue.routing_key,
                    "declared queue topology"
                );
            }

            Ok(())
        })
    }

    fn publish(
        &self,
        event: &OutgoingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let routing_key = event.routing_key.clone();
        let body = event.body.clone();
        let ttl = event.ttl;
        Box::pin(async move {
            let mut properties = BasicProperties::default().with_delivery_mode(2);
            if let Some(ttl) = ttl {
                properties = properties.with_expiration(ShortString::from(
                    ttl.as_millis().to_string(),
                ));
            }

            let confirm = self
                .publish_channel
                .basic_publish(
                    &self.exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(|e| BrokerError::PublishFailed {
                    routing_key: routing_key.clone(),
                    reason: e.to_string(),
                })?
                .await
                .map_err(|e| BrokerError::PublishFailed {
                    routing_key: routing_key.clone(),
                    reason: e.to_string(),
                })?;

            if confirm.is_nack() {
                return Err(BrokerError::NotConfirmed { routing_key });
            }

            metrics::counter!("scheduler.broker.published", "routing_key" => routing_key)
                .increment(1);
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })?;

            let consumer_tag = format!("scheduler-{queue}");
            let mut consumer = channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })?;

            let ack_registry = Arc::clone(&self.ack_registry);
            let next_handle = Arc::clone(&self.next_handle);

            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                while let Some(delivery_result) = consumer.next().await {
                    match delivery_result {
                        Ok(delivery) => {
                            let death_count = death_count(&delivery.properties);
                            let routing_key = delivery.routing_key.to_string();
                            let handle = Self::register_acker(&ack_registry, &next_handle, delivery.acker);
                            yield Ok(Delivery {
                                routing_key,
                                body: delivery.data,
                                death_count,
                                ack_handle: handle,
                            });
                        }
                        Err(e) => {
                            yield Err(BrokerError::TransportError(e.to_string()));
                        }
                    }
                }
            });

            Ok(stream)
        })
    }

    fn ack(
        &self,
        handle: AckHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let acker = self.take_acker(&handle)?;
            acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::AckFailed(e.to_string()))
        })
    }

    fn nack_no_requeue(
        &self,
        handle: AckHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let acker = self.take_acker(&handle)?;
            acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::AckFailed(e.to_string()))
        })
    }
}

/// Reads the broker's `x-death` header array and returns how many times this
/// message has previously been dead-lettered. `0` for a message seen for the
/// first time (no `x-death` header at all).
fn death_count(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else {
        return 0;
    };
    deaths.as_slice().len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_naming_is_derived_from_queue_name() {
        let topology = QueueTopology {
            queue: "game_reminder_dispatch".to_string(),
            routing_key: "game.reminder_due".to_string(),
            ttl: std::time::Duration::from_secs(30),
        };
        assert_eq!(topology.dlq_name(), "game_reminder_dispatch.dlq");
        assert_eq!(topology.dlq_routing_key(), "game.reminder_due.dlq");
    }

    #[test]
    fn death_count_is_zero_without_header() {
        let properties = BasicProperties::default();
        assert_eq!(death_count(&properties), 0);
    }
}
