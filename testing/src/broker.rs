//! In-memory [`BrokerGateway`] test double: no AMQP connection, just
//! per-queue buffers and an ack-handle registry mirroring
//! `scheduler_broker::AmqpBrokerGateway`'s bookkeeping closely enough that
//! daemon and retry-daemon tests exercise the same publish/consume/ack/nack
//! contract a real broker would.

use scheduler_core::broker::{
    AckHandle, BrokerError, BrokerGateway, Delivery, DeliveryStream, OutgoingEvent,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How often `consume` checks an empty queue for a newly published message.
/// Short enough that tests using real or paused `tokio::time` see prompt
/// delivery without spinning the executor.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One consumer queue's binding, standing in for `scheduler_broker::QueueTopology`
/// without requiring a running RabbitMQ.
#[derive(Debug, Clone)]
pub struct InMemoryQueueTopology {
    /// Queue name.
    pub queue: String,
    /// Routing key this queue is bound to.
    pub routing_key: String,
}

impl InMemoryQueueTopology {
    /// This queue's paired dead-letter queue name.
    #[must_use]
    pub fn dlq_name(&self) -> String {
        format!("{}.dlq", self.queue)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    death_count: u32,
}

type QueueMap = Arc<Mutex<HashMap<String, VecDeque<StoredMessage>>>>;
type AckRegistry = Arc<Mutex<HashMap<u64, (String, StoredMessage)>>>;

/// In-process `BrokerGateway`: `publish` routes by matching routing key to
/// a declared queue; `nack_no_requeue` pushes an incremented-death-count
/// copy onto the paired `.dlq`, simulating the broker's own dead-lettering
/// rather than requiring the caller to do it.
pub struct InMemoryBrokerGateway {
    topology: Vec<InMemoryQueueTopology>,
    queues: QueueMap,
    ack_registry: AckRegistry,
    next_handle: Arc<AtomicU64>,
}

impl InMemoryBrokerGateway {
    /// Build a gateway with the given queue bindings. Both each queue and
    /// its `.dlq` are pre-created so `consume` can be called on either
    /// before anything has been published.
    #[must_use]
    pub fn new(topology: Vec<InMemoryQueueTopology>) -> Self {
        let mut queues = HashMap::new();
        for t in &topology {
            queues.entry(t.queue.clone()).or_insert_with(VecDeque::new);
            queues.entry(t.dlq_name()).or_insert_with(VecDeque::new);
        }

        Self {
            topology,
            queues: Arc::new(Mutex::new(queues)),
            ack_registry: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current depth of a named queue, for test assertions.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .expect("queue map poisoned")
            .get(queue)
            .map_or(0, VecDeque::len)
    }
}

impl BrokerGateway for InMemoryBrokerGateway {
    fn bootstrap_topology(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        // Queues already exist from `new`; nothing to declare, matching the
        // real gateway's idempotent-and-safe-to-rerun contract.
        Box::pin(async move { Ok(()) })
    }

    fn publish(
        &self,
        event: &OutgoingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let event = event.clone();
        Box::pin(async move {
            let Some(topology) = self
                .topology
                .iter()
                .find(|t| t.routing_key == event.routing_key)
            else {
                return Err(BrokerError::PublishFailed {
                    routing_key: event.routing_key.clone(),
                    reason: "no queue bound to this routing key".to_string(),
                });
            };

            self.queues
                .lock()
                .expect("queue map poisoned")
                .entry(topology.queue.clone())
                .or_default()
                .push_back(StoredMessage {
                    routing_key: event.routing_key,
                    body: event.body,
                    death_count: 0,
                });

            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let queue = queue.to_string();
        let queues = Arc::clone(&self.queues);
        let ack_registry = Arc::clone(&self.ack_registry);
        let next_handle = Arc::clone(&self.next_handle);
        Box::pin(async move {
            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                loop {
                    let popped = queues
                        .lock()
                        .expect("queue map poisoned")
                        .get_mut(&queue)
                        .and_then(VecDeque::pop_front);

                    let Some(message) = popped else {
                        tokio::time::sleep(POLL_INTERVAL).await;
                        continue;
                    };

                    let handle_id = next_handle.fetch_add(1, Ordering::Relaxed);
                    let delivery = Delivery {
                        routing_key: message.routing_key.clone(),
                        body: message.body.clone(),
                        death_count: message.death_count,
                        ack_handle: AckHandle(handle_id),
                    };
                    ack_registry
                        .lock()
                        .expect("ack registry poisoned")
                        .insert(handle_id, (queue.clone(), message));
                    yield Ok(delivery);
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
            self.ack_registry
                .lock()
                .expect("ack registry poisoned")
                .remove(&handle.0)
                .ok_or_else(|| BrokerError::AckFailed(format!("unknown ack handle {}", handle.0)))?;
            Ok(())
        })
    }

    fn nack_no_requeue(
        &self,
        handle: AckHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let (queue, mut message) = self
                .ack_registry
                .lock()
                .expect("ack registry poisoned")
                .remove(&handle.0)
                .ok_or_else(|| BrokerError::AckFailed(format!("unknown ack handle {}", handle.0)))?;

            message.death_count += 1;
            let dlq = format!("{queue}.dlq");
            self.queues
                .lock()
                .expect("queue map poisoned")
                .entry(dlq)
                .or_default()
                .push_back(message);

            Ok(())
        })
    }
}
