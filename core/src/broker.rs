//! Message broker gateway abstraction.
//!
//! [`BrokerGateway`] is the scheduler daemon's only dependency on the
//! downstream message broker. It publishes outgoing events with confirmed
//! delivery and, for the retry daemon, consumes from dead-letter queues with
//! explicit ack/nack control.
//!
//! # Design Principles
//!
//! - **Confirmed publish**: `publish` does not return until the broker has
//!   acknowledged the message, matching spec.md §5's publisher-confirm
//!   requirement.
//! - **At-least-once delivery**: consumers may observe a delivery more than
//!   once; all consumption in this system is idempotent by construction
//!   (re-dispatching a reminder twice is harmless, and the schedule row's
//!   `state` prevents a claimed row from being claimed twice).
//! - **Explicit acknowledgement**: consumers decide ack vs. nack-without-requeue
//!   per delivery rather than relying on auto-ack, so a malformed
//!   dead-lettered message can be routed to the archive instead of looping.
//!
//! # Dyn Compatibility
//!
//! As with [`crate::schedule_store::ScheduleStore`] and
//! [`crate::notify::NotificationChannel`], this trait returns explicit
//! `Pin<Box<dyn Future>>` to remain object-safe.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from broker gateway operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a routing key.
    #[error("publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// The routing key that failed.
        routing_key: String,
        /// The reason for failure.
        reason: String,
    },

    /// The broker rejected (nacked) a publisher-confirmed message.
    #[error("publish was not confirmed for routing key '{routing_key}'")]
    NotConfirmed {
        /// The routing key that was rejected.
        routing_key: String,
    },

    /// Failed to consume from a queue.
    #[error("consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue that failed.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to acknowledge or reject a delivery.
    #[error("ack/nack failed: {0}")]
    AckFailed(String),

    /// Failed to bootstrap broker topology (exchanges, queues, bindings).
    #[error("topology setup failed: {0}")]
    TopologyFailed(String),

    /// Transport-level error (connection dropped, channel closed).
    #[error("transport error: {0}")]
    TransportError(String),
}

/// An outgoing event to publish.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    /// Routing key, typically the event type (e.g. `"game.reminder_due"`).
    pub routing_key: String,
    /// Serialized message body.
    pub body: Vec<u8>,
    /// Per-message time-to-live. After this elapses undelivered or
    /// unacknowledged, the broker routes the message to its queue's DLQ.
    pub ttl: Option<std::time::Duration>,
}

/// A message delivered from a consumed queue, together with its broker
/// metadata needed to decide ack vs. nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing key the message was published under.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
    /// Number of times this message has previously been dead-lettered, read
    /// from the broker's `x-death` header. `0` for a first delivery.
    pub death_count: u32,
    /// Opaque handle used to ack or nack this specific delivery.
    pub ack_handle: AckHandle,
}

/// Opaque per-delivery handle. Implementations wrap whatever delivery tag
/// or channel reference their broker client requires.
#[derive(Debug, Clone)]
pub struct AckHandle(pub u64);

/// Stream of deliveries from a consumed queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Gateway to the downstream message broker.
pub trait BrokerGateway: Send + Sync {
    /// Idempotently declare the broker topology this gateway depends on
    /// (main exchange, dead-letter exchange, per-queue DLQs and bindings).
    /// Safe to call on every startup.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopologyFailed`] if declaration fails.
    fn bootstrap_topology(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Publish an event and wait for the broker's publisher confirm.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] on a transport failure, or
    /// [`BrokerError::NotConfirmed`] if the broker explicitly rejected the
    /// message.
    fn publish(
        &self,
        event: &OutgoingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Consume from a named queue (typically a DLQ), yielding a stream of
    /// [`Delivery`] values the caller must explicitly ack or nack.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the consumer could not be
    /// established.
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;

    /// Acknowledge a delivery, removing it from the queue permanently.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] on failure.
    fn ack(
        &self,
        handle: AckHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Reject a delivery without requeueing. Used once a dead-lettered
    /// message has been handled by the retry daemon (reinserted into the
    /// schedule store or archived), so it is removed from the DLQ.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] on failure.
    fn nack_no_requeue(
        &self,
        handle: AckHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}
