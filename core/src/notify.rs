//! Wake-up notification channel abstraction.
//!
//! The scheduler daemon must wake up promptly when a row it cares about
//! becomes newly relevant — inserted, rescheduled earlier, or cancelled —
//! rather than waiting out its poll interval. [`NotificationChannel`]
//! abstracts that signal so the daemon loop does not depend on Postgres
//! `LISTEN/NOTIFY` directly; tests drive it with an in-memory channel.
//!
//! # Design
//!
//! Unlike [`crate::broker::BrokerGateway`], notifications are intentionally
//! content-free. A notification means "re-run `peek_next` for this table";
//! it never carries the row itself. This keeps the channel's delivery
//! guarantee irrelevant to correctness — the daemon always re-derives truth
//! from the [`crate::schedule_store::ScheduleStore`], so a missed, coalesced,
//! or duplicated notification only costs latency, never correctness.
//!
//! # Dyn Compatibility
//!
//! Mirrors the teacher's `EventBus` trait: explicit `Pin<Box<dyn Future>>`
//! returns so `Arc<dyn NotificationChannel>` works as a trait object shared
//! between the daemon and the producers that call `notify`.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from notification channel operations.
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    /// Failed to establish or re-establish the underlying connection.
    #[error("notification channel connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to send a wake-up signal.
    #[error("notify failed for channel '{channel}': {reason}")]
    NotifyFailed {
        /// The channel name that failed.
        channel: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to a channel.
    #[error("listen failed for channel '{channel}': {reason}")]
    ListenFailed {
        /// The channel name that failed.
        channel: String,
        /// The reason for failure.
        reason: String,
    },

    /// Transport-level error while listening (e.g. connection dropped).
    #[error("transport error: {0}")]
    TransportError(String),
}

/// A single wake-up arrival. Carries only the channel name — by design,
/// never a payload. See the module documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// The channel this wake-up arrived on, i.e. the `table_id`.
    pub table_id: String,
    /// `true` if this arrival was synthesized after a reconnect rather than
    /// observed as a real `NOTIFY`. Daemons treat it identically to a real
    /// arrival (re-query, don't trust payload) but it is surfaced separately
    /// so it can be logged/metriced distinctly.
    pub synthetic: bool,
}

/// Stream of wake-up arrivals from a subscription.
pub type ArrivalStream = Pin<Box<dyn Stream<Item = Result<Arrival, NotifyError>> + Send>>;

/// Abstracts a content-free publish/subscribe wake-up signal keyed by
/// channel name (one channel per `table_id`).
///
/// # Reconnection
///
/// Implementations backed by a single persistent connection (such as
/// Postgres `LISTEN/NOTIFY`, which requires a dedicated, non-pooled
/// connection) must transparently reconnect and re-`LISTEN` on every
/// channel after a drop, and must emit one synthetic [`Arrival`] per
/// channel immediately after reconnecting — notifications sent while
/// disconnected are otherwise lost, and the synthetic wake-up causes the
/// daemon to re-check `peek_next` rather than relying on a deferred
/// notification that never arrives.
pub trait NotificationChannel: Send + Sync {
    /// Send a content-free wake-up signal on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::NotifyFailed`] if the signal could not be sent.
    /// Callers should treat this as non-fatal: the next poll interval will
    /// still find the row via `peek_next`.
    fn notify(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;

    /// Subscribe to wake-up signals on one or more channels.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::ListenFailed`] if the subscription could not
    /// be established.
    fn listen(
        &self,
        channels: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<ArrivalStream, NotifyError>> + Send + '_>>;
}
