//! Archive sink for dead-letter messages the retry daemon has given up on.
//!
//! `SPEC_FULL.md` §7 requires that "abandoned DLQ messages leave an archive
//! record" — an audit trail nobody can query is not an audit trail. This
//! trait is the retry daemon's only dependency on however that archive is
//! stored, mirroring the split between [`crate::schedule_store::ScheduleStore`]
//! (the daemon's storage dependency) and its concrete Postgres
//! implementation.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors recording an abandoned dead-letter message.
#[derive(Error, Debug, Clone)]
pub enum AbandonmentError {
    /// The archive write failed.
    #[error("failed to archive abandoned message: {0}")]
    WriteFailed(String),
}

/// A dead-letter message the retry daemon has permanently given up on,
/// ready to be written to an archive sink.
#[derive(Debug, Clone)]
pub struct AbandonedEntry {
    /// The DLQ this message was drained from.
    pub queue_name: String,
    /// The routing key the message was originally published under.
    pub routing_key: String,
    /// Raw message body at the time it was abandoned.
    pub body: Vec<u8>,
    /// Number of times the broker recorded this message as dead-lettered.
    pub death_count: u32,
    /// When the message was first observed in its DLQ.
    pub first_seen_at: DateTime<Utc>,
    /// Why it was abandoned (e.g. a decode failure, or exceeding the
    /// configured abandon threshold).
    pub reason: String,
}

/// Durable sink for messages the retry daemon has abandoned.
///
/// # Dyn Compatibility
///
/// Like the other core traits, returns explicit `Pin<Box<dyn Future>>` so
/// `Arc<dyn AbandonmentSink>` works as a trait object shared between the
/// retry daemon and whatever concrete archive backs it.
pub trait AbandonmentSink: Send + Sync {
    /// Record an abandoned message.
    ///
    /// # Errors
    ///
    /// Returns [`AbandonmentError::WriteFailed`] if the write fails. A
    /// failure here is itself logged and counted by the caller — dropping
    /// the record from the archive is preferable to blocking the drain
    /// loop, per `SPEC_FULL.md` §5's "archive-and-diagnose" decision.
    fn record_abandoned(
        &self,
        entry: AbandonedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), AbandonmentError>> + Send + '_>>;
}
