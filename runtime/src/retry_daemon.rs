//! Retry daemon: drains dead-letter queues and reintroduces messages through
//! the schedule store, never by direct republish. See `SPEC_FULL.md` §5 and
//! spec.md §4.5/§9 ("from implicit shared DLQ to per-queue ownership").
//!
//! One [`RetryDaemon`] instance is configured per DLQ. Each runs on its own
//! fixed interval, draining whatever is present in its queue at the moment
//! the tick begins (bounded by `batch_cap`) rather than consuming
//! continuously, so a burst of dead letters cannot monopolize the broker
//! connection this daemon shares with everything else.

use crate::metrics::DlqMetrics;
use crate::retry::RetryPolicy;
use scheduler_core::abandonment::{AbandonedEntry, AbandonmentSink};
use scheduler_core::broker::{AckHandle, BrokerGateway, DeliveryStream};
use scheduler_core::clock::Clock;
use scheduler_core::kind::ScheduleKind;
use scheduler_core::schedule::PayloadRef;
use scheduler_core::schedule_store::{ScheduleStore, ScheduleStoreError};
use scheduler_core::subject::SubjectKey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// How long to wait for the next already-queued delivery before deciding a
/// drain tick has exhausted what was present when it began.
const DRAIN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Configuration for one DLQ's retry daemon instance.
#[derive(Debug, Clone)]
pub struct RetryDaemonConfig {
    /// The DLQ to drain (e.g. `"game_reminder_dispatch.dlq"`).
    pub dlq_queue: String,
    /// The schedule table to reinsert retried messages into (e.g.
    /// `"game_reminder"`).
    pub table_id: String,
    /// How often to drain the DLQ.
    pub drain_interval: Duration,
    /// Maximum messages drained per tick.
    pub batch_cap: usize,
    /// Once a message's death count exceeds this, it is archived rather
    /// than retried.
    pub abandon_threshold: u32,
    /// Backoff curve applied to the reinserted row's `due_at`, keyed by
    /// death count.
    pub backoff: RetryPolicy,
}

/// Fatal errors from the retry daemon. Per-message failures are handled in
/// place (archived or logged); only conditions the daemon cannot locally
/// recover from surface here.
#[derive(Error, Debug)]
pub enum RetryDaemonError {
    /// The broker consumer for the DLQ could not be established.
    #[error("broker error: {0}")]
    Broker(String),
}

/// Drains one DLQ on a fixed interval and reschedules or abandons each
/// message found.
pub struct RetryDaemon<B, S, A> {
    broker: Arc<B>,
    store: Arc<S>,
    archive: Arc<A>,
    clock: Arc<dyn Clock>,
    config: RetryDaemonConfig,
}

impl<B, S, A> RetryDaemon<B, S, A>
where
    B: BrokerGateway,
    S: ScheduleStore,
    A: AbandonmentSink,
{
    /// Build a new retry daemon for one DLQ.
    pub fn new(
        broker: Arc<B>,
        store: Arc<S>,
        archive: Arc<A>,
        clock: Arc<dyn Clock>,
        config: RetryDaemonConfig,
    ) -> Self {
        Self {
            broker,
            store,
            archive,
            clock,
            config,
        }
    }

    /// Run the drain loop until `shutdown` is signalled.
    ///
    /// # Errors
    ///
    /// Returns [`RetryDaemonError`] if the DLQ consumer cannot be
    /// (re-)established.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RetryDaemonError> {
        let mut interval = tokio::time::interval(self.config.drain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(dlq = %self.config.dlq_queue, "shutdown signalled, exiting retry daemon");
                        return Ok(());
                    }
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }

            self.drain_once().await?;
        }
    }

    /// Drain up to `batch_cap` messages currently sitting in the DLQ.
    async fn drain_once(&self) -> Result<(), RetryDaemonError> {
        let mut stream: DeliveryStream = self
            .broker
            .consume(&self.config.dlq_queue)
            .await
            .map_err(|e| RetryDaemonError::Broker(e.to_string()))?;

        let mut drained = 0usize;
        while drained < self.config.batch_cap {
            let next = tokio::time::timeout(DRAIN_GRACE_PERIOD, {
                use futures::StreamExt;
                stream.next()
            })
            .await;

            let delivery = match next {
                Ok(Some(Ok(delivery))) => delivery,
                Ok(Some(Err(e))) => {
                    tracing::warn!(dlq = %self.config.dlq_queue, error = %e, "error reading from DLQ, ending this tick");
                    break;
                }
                Ok(None) | Err(_) => break,
            };

            drained += 1;
            self.handle_delivery(delivery).await;
        }

        if drained > 0 {
            tracing::debug!(dlq = %self.config.dlq_queue, drained, "drained DLQ tick");
        }
        if drained == self.config.batch_cap {
            tracing::warn!(
                dlq = %self.config.dlq_queue,
                batch_cap = self.config.batch_cap,
                "DLQ drain hit its per-tick batch cap; more messages may remain queued"
            );
        }

        Ok(())
    }

    async fn handle_delivery(&self, delivery: scheduler_core::broker::Delivery) {
        let scheduler_core::broker::Delivery {
            routing_key,
            body,
            death_count,
            ack_handle,
        } = delivery;

        if death_count > self.config.abandon_threshold {
            self.abandon(
                &routing_key,
                &body,
                death_count,
                format!(
                    "death_count {death_count} exceeds abandon threshold {}",
                    self.config.abandon_threshold
                ),
                ack_handle,
            )
            .await;
            return;
        }

        let Ok(body_json) = serde_json::from_slice::<serde_json::Value>(&body) else {
            self.abandon(
                &routing_key,
                &body,
                death_count,
                "undecodable message body".to_string(),
                ack_handle,
            )
            .await;
            return;
        };

        let subject_key = body_json
            .get("subject_key")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| SubjectKey::new("unknown"), SubjectKey::new);

        let original_kind = body_json
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(routing_key.as_str());
        let kind = ScheduleKind::new(original_kind).as_retry();

        #[allow(clippy::cast_possible_truncation)]
        let backoff = self.config.backoff.delay_for_attempt(death_count as usize);
        let due_at = self.clock.now()
            + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());

        let payload_ref: PayloadRef = serde_json::json!({
            "original_routing_key": routing_key,
            "original_body": body_json,
            "attempt": death_count,
        });

        match self
            .store
            .insert(&self.config.table_id, subject_key, kind, due_at, payload_ref)
            .await
        {
            Ok(id) => {
                DlqMetrics::record_retried(&self.config.dlq_queue);
                tracing::info!(
                    dlq = %self.config.dlq_queue,
                    schedule_id = %id,
                    death_count,
                    due_at = %due_at,
                    "reinserted dead-lettered message through the schedule store"
                );
                self.ack(ack_handle).await;
            }
            Err(ScheduleStoreError::InvalidDueTime { .. }) => {
                // Should not happen: due_at is always now + nonnegative
                // backoff. If it does, archive rather than loop forever.
                self.abandon(
                    &routing_key,
                    &body,
                    death_count,
                    "computed due_at rejected by schedule store".to_string(),
                    ack_handle,
                )
                .await;
            }
            Err(e) => {
                tracing::error!(
                    dlq = %self.config.dlq_queue,
                    error = %e,
                    "failed to reinsert dead-lettered message, leaving it in the DLQ for the next tick"
                );
                // Do not ack: leave it for the next drain tick rather than
                // silently dropping it.
            }
        }
    }

    async fn abandon(
        &self,
        routing_key: &str,
        body: &[u8],
        death_count: u32,
        reason: String,
        ack_handle: AckHandle,
    ) {
        let entry = AbandonedEntry {
            queue_name: self.config.dlq_queue.clone(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            death_count,
            first_seen_at: self.clock.now(),
            reason,
        };

        if let Err(e) = self.archive.record_abandoned(entry).await {
            tracing::error!(
                dlq = %self.config.dlq_queue,
                error = %e,
                "failed to archive abandoned message"
            );
        } else {
            DlqMetrics::record_abandoned(&self.config.dlq_queue);
        }

        self.ack(ack_handle).await;
    }

    async fn ack(&self, handle: AckHandle) {
        if let Err(e) = self.broker.ack(handle).await {
            tracing::error!(dlq = %self.config.dlq_queue, error = %e, "failed to ack DLQ delivery");
        }
    }
}
