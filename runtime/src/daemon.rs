//! Generic scheduler daemon: one instance per schedule table, parameterized
//! by a [`ScheduleTableConfig`] and an [`EventBuilder`]. See `SPEC_FULL.md`
//! §4 and spec.md §4.3 for the control loop this implements.
//!
//! There is exactly one loop implementation here, not one per table — the
//! two schedule tables (reminder/notification, status-transition) are both
//! driven by [`SchedulerDaemon::run`], differing only in their
//! [`ScheduleTableConfig`] and [`EventBuilder`].

use crate::event_builder::EventBuilder;
use crate::metrics::SchedulerMetrics;
use crate::retry::RetryPolicy;
use futures::{FutureExt, StreamExt};
use scheduler_core::broker::BrokerGateway;
use scheduler_core::clock::Clock;
use scheduler_core::notify::NotificationChannel;
use scheduler_core::schedule_store::{ScheduleStore, ScheduleStoreError};
use scheduler_core::subject::ScheduleId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Configuration for one schedule table's daemon instance.
#[derive(Debug, Clone)]
pub struct ScheduleTableConfig {
    /// Which `table_id` this daemon owns (e.g. `"game_reminder"`).
    pub table_id: String,
    /// The `LISTEN/NOTIFY` channel name this table wakes up on (e.g.
    /// `"schedule_wakeup_game_reminder"`).
    pub notify_channel: String,
    /// The routing key this table's events are published under (e.g.
    /// `"game.reminder_due"`). Informational — the event builder is the
    /// actual source of truth for the routing key on each published event.
    pub routing_key_template: String,
    /// `Claimed` rows older than this are reset to `Pending` at daemon
    /// startup, recovering from a crash between `claim` and its terminal
    /// transition. See `DESIGN.md` for the chosen default.
    pub reset_stale_claims_after: Duration,
    /// Once `attempt_count` exceeds this, a row is cancelled rather than
    /// retried again.
    pub max_attempts: u32,
    /// Per-message TTL attached to published events, matching the queue's
    /// DLQ threshold.
    pub message_ttl: Duration,
    /// Backoff curve applied to `mark_pending_again` after a dispatch
    /// failure, keyed by `attempt_count`.
    pub dispatch_backoff: RetryPolicy,
}

/// Errors from the daemon's control loop. Only fatal conditions (database
/// unreachable past budget, notification channel exhausted its reconnect
/// budget) surface here; everything else is handled in place and logged.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The schedule store returned an error the daemon cannot recover from
    /// locally (e.g. the database is unreachable).
    #[error("schedule store error: {0}")]
    Store(#[from] ScheduleStoreError),

    /// The notification channel's subscription failed or its reconnect
    /// budget was exhausted.
    #[error("notification channel error: {0}")]
    Notify(String),
}

/// One schedule table's scheduler daemon.
pub struct SchedulerDaemon<S, N, B> {
    store: Arc<S>,
    notify: Arc<N>,
    broker: Arc<B>,
    clock: Arc<dyn Clock>,
    config: ScheduleTableConfig,
    event_builder: EventBuilder,
}

impl<S, N, B> SchedulerDaemon<S, N, B>
where
    S: ScheduleStore,
    N: NotificationChannel,
    B: BrokerGateway,
{
    /// Build a new daemon instance for one schedule table.
    pub fn new(
        store: Arc<S>,
        notify: Arc<N>,
        broker: Arc<B>,
        clock: Arc<dyn Clock>,
        config: ScheduleTableConfig,
        event_builder: EventBuilder,
    ) -> Self {
        Self {
            store,
            notify,
            broker,
            clock,
            config,
            event_builder,
        }
    }

    /// Run the control loop until `shutdown` is signalled (set to `true`),
    /// finishing any in-flight claim+publish round before returning.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError`] if the schedule store or notification channel
    /// fail in a way that is not locally recoverable — the caller should
    /// treat this as a fatal startup/operational failure per spec.md §7.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let table_id = self.config.table_id.as_str();

        let reset_before = self.clock.now()
            - chrono::Duration::from_std(self.config.reset_stale_claims_after)
                .unwrap_or(chrono::Duration::zero());
        let reset_count = self
            .store
            .reset_stale_claims(table_id, reset_before)
            .await?;
        if reset_count > 0 {
            tracing::warn!(table_id, reset_count, "recovered stale claimed rows at startup");
        }

        let mut arrivals = self
            .notify
            .listen(&[self.config.notify_channel.as_str()])
            .await
            .map_err(|e| DaemonError::Notify(e.to_string()))?;

        loop {
            if *shutdown.borrow() {
                tracing::info!(table_id, "shutdown signalled, exiting control loop");
                return Ok(());
            }

            // Drain any arrivals already buffered, non-blockingly.
            while let Some(Some(arrival)) = arrivals.next().now_or_never() {
                match arrival {
                    Ok(arrival) => tracing::debug!(table_id, synthetic = arrival.synthetic, "drained buffered arrival"),
                    Err(e) => return Err(DaemonError::Notify(e.to_string())),
                }
            }

            let Some((next_id, due_at)) = self.store.peek_next(table_id).await? else {
                // Nothing pending: wait indefinitely for an arrival or shutdown.
                tokio::select! {
                    arrival = arrivals.next() => {
                        match arrival {
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(DaemonError::Notify(e.to_string())),
                            None => return Err(DaemonError::Notify("notification stream ended".to_string())),
                        }
                    }
                    _ = shutdown.changed() => continue,
                }
            };

            let now = self.clock.now();
            let wait = (due_at - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                arrival = arrivals.next() => {
                    match arrival {
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(DaemonError::Notify(e.to_string())),
                        None => return Err(DaemonError::Notify("notification stream ended".to_string())),
                    }
                }
                () = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => continue,
            }

            self.try_dispatch(next_id).await?;
        }
    }

    async fn try_dispatch(&self, id: ScheduleId) -> Result<(), DaemonError> {
        let table_id = self.config.table_id.as_str();
        let now = self.clock.now();

        let row = match self.store.claim(id, now).await {
            Ok(row) => row,
            Err(ScheduleStoreError::AlreadyClaimed { .. } | ScheduleStoreError::NotFound { .. }) => {
                // Another actor handled it, or it was cancelled in the meantime.
                return Ok(());
            }
            Err(ScheduleStoreError::NotDue { .. }) => return Ok(()),
            Err(e @ ScheduleStoreError::DatabaseError(_)) => {
                tracing::warn!(table_id, error = %e, "transient error claiming row, will retry on next wake");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        SchedulerMetrics::record_claim(table_id);
        let start = std::time::Instant::now();

        let dispatch_result = (self.event_builder)(&row).map_err(|e| e.to_string());
        let dispatch_result = match dispatch_result {
            Ok(mut event) => {
                event.ttl = Some(self.config.message_ttl);
                self.broker
                    .publish(&event)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e),
        };

        match dispatch_result {
            Ok(()) => {
                SchedulerMetrics::record_dispatch(table_id, start.elapsed(), true);
                self.store.mark_done(id).await?;
                tracing::info!(table_id, schedule_id = %id, "dispatched and marked done");
            }
            Err(reason) => {
                SchedulerMetrics::record_dispatch(table_id, start.elapsed(), false);
                #[allow(clippy::cast_sign_loss)]
                let attempt_count = row.attempt_count.max(0) as u32;
                if attempt_count >= self.config.max_attempts {
                    self.store.cancel_exhausted(id).await?;
                    tracing::warn!(
                        table_id,
                        schedule_id = %id,
                        attempt_count,
                        reason,
                        "row exhausted max attempts, cancelled"
                    );
                } else {
                    #[allow(clippy::cast_sign_loss)]
                    let backoff = self
                        .config
                        .dispatch_backoff
                        .delay_for_attempt(row.attempt_count.max(0) as usize);
                    let retry_at = self.clock.now()
                        + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
                    self.store.mark_pending_again(id, retry_at).await?;
                    tracing::warn!(
                        table_id,
                        schedule_id = %id,
                        attempt_count,
                        reason,
                        retry_at = %retry_at,
                        "dispatch failed, requeued with backoff"
                    );
                }
            }
        }

        Ok(())
    }
}
