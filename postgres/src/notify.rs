//! `PostgreSQL` `LISTEN/NOTIFY`-backed implementation of
//! [`scheduler_core::notify::NotificationChannel`].

use async_stream::stream;
use scheduler_core::notify::{Arrival, ArrivalStream, NotificationChannel, NotifyError};
use scheduler_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use scheduler_runtime::retry::RetryPolicy;
use sqlx::postgres::PgListener;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Reconnect attempts tolerated before surfacing a fatal error to the
/// daemon, per `SPEC_FULL.md` §2's "give up" budget.
const MAX_RECONNECT_ATTEMPTS: usize = 60;

/// Reconnecting `LISTEN/NOTIFY` client.
///
/// Owns a dedicated, non-pooled connection via `sqlx::postgres::PgListener`
/// (per spec.md §5 "one dedicated to the notification subscription"). On
/// every reconnect it re-subscribes to every previously-listened channel and
/// emits one synthetic [`Arrival`] per channel, so notifications sent while
/// disconnected are not silently lost — the daemon always re-derives truth
/// from `peek_next` rather than trusting delivery completeness.
///
/// Reconnects back off via [`RetryPolicy`] and are gated by a
/// [`CircuitBreaker`]: once the breaker is open, attempts fast-fail without
/// touching the network until its timeout elapses, per `SPEC_FULL.md` §2.
pub struct PgNotifyListener {
    database_url: String,
    retry_policy: RetryPolicy,
    circuit_breaker: CircuitBreaker,
}

impl PgNotifyListener {
    /// Build a listener that will connect (and reconnect) to `database_url`.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            retry_policy: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(30))
                .multiplier(2.0)
                .build(),
            circuit_breaker: CircuitBreaker::new(
                CircuitBreakerConfig::builder()
                    .failure_threshold(5)
                    .timeout(Duration::from_secs(30))
                    .success_threshold(1)
                    .build(),
            ),
        }
    }
}

impl NotificationChannel for PgNotifyListener {
    fn notify(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        // Producers normally rely on the database trigger (see
        // `0001_schedule_rows.sql`) to notify on insert/update; this direct
        // path exists for callers (e.g. the retry daemon) that need to
        // nudge a daemon without going through the schedule store.
        let channel = channel.to_string();
        let database_url = self.database_url.clone();
        Box::pin(async move {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect(&database_url)
                .await
                .map_err(|e| NotifyError::ConnectionFailed(e.to_string()))?;

            sqlx::query("SELECT pg_notify($1, '')")
                .bind(&channel)
                .execute(&pool)
                .await
                .map_err(|e| NotifyError::NotifyFailed {
                    channel: channel.clone(),
                    reason: e.to_string(),
                })?;

            Ok(())
        })
    }

    fn listen(
        &self,
        channels: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<ArrivalStream, NotifyError>> + Send + '_>> {
        let channels: Vec<String> = channels.iter().map(ToString::to_string).collect();
        let database_url = self.database_url.clone();
        let retry_policy = self.retry_policy.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        Box::pin(async move {
            let listener = connect_and_listen(&database_url, &channels).await?;

            let stream: ArrivalStream = Box::pin(stream! {
                let mut listener = listener;
                let mut channels = channels;

                loop {
                    match listener.recv().await {
                        Ok(notification) => {
                            yield Ok(Arrival {
                                table_id: notification.channel().to_string(),
                                synthetic: false,
                            });
                        }
                        Err(_) => {
                            // Connection dropped. Reconnect with backoff under a
                            // circuit breaker, then synthesize one wake-up per
                            // channel so the daemon re-checks everything it cares
                            // about.
                            let mut attempts = 0;
                            loop {
                                tokio::time::sleep(retry_policy.delay_for_attempt(attempts)).await;
                                attempts += 1;

                                let url = database_url.clone();
                                let chans = channels.clone();
                                let outcome = circuit_breaker
                                    .call(|| async move { connect_and_listen(&url, &chans).await })
                                    .await;

                                match outcome {
                                    Ok(reconnected) => {
                                        listener = reconnected;
                                        break;
                                    }
                                    Err(CircuitBreakerError::Open) if attempts >= MAX_RECONNECT_ATTEMPTS => {
                                        yield Err(NotifyError::ConnectionFailed(
                                            "circuit breaker open, giving up on reconnect".to_string(),
                                        ));
                                        return;
                                    }
                                    Err(CircuitBreakerError::Inner(e)) if attempts >= MAX_RECONNECT_ATTEMPTS => {
                                        yield Err(e);
                                        return;
                                    }
                                    Err(CircuitBreakerError::Open) => {
                                        tracing::warn!(
                                            attempt = attempts,
                                            "notification channel reconnect skipped, circuit breaker open"
                                        );
                                    }
                                    Err(CircuitBreakerError::Inner(e)) => {
                                        tracing::warn!(
                                            attempt = attempts,
                                            error = %e,
                                            "notification channel reconnect failed, retrying"
                                        );
                                    }
                                }
                            }

                            metrics::counter!("scheduler.notify.reconnects").increment(1);
                            for channel in &channels {
                                yield Ok(Arrival {
                                    table_id: channel.clone(),
                                    synthetic: true,
                                });
                            }
                        }
                    }
                }

                // `channels` never shrinks; keep clippy quiet about the
                // no-op reassignment it performs inside the loop above.
                let _ = &mut channels;
            });

            Ok(stream)
        })
    }
}

async fn connect_and_listen(
    database_url: &str,
    channels: &[String],
) -> Result<PgListener, NotifyError> {
    let mut listener = PgListener::connect(database_url)
        .await
        .map_err(|e| NotifyError::ConnectionFailed(e.to_string()))?;

    for channel in channels {
        listener
            .listen(channel)
            .await
            .map_err(|e| NotifyError::ListenFailed {
                channel: channel.clone(),
                reason: e.to_string(),
            })?;
    }

    Ok(listener)
}
