//! In-memory [`ScheduleStore`] for driving scheduler daemon tests without a
//! real Postgres instance.
//!
//! Mirrors `PgScheduleStore`'s semantics closely enough that a test written
//! against this double exercises the same invariants the Postgres trigger
//! enforces: a wake-up fires on insert, on a `due_at` that moves earlier, and
//! on any `claimed -> pending` or `pending -> cancelled` transition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use scheduler_core::clock::Clock;
use scheduler_core::kind::ScheduleKind;
use scheduler_core::notify::NotificationChannel;
use scheduler_core::schedule::{PayloadRef, ScheduleRow, ScheduleState};
use scheduler_core::schedule_store::{ScheduleStore, ScheduleStoreError};
use scheduler_core::subject::{ScheduleId, SubjectKey};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Mirrors `PgScheduleStore`'s `DUE_AT_PAST_TOLERANCE`.
const DUE_AT_PAST_TOLERANCE: ChronoDuration = ChronoDuration::seconds(5);

/// Mirrors `PgScheduleStore`'s `CLAIM_EPSILON`.
const CLAIM_EPSILON: ChronoDuration = ChronoDuration::milliseconds(50);

fn wakeup_channel(table_id: &str) -> String {
    format!("schedule_wakeup_{table_id}")
}

/// In-process `ScheduleStore` backed by a `HashMap`, wired to a
/// [`NotificationChannel`] so its mutations fire the same wake-ups a real
/// Postgres trigger would.
pub struct InMemoryScheduleStore {
    rows: Mutex<HashMap<i64, ScheduleRow>>,
    next_id: AtomicI64,
    notify: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
}

impl InMemoryScheduleStore {
    /// Build an empty store. `notify` is the channel the daemon under test
    /// listens on; `clock` drives `due_at`/`attempt` arithmetic.
    #[must_use]
    pub fn new(notify: Arc<dyn NotificationChannel>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            notify,
            clock,
        }
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ScheduleRow>> {
        self.rows.lock().expect("schedule row map poisoned")
    }

    /// Direct lookup for test assertions, bypassing the trait.
    #[must_use]
    pub fn get(&self, id: ScheduleId) -> Option<ScheduleRow> {
        self.rows().get(&id.get()).cloned()
    }

    async fn wake(&self, table_id: &str) {
        let _ = self.notify.notify(&wakeup_channel(table_id)).await;
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn insert(
        &self,
        table_id: &str,
        subject_key: SubjectKey,
        kind: ScheduleKind,
        due_at: DateTime<Utc>,
        payload_ref: PayloadRef,
    ) -> Pin<Box<dyn Future<Output = Result<ScheduleId, ScheduleStoreError>> + Send + '_>> {
        let table_id = table_id.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            if due_at < now - DUE_AT_PAST_TOLERANCE {
                return Err(ScheduleStoreError::InvalidDueTime { due_at });
            }

            let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = ScheduleId::new(raw_id);
            let row = ScheduleRow {
                id,
                table_id: table_id.clone(),
                due_at,
                state: ScheduleState::Pending,
                attempt_count: 0,
                last_attempted_at: None,
                subject_key,
                kind,
                payload_ref,
                created_at: now,
                updated_at: now,
            };
            self.rows().insert(raw_id, row);

            self.wake(&table_id).await;
            Ok(id)
        })
    }

    fn reschedule(
        &self,
        id: ScheduleId,
        new_due_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let fire = {
                let mut rows = self.rows();
                let row = rows
                    .get_mut(&id.get())
                    .ok_or(ScheduleStoreError::NotPending { id })?;
                if row.state != ScheduleState::Pending {
                    return Err(ScheduleStoreError::NotPending { id });
                }
                let earlier = new_due_at < row.due_at;
                row.due_at = new_due_at;
                row.updated_at = self.clock.now();
                earlier.then(|| row.table_id.clone())
            };

            if let Some(table_id) = fire {
                self.wake(&table_id).await;
            }
            Ok(())
        })
    }

    fn cancel_by_subject(
        &self,
        table_id: &str,
        subject_key: &SubjectKey,
        kind: Option<&ScheduleKind>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleStoreError>> + Send + '_>> {
        let table_id = table_id.to_string();
        let subject_key = subject_key.clone();
        let kind = kind.cloned();
        Box::pin(async move {
            let count = {
                let mut rows = self.rows();
                let mut count = 0u64;
                for row in rows.values_mut() {
                    if row.table_id == table_id
                        && row.subject_key == subject_key
                        && row.state == ScheduleState::Pending
                        && kind.as_ref().is_none_or(|k| *k == row.kind)
                    {
                        row.state = ScheduleState::Cancelled;
                        row.updated_at = self.clock.now();
                        count += 1;
                    }
                }
                count
            };

            if count > 0 {
                self.wake(&table_id).await;
            }
            Ok(count)
        })
    }

    fn cancel(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let table_id = {
                let mut rows = self.rows();
                let Some(row) = rows.get_mut(&id.get()) else {
                    return Ok(false);
                };
                if row.state != ScheduleState::Pending {
                    return Ok(false);
                }
                row.state = ScheduleState::Cancelled;
                row.updated_at = self.clock.now();
                row.table_id.clone()
            };

            self.wake(&table_id).await;
            Ok(true)
        })
    }

    fn peek_next(
        &self,
        table_id: &str,
    ) -> Pin<
        Box<dyn Future<Output = Result<Option<(ScheduleId, DateTime<Utc>)>, ScheduleStoreError>> + Send + '_>,
    > {
        let table_id = table_id.to_string();
        Box::pin(async move {
            let rows = self.rows();
            let next = rows
                .values()
                .filter(|row| row.table_id == table_id && row.state == ScheduleState::Pending)
                .min_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)))
                .map(|row| (row.id, row.due_at));
            Ok(next)
        })
    }

    fn claim(
        &self,
        id: ScheduleId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ScheduleRow, ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows();
            let row = rows.get_mut(&id.get()).ok_or(ScheduleStoreError::NotFound { id })?;

            if row.state != ScheduleState::Pending {
                return Err(ScheduleStoreError::AlreadyClaimed { id });
            }
            if row.due_at > now + CLAIM_EPSILON {
                return Err(ScheduleStoreError::NotDue { id });
            }

            row.state = ScheduleState::Claimed;
            row.attempt_count += 1;
            row.last_attempted_at = Some(now);
            row.updated_at = now;
            Ok(row.clone())
        })
    }

    fn mark_done(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows();
            if let Some(row) = rows.get_mut(&id.get()) {
                if row.state == ScheduleState::Claimed {
                    row.state = ScheduleState::Done;
                    row.updated_at = self.clock.now();
                }
            }
            Ok(())
        })
    }

    fn mark_pending_again(
        &self,
        id: ScheduleId,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let table_id = {
                let mut rows = self.rows();
                let Some(row) = rows.get_mut(&id.get()) else {
                    return Ok(());
                };
                if row.state != ScheduleState::Claimed {
                    return Ok(());
                }
                row.state = ScheduleState::Pending;
                row.due_at = retry_at;
                row.updated_at = self.clock.now();
                row.table_id.clone()
            };

            self.wake(&table_id).await;
            Ok(())
        })
    }

    fn reset_stale_claims(
        &self,
        table_id: &str,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleStoreError>> + Send + '_>> {
        let table_id = table_id.to_string();
        Box::pin(async move {
            let count = {
                let mut rows = self.rows();
                let mut count = 0u64;
                for row in rows.values_mut() {
                    if row.table_id == table_id
                        && row.state == ScheduleState::Claimed
                        && row.last_attempted_at.is_some_and(|t| t < older_than)
                    {
                        row.state = ScheduleState::Pending;
                        row.updated_at = self.clock.now();
                        count += 1;
                    }
                }
                count
            };

            if count > 0 {
                self.wake(&table_id).await;
            }
            Ok(count)
        })
    }

    fn cancel_exhausted(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows();
            if let Some(row) = rows.get_mut(&id.get()) {
                row.state = ScheduleState::Cancelled;
                row.updated_at = self.clock.now();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock;
    use crate::notify::InMemoryNotificationChannel;
    use futures::StreamExt;
    use serde_json::json;

    fn store() -> (InMemoryScheduleStore, Arc<InMemoryNotificationChannel>) {
        let notify = Arc::new(InMemoryNotificationChannel::new());
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        (InMemoryScheduleStore::new(notify.clone(), clock), notify)
    }

    #[tokio::test]
    async fn insert_fires_wakeup() {
        let (store, notify) = store();
        let mut arrivals = notify.listen(&["game_reminder"]).await.unwrap();

        store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                Utc::now() + ChronoDuration::seconds(30),
                json!({"user": "u1"}),
            )
            .await
            .unwrap();

        let arrival = arrivals.next().await.unwrap().unwrap();
        assert_eq!(arrival.table_id, "game_reminder");
    }

    #[tokio::test]
    async fn insert_rejects_due_at_far_in_the_past() {
        let (store, _notify) = store();
        let result = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                Utc::now() - ChronoDuration::hours(1),
                json!({}),
            )
            .await;
        assert!(matches!(result, Err(ScheduleStoreError::InvalidDueTime { .. })));
    }

    #[tokio::test]
    async fn claim_requires_pending_and_due() {
        let (store, _notify) = store();
        let due_at = Utc::now();
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                due_at,
                json!({}),
            )
            .await
            .unwrap();

        let row = store.claim(id, due_at).await.unwrap();
        assert_eq!(row.state, ScheduleState::Claimed);
        assert_eq!(row.attempt_count, 1);

        let second = store.claim(id, due_at).await;
        assert!(matches!(second, Err(ScheduleStoreError::AlreadyClaimed { .. })));
    }

    #[tokio::test]
    async fn cancel_before_due_prevents_claim() {
        let (store, _notify) = store();
        let due_at = Utc::now() + ChronoDuration::seconds(10);
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                due_at,
                json!({}),
            )
            .await
            .unwrap();

        assert!(store.cancel(id).await.unwrap());
        assert_eq!(store.peek_next("game_reminder").await.unwrap(), None);

        let claimed = store.claim(id, due_at).await;
        assert!(matches!(claimed, Err(ScheduleStoreError::AlreadyClaimed { .. })));
    }

    #[tokio::test]
    async fn reschedule_earlier_updates_peek_next() {
        let (store, _notify) = store();
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                Utc::now() + ChronoDuration::seconds(60),
                json!({}),
            )
            .await
            .unwrap();

        store
            .reschedule(id, Utc::now() + ChronoDuration::seconds(3))
            .await
            .unwrap();

        let (peeked_id, due_at) = store.peek_next("game_reminder").await.unwrap().unwrap();
        assert_eq!(peeked_id, id);
        assert!(due_at <= Utc::now() + ChronoDuration::seconds(3));
    }

    #[tokio::test]
    async fn mark_pending_again_requeues_for_retry() {
        let (store, _notify) = store();
        let due_at = Utc::now();
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                due_at,
                json!({}),
            )
            .await
            .unwrap();
        store.claim(id, due_at).await.unwrap();

        let retry_at = Utc::now() + ChronoDuration::seconds(5);
        store.mark_pending_again(id, retry_at).await.unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.state, ScheduleState::Pending);
        assert_eq!(row.due_at, retry_at);
    }

    #[tokio::test]
    async fn reset_stale_claims_recovers_crashed_dispatch() {
        let (store, _notify) = store();
        let due_at = Utc::now();
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                due_at,
                json!({}),
            )
            .await
            .unwrap();
        store.claim(id, due_at).await.unwrap();

        let recovered = store
            .reset_stale_claims("game_reminder", Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(store.get(id).unwrap().state, ScheduleState::Pending);
    }

    #[tokio::test]
    async fn cancel_exhausted_is_terminal() {
        let (store, _notify) = store();
        let due_at = Utc::now();
        let id = store
            .insert(
                "game_reminder",
                SubjectKey::new("game-1"),
                ScheduleKind::new("reminder"),
                due_at,
                json!({}),
            )
            .await
            .unwrap();
        store.claim(id, due_at).await.unwrap();

        store.cancel_exhausted(id).await.unwrap();
        assert_eq!(store.get(id).unwrap().state, ScheduleState::Cancelled);
    }
}
