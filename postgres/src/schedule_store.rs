//! `PostgreSQL`-backed implementation of [`scheduler_core::schedule_store::ScheduleStore`].

use chrono::{DateTime, Duration, Utc};
use scheduler_core::kind::ScheduleKind;
use scheduler_core::schedule::{PayloadRef, ScheduleRow, ScheduleState};
use scheduler_core::schedule_store::{ScheduleStore, ScheduleStoreError};
use scheduler_core::subject::{ScheduleId, SubjectKey};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// How far in the past `insert` tolerates a `due_at` before rejecting it.
///
/// A small tolerance absorbs clock skew and request latency between a
/// producer computing `due_at` and the insert landing; anything further in
/// the past than this is almost certainly a caller bug, not a legitimately
/// orphaned row (orphaned-by-outage rows are created with a sane `due_at`
/// and simply become overdue while the daemon was down — that is handled at
/// dispatch time, not at insert time).
const DUE_AT_PAST_TOLERANCE: Duration = Duration::seconds(5);

/// Claim epsilon: a row is claimable once `due_at <= now + epsilon`, so a
/// claim racing a few milliseconds ahead of its own wake timer still
/// succeeds instead of spuriously failing with `NotDue`.
const CLAIM_EPSILON: Duration = Duration::milliseconds(50);

fn sqlx_err(e: sqlx::Error) -> ScheduleStoreError {
    ScheduleStoreError::DatabaseError(e.to_string())
}

fn row_to_schedule_row(row: &sqlx::postgres::PgRow) -> Result<ScheduleRow, ScheduleStoreError> {
    let state_str: String = row.get("state");
    let state = ScheduleState::parse(&state_str)
        .map_err(|s| ScheduleStoreError::DatabaseError(format!("unknown state in row: {s}")))?;

    Ok(ScheduleRow {
        id: ScheduleId::new(row.get("id")),
        table_id: row.get("table_id"),
        due_at: row.get("due_at"),
        state,
        attempt_count: row.get("attempt_count"),
        last_attempted_at: row.get("last_attempted_at"),
        subject_key: SubjectKey::new(row.get::<String, _>("subject_key")),
        kind: ScheduleKind::new(row.get::<String, _>("kind")),
        payload_ref: row.get::<serde_json::Value, _>("payload_ref"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// `ScheduleStore` backed by the `schedule_rows` table (see the
/// `0001_schedule_rows.sql` migration). Safe to share across tasks; holds a
/// `sqlx::PgPool`, not a dedicated connection.
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    /// Build a store over an existing pool. Callers are responsible for
    /// running migrations first (see `scheduler-service`'s `--migrate-only`
    /// mode).
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run this crate's migrations against `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if any migration fails to apply.
    pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    /// The underlying pool, for callers (e.g. health checks) that need raw
    /// access.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ScheduleStore for PgScheduleStore {
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
            if due_at < Utc::now() - DUE_AT_PAST_TOLERANCE {
                return Err(ScheduleStoreError::InvalidDueTime { due_at });
            }

            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO schedule_rows (table_id, due_at, state, subject_key, kind, payload_ref)
                VALUES ($1, $2, 'pending', $3, $4, $5)
                RETURNING id
                ",
            )
            .bind(&table_id)
            .bind(due_at)
            .bind(subject_key.as_str())
            .bind(kind.as_str())
            .bind(payload_ref)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?;

            tracing::debug!(schedule_id = id, table_id, "schedule row inserted");
            metrics::counter!("scheduler.rows.inserted", "table_id" => table_id).increment(1);

            Ok(ScheduleId::new(id))
        })
    }

    fn reschedule(
        &self,
        id: ScheduleId,
        new_due_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE schedule_rows
                SET due_at = $1
                WHERE id = $2 AND state = 'pending'
                ",
            )
            .bind(new_due_at)
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            if result.rows_affected() == 0 {
                return Err(ScheduleStoreError::NotPending { id });
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
        let subject_key = subject_key.as_str().to_string();
        let kind = kind.map(|k| k.as_str().to_string());
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'cancelled'
                WHERE table_id = $1 AND subject_key = $2 AND state = 'pending'
                  AND ($3::text IS NULL OR kind = $3)
                ",
            )
            .bind(&table_id)
            .bind(&subject_key)
            .bind(&kind)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            Ok(result.rows_affected())
        })
    }

    fn cancel(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'cancelled'
                WHERE id = $1 AND state = 'pending'
                ",
            )
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn peek_next(
        &self,
        table_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(ScheduleId, DateTime<Utc>)>, ScheduleStoreError>> + Send + '_>>
    {
        let table_id = table_id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, due_at
                FROM schedule_rows
                WHERE table_id = $1 AND state = 'pending'
                ORDER BY due_at ASC, id ASC
                LIMIT 1
                ",
            )
            .bind(&table_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

            Ok(row.map(|r| (ScheduleId::new(r.get("id")), r.get("due_at"))))
        })
    }

    fn claim(
        &self,
        id: ScheduleId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ScheduleRow, ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            let deadline = now + CLAIM_EPSILON;

            let row = sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'claimed',
                    attempt_count = attempt_count + 1,
                    last_attempted_at = $2
                WHERE id = $1 AND state = 'pending' AND due_at <= $3
                RETURNING *
                ",
            )
            .bind(id.get())
            .bind(now)
            .bind(deadline)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

            let Some(row) = row else {
                // Distinguish "someone else claimed/cancelled it" from "not due yet"
                // with a follow-up read; the claim itself is still one atomic
                // statement, so there is no TOCTOU window for correctness, only
                // for which error variant we report.
                let existing = sqlx::query(
                    "SELECT state, due_at FROM schedule_rows WHERE id = $1",
                )
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_err)?;

                return match existing {
                    Some(r) => {
                        let state: String = r.get("state");
                        let due_at: DateTime<Utc> = r.get("due_at");
                        if state == "pending" && due_at > deadline {
                            Err(ScheduleStoreError::NotDue { id })
                        } else {
                            Err(ScheduleStoreError::AlreadyClaimed { id })
                        }
                    }
                    None => Err(ScheduleStoreError::NotFound { id }),
                };
            };

            let schedule_row = row_to_schedule_row(&row)?;
            tracing::debug!(schedule_id = id.get(), table_id = %schedule_row.table_id, "schedule row claimed");
            metrics::counter!("scheduler.claims.total", "table_id" => schedule_row.table_id.clone())
                .increment(1);

            Ok(schedule_row)
        })
    }

    fn mark_done(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'done'
                WHERE id = $1 AND state = 'claimed'
                ",
            )
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            Ok(())
        })
    }

    fn mark_pending_again(
        &self,
        id: ScheduleId,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'pending', due_at = $2
                WHERE id = $1 AND state = 'claimed'
                ",
            )
            .bind(id.get())
            .bind(retry_at)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

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
            let result = sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'pending'
                WHERE table_id = $1 AND state = 'claimed' AND last_attempted_at < $2
                ",
            )
            .bind(&table_id)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            let recovered = result.rows_affected();
            if recovered > 0 {
                tracing::warn!(table_id, recovered, "recovered stale claimed rows on startup");
            }

            Ok(recovered)
        })
    }

    fn cancel_exhausted(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE schedule_rows
                SET state = 'cancelled'
                WHERE id = $1
                ",
            )
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            tracing::warn!(schedule_id = id.get(), "row cancelled after exhausting attempt cap");
            metrics::counter!("scheduler.rows.exhausted").increment(1);

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_epsilon_is_small() {
        assert!(CLAIM_EPSILON < Duration::seconds(1));
    }

    #[test]
    fn due_at_tolerance_is_small() {
        assert!(DUE_AT_PAST_TOLERANCE < Duration::minutes(1));
    }
}
