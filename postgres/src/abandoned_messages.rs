//! Archive of dead-letter messages the retry daemon has given up on.
//!
//! Mirrors the teacher's `DeadLetterQueue` module: a write path for the
//! retry daemon and a read path for incident response, so the audit trail
//! spec.md §7 requires ("abandoned DLQ messages leave an archive record")
//! is actually queryable rather than write-only.

use chrono::{DateTime, Utc};
use scheduler_core::abandonment::{AbandonedEntry, AbandonmentError, AbandonmentSink};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// An archived, permanently-abandoned dead-letter message.
#[derive(Debug, Clone)]
pub struct AbandonedMessage {
    /// Unique identifier for this archive entry.
    pub id: i64,
    /// The DLQ this message was drained from.
    pub queue_name: String,
    /// The routing key the message was originally published under.
    pub routing_key: String,
    /// Raw message body at the time it was abandoned.
    pub body: Vec<u8>,
    /// Number of times the broker recorded this message as dead-lettered.
    pub death_count: i32,
    /// When the message was first observed in its DLQ.
    pub first_seen_at: DateTime<Utc>,
    /// When it was archived (i.e. abandoned).
    pub archived_at: DateTime<Utc>,
    /// Why it was abandoned (e.g. "death_count 8 exceeds abandon threshold 5").
    pub reason: String,
}

/// `PostgreSQL`-backed archive for permanently abandoned dead-letter
/// messages.
pub struct AbandonedMessageArchive {
    pool: PgPool,
}

impl AbandonedMessageArchive {
    /// Create a new archive with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Archive a message the retry daemon has given up on.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_entry(
        &self,
        queue_name: &str,
        routing_key: &str,
        body: &[u8],
        death_count: i32,
        first_seen_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO abandoned_messages (
                queue_name, routing_key, body, death_count, first_seen_at, reason
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(queue_name)
        .bind(routing_key)
        .bind(body)
        .bind(death_count)
        .bind(first_seen_at)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            archive_id = id,
            queue_name,
            routing_key,
            death_count,
            reason,
            "message abandoned to archive"
        );
        metrics::counter!("scheduler.dlq.abandoned", "queue" => queue_name.to_string())
            .increment(1);

        Ok(id)
    }

    /// List the most recently archived messages for one queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_pending(
        &self,
        queue_name: &str,
        limit: i64,
    ) -> Result<Vec<AbandonedMessage>, sqlx::Error> {
        let rows = sqlx::query(
            r"
            SELECT id, queue_name, routing_key, body, death_count, first_seen_at, archived_at, reason
            FROM abandoned_messages
            WHERE queue_name = $1
            ORDER BY archived_at DESC
            LIMIT $2
            ",
        )
        .bind(queue_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_message).collect())
    }

    /// Count archived messages for one queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_pending(&self, queue_name: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM abandoned_messages WHERE queue_name = $1",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> AbandonedMessage {
        AbandonedMessage {
            id: row.get("id"),
            queue_name: row.get("queue_name"),
            routing_key: row.get("routing_key"),
            body: row.get("body"),
            death_count: row.get("death_count"),
            first_seen_at: row.get("first_seen_at"),
            archived_at: row.get("archived_at"),
            reason: row.get("reason"),
        }
    }
}

impl AbandonmentSink for AbandonedMessageArchive {
    fn record_abandoned(
        &self,
        entry: AbandonedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), AbandonmentError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let death_count = entry.death_count as i32;
            self.add_entry(
                &entry.queue_name,
                &entry.routing_key,
                &entry.body,
                death_count,
                entry.first_seen_at,
                &entry.reason,
            )
            .await
            .map_err(|e| AbandonmentError::WriteFailed(e.to_string()))?;
            Ok(())
        })
    }
}
