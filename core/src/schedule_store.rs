//! Schedule store trait: durable storage of future events with efficient
//! "next due" retrieval and event-driven change notification.
//!
//! # Design
//!
//! The `ScheduleStore` trait is deliberately minimal. It distinguishes two
//! callers with different privileges, matching `SPEC_FULL.md` §1's ownership
//! rule ("schedule rows are owned by the scheduler daemon... domain
//! producers create and cancel rows but do not mutate `state`"):
//!
//! - **Producer operations** (`insert`, `reschedule`, `cancel_by_subject`,
//!   `cancel`): used by the API and bot to create and retire rows.
//! - **Daemon operations** (`peek_next`, `claim`, `mark_done`,
//!   `mark_pending_again`): used exclusively by the scheduler daemon that
//!   owns a given `table_id`.
//!
//! # Dyn Compatibility
//!
//! Like the teacher's `EventStore` trait, this trait returns explicit
//! `Pin<Box<dyn Future>>` rather than using `async fn in trait`, so it stays
//! object-safe (`Arc<dyn ScheduleStore>`) — needed because the daemon loop
//! and retry daemon are generic over the store implementation but the
//! service binary wires up a concrete implementation behind a trait object.

use crate::kind::ScheduleKind;
use crate::schedule::{PayloadRef, ScheduleRow};
use crate::subject::{ScheduleId, SubjectKey};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from schedule store operations.
#[derive(Error, Debug)]
pub enum ScheduleStoreError {
    /// `insert` was called with a `due_at` in the past beyond the configured
    /// tolerance.
    #[error("due_at {due_at} is too far in the past (tolerance exceeded)")]
    InvalidDueTime {
        /// The offending `due_at`.
        due_at: DateTime<Utc>,
    },

    /// `reschedule` was called on a row that is not `Pending`.
    #[error("schedule row {id} is not pending")]
    NotPending {
        /// The row that failed the precondition.
        id: ScheduleId,
    },

    /// `claim` was called on a row already claimed (or otherwise no longer
    /// `Pending`) by another actor.
    #[error("schedule row {id} is already claimed")]
    AlreadyClaimed {
        /// The row that failed the precondition.
        id: ScheduleId,
    },

    /// `claim` was called before the row's `due_at` (plus epsilon) elapsed.
    #[error("schedule row {id} is not yet due")]
    NotDue {
        /// The row that failed the precondition.
        id: ScheduleId,
    },

    /// The referenced row does not exist.
    #[error("schedule row {id} not found")]
    NotFound {
        /// The missing row's id.
        id: ScheduleId,
    },

    /// Database connection or query failure.
    #[error("database error: {0}")]
    DatabaseError(String),
}

/// Durable storage of future events for one or more schedule tables.
///
/// See the module documentation for the producer/daemon operation split.
pub trait ScheduleStore: Send + Sync {
    /// Insert a new schedule row, firing a wake-up notification.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::InvalidDueTime`] if `due_at` is in the
    /// past by more than the store's configured tolerance. Otherwise this
    /// always succeeds.
    fn insert(
        &self,
        table_id: &str,
        subject_key: SubjectKey,
        kind: ScheduleKind,
        due_at: DateTime<Utc>,
        payload_ref: PayloadRef,
    ) -> Pin<Box<dyn Future<Output = Result<ScheduleId, ScheduleStoreError>> + Send + '_>>;

    /// Move a `Pending` row's `due_at`. Fires a wake-up notification iff
    /// `new_due_at` is earlier than the table's current earliest pending
    /// `due_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::NotPending`] if the row is not
    /// currently `Pending`.
    fn reschedule(
        &self,
        id: ScheduleId,
        new_due_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>>;

    /// Cancel all `Pending` rows for a subject, optionally narrowed to one
    /// `kind`. Fires a wake-up notification so the owning daemon
    /// re-evaluates its next-due row.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure. Matching no
    /// rows is not an error.
    fn cancel_by_subject(
        &self,
        table_id: &str,
        subject_key: &SubjectKey,
        kind: Option<&ScheduleKind>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleStoreError>> + Send + '_>>;

    /// Cancel one row by id, if it is still `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure. Cancelling
    /// a row that is already terminal or missing is not an error (returns
    /// `false`).
    fn cancel(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, ScheduleStoreError>> + Send + '_>>;

    /// Return the id and `due_at` of the `Pending` row with the smallest
    /// `due_at` in the given table, or `None` if there is none. Ties break
    /// on the smaller id.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure.
    fn peek_next(
        &self,
        table_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(ScheduleId, DateTime<Utc>)>, ScheduleStoreError>> + Send + '_>>;

    /// Atomically transition a row from `Pending` to `Claimed`, provided it
    /// is still `Pending` and `due_at <= now + epsilon`. Increments
    /// `attempt_count` and sets `last_attempted_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::AlreadyClaimed`] if another actor
    /// claimed it first (or it was cancelled), or
    /// [`ScheduleStoreError::NotDue`] if `due_at` has not yet elapsed.
    fn claim(
        &self,
        id: ScheduleId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ScheduleRow, ScheduleStoreError>> + Send + '_>>;

    /// Terminally transition a `Claimed` row to `Done` after a successful
    /// publish.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure.
    fn mark_done(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>>;

    /// Return a `Claimed` row to `Pending` with a new `due_at`, after a
    /// dispatch failure. Fires a wake-up notification if `retry_at` is
    /// sooner than the table's previously known earliest pending `due_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure.
    fn mark_pending_again(
        &self,
        id: ScheduleId,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>>;

    /// Reset `Claimed` rows older than `older_than` back to `Pending`.
    ///
    /// Called once at daemon startup to recover from a crash between
    /// `claim` and `mark_done`/`mark_pending_again` (see `SPEC_FULL.md` §1
    /// and spec.md §4.3's stale-claim recovery policy).
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure.
    fn reset_stale_claims(
        &self,
        table_id: &str,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ScheduleStoreError>> + Send + '_>>;

    /// Terminally cancel a row whose `attempt_count` has exceeded the
    /// configured cap, per the row-level error tier in spec.md §7.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleStoreError::DatabaseError`] on failure.
    fn cancel_exhausted(
        &self,
        id: ScheduleId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ScheduleStoreError>> + Send + '_>>;
}
