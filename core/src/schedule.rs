//! Schedule row data model.
//!
//! A schedule row is a durable record of a future event, keyed by id,
//! carrying a `due_at` and a processing state. Every schedule table (the
//! reminder/notification schedule, the status-transition schedule, and any
//! future ones) shares this exact shape; only the [`ScheduleKind`] and the
//! event builder that interprets `payload_ref` differ between them.

use crate::kind::ScheduleKind;
use crate::subject::{ScheduleId, SubjectKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque payload the event builder reads to render the outgoing message.
///
/// The scheduler treats this entirely opaquely — producers are responsible
/// for its shape, event builders are responsible for interpreting it.
pub type PayloadRef = serde_json::Value;

/// Lifecycle state of a schedule row.
///
/// Allowed transitions (enforced by [`crate::schedule_store::ScheduleStore`]
/// implementations, ultimately by the database):
///
/// ```text
/// Pending --claim-->        Claimed --publish ok-->     Done
/// Pending --cancel-->       Cancelled
/// Claimed --publish fail--> Pending   (requeue with backoff)
/// Claimed --stale recovery--> Pending
/// ```
///
/// `Done` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    /// Waiting to become due; eligible for `claim` once `due_at` has passed.
    Pending,
    /// Claimed by a scheduler daemon; dispatch is in flight.
    Claimed,
    /// Dispatched successfully. Terminal.
    Done,
    /// Cancelled by a producer or by attempt-cap exhaustion. Terminal.
    Cancelled,
}

impl ScheduleState {
    /// Database string representation, matching the `state` column's
    /// `CHECK` constraint values.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a state from its database string representation.
    ///
    /// # Errors
    ///
    /// Returns `Err` with the offending string if it names no known state.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(other.to_string()),
        }
    }

    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// A durable record of a future event.
///
/// See the module documentation and `SPEC_FULL.md` §1 for the full
/// invariants. Concretely: `due_at` is immutable once `state` is `Claimed`,
/// and `state` transitions follow the graph documented on
/// [`ScheduleState`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleRow {
    /// Primary key, globally unique within this row's table.
    pub id: ScheduleId,
    /// Which logical schedule table this row belongs to (e.g.
    /// `"game_reminder"`, `"game_status_transition"`). Schedulers are scoped
    /// to one `table_id` each; see `SPEC_FULL.md` §1 for why this is a
    /// column rather than a physical table per entity type.
    pub table_id: String,
    /// When this event should fire, UTC.
    pub due_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ScheduleState,
    /// Number of dispatch attempts made so far (incremented on each claim).
    pub attempt_count: i32,
    /// When dispatch was last attempted, if ever.
    pub last_attempted_at: Option<DateTime<Utc>>,
    /// Foreign reference to the domain entity this row pertains to.
    pub subject_key: SubjectKey,
    /// Discriminator narrowing payload semantics within this table.
    pub kind: ScheduleKind,
    /// Opaque data the event builder uses to render the outgoing event.
    pub payload_ref: PayloadRef,
    /// When this row was created.
    pub created_at: DateTime<Utc>,
    /// When this row was last updated.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_str() {
        for state in [
            ScheduleState::Pending,
            ScheduleState::Claimed,
            ScheduleState::Done,
            ScheduleState::Cancelled,
        ] {
            let s = state.as_str();
            assert_eq!(ScheduleState::parse(s), Ok(state));
        }
    }

    #[test]
    fn unknown_state_string_is_rejected() {
        assert!(ScheduleState::parse("unknown").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(ScheduleState::Done.is_terminal());
        assert!(ScheduleState::Cancelled.is_terminal());
        assert!(!ScheduleState::Pending.is_terminal());
        assert!(!ScheduleState::Claimed.is_terminal());
    }
}
