//! Per-table event builders: pure functions translating a claimed
//! [`ScheduleRow`] into the [`OutgoingEvent`] the daemon publishes.
//!
//! Both schedule tables in this system read entirely from `payload_ref` — no
//! external enrichment is needed — so the "payload loader" hook from
//! `SPEC_FULL.md` §4 collapses to the identity function here and isn't
//! modeled as a separate type; an event builder is simply
//! `fn(&ScheduleRow) -> Result<OutgoingEvent, BuildError>`.

use scheduler_core::broker::OutgoingEvent;
use scheduler_core::schedule::ScheduleRow;
use thiserror::Error;

/// Errors building an outgoing event from a claimed row.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    /// `payload_ref` is missing a field the builder requires.
    #[error("payload_ref missing required field '{0}'")]
    MissingField(String),

    /// The assembled body could not be serialized.
    #[error("failed to serialize event body: {0}")]
    Serialization(String),
}

/// A per-table pure function translating a claimed row into its outgoing
/// event. See `SPEC_FULL.md` §4.
pub type EventBuilder = fn(&ScheduleRow) -> Result<OutgoingEvent, BuildError>;

/// Builds `game.reminder_due` events for the reminder/notification schedule.
///
/// Body fields match `SPEC_FULL.md` §6: `schedule_id`, `subject_key`, `kind`,
/// `payload_ref`, `fire_time`.
///
/// # Errors
///
/// Returns [`BuildError::Serialization`] if the body cannot be serialized
/// (never expected in practice, since every field is already either a
/// primitive or a `serde_json::Value`).
pub fn reminder_event_builder(row: &ScheduleRow) -> Result<OutgoingEvent, BuildError> {
    let body = serde_json::json!({
        "schedule_id": row.id.get(),
        "subject_key": row.subject_key.as_str(),
        "kind": row.kind.as_str(),
        "payload_ref": row.payload_ref,
        "fire_time": row.due_at.to_rfc3339(),
    });

    Ok(OutgoingEvent {
        routing_key: "game.reminder_due".to_string(),
        body: serde_json::to_vec(&body).map_err(|e| BuildError::Serialization(e.to_string()))?,
        ttl: None,
    })
}

/// Builds `game.status_transition` events for the status-transition schedule.
///
/// Body fields match `SPEC_FULL.md` §6: `schedule_id`, `subject_key`,
/// `from_state`, `to_state`. `from_state`/`to_state` are read from
/// `payload_ref`, which the producer populates at insert time.
///
/// # Errors
///
/// Returns [`BuildError::MissingField`] if `payload_ref` lacks `from_state`
/// or `to_state`.
pub fn status_transition_event_builder(row: &ScheduleRow) -> Result<OutgoingEvent, BuildError> {
    let from_state = row
        .payload_ref
        .get("from_state")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| BuildError::MissingField("from_state".to_string()))?;
    let to_state = row
        .payload_ref
        .get("to_state")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| BuildError::MissingField("to_state".to_string()))?;

    let body = serde_json::json!({
        "schedule_id": row.id.get(),
        "subject_key": row.subject_key.as_str(),
        "from_state": from_state,
        "to_state": to_state,
    });

    Ok(OutgoingEvent {
        routing_key: "game.status_transition".to_string(),
        body: serde_json::to_vec(&body).map_err(|e| BuildError::Serialization(e.to_string()))?,
        ttl: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scheduler_core::kind::ScheduleKind;
    use scheduler_core::schedule::ScheduleState;
    use scheduler_core::subject::{ScheduleId, SubjectKey};

    fn sample_row(payload_ref: serde_json::Value) -> ScheduleRow {
        let now = Utc::now();
        ScheduleRow {
            id: ScheduleId::new(42),
            table_id: "game_reminder".to_string(),
            due_at: now,
            state: ScheduleState::Claimed,
            attempt_count: 1,
            last_attempted_at: Some(now),
            subject_key: SubjectKey::new("game-1"),
            kind: ScheduleKind::new("reminder"),
            payload_ref,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reminder_builder_carries_payload_ref_through() {
        let row = sample_row(serde_json::json!({"user": "U1"}));
        let event = reminder_event_builder(&row).expect("build succeeds");
        assert_eq!(event.routing_key, "game.reminder_due");
        let body: serde_json::Value = serde_json::from_slice(&event.body).expect("valid json");
        assert_eq!(body["schedule_id"], 42);
        assert_eq!(body["subject_key"], "game-1");
        assert_eq!(body["payload_ref"]["user"], "U1");
    }

    #[test]
    fn status_transition_builder_reads_from_and_to_state() {
        let row = sample_row(serde_json::json!({
            "from_state": "scheduled",
            "to_state": "in_progress",
        }));
        let event = status_transition_event_builder(&row).expect("build succeeds");
        assert_eq!(event.routing_key, "game.status_transition");
        let body: serde_json::Value = serde_json::from_slice(&event.body).expect("valid json");
        assert_eq!(body["from_state"], "scheduled");
        assert_eq!(body["to_state"], "in_progress");
    }

    #[test]
    fn status_transition_builder_rejects_missing_from_state() {
        let row = sample_row(serde_json::json!({"to_state": "in_progress"}));
        let err = status_transition_event_builder(&row).unwrap_err();
        assert!(matches!(err, BuildError::MissingField(field) if field == "from_state"));
    }
}
