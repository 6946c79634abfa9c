//! Identifiers for schedule rows and the domain entities they belong to.
//!
//! This module defines strong types for the opaque identifiers threaded
//! through the scheduling subsystem: [`ScheduleId`] (the row's own primary
//! key) and [`SubjectKey`] (a foreign reference to whatever domain entity —
//! a game session, most commonly — the row pertains to).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`SubjectKey`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid subject key: {0}")]
pub struct ParseSubjectKeyError(String);

/// Opaque identifier for the domain entity a schedule row pertains to.
///
/// A subject key is never interpreted by the scheduling subsystem itself —
/// producers (the API, the bot) are responsible for its meaning and
/// uniqueness. For example: `"game-12345"`.
///
/// # Design
///
/// `SubjectKey` is a newtype wrapper around `String` so the scheduler core
/// never accidentally accepts a bare string where a subject key is required,
/// and so producer code reads as "this is a domain entity reference" rather
/// than "this is some string".
///
/// # Examples
///
/// ```
/// use scheduler_core::subject::SubjectKey;
///
/// let subject = SubjectKey::new("game-12345");
/// assert_eq!(subject.as_str(), "game-12345");
///
/// let parsed: SubjectKey = "game-67890".parse().unwrap();
/// assert_eq!(parsed, SubjectKey::new("game-67890"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey(String);

impl SubjectKey {
    /// Create a new `SubjectKey` from a string. No validation is performed;
    /// use this for application-controlled data.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the subject key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `SubjectKey` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectKey {
    type Err = ParseSubjectKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseSubjectKeyError("subject key cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for SubjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique, database-assigned identifier for a schedule row.
///
/// Backed by a `BIGSERIAL` primary key in the Postgres schema. Two rows with
/// identical `due_at` break the tie by this id (smaller wins), per the
/// ordering rule in the scheduler daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleId(i64);

impl ScheduleId {
    /// Wrap a raw row id. Intended for use by `ScheduleStore` implementations
    /// translating a database row into a [`crate::schedule::ScheduleRow`].
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw row id, for use in SQL bindings and log fields.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_key_roundtrip() {
        let key = SubjectKey::new("game-1");
        assert_eq!(key.as_str(), "game-1");
        assert_eq!(key.clone().into_inner(), "game-1".to_string());
    }

    #[test]
    fn subject_key_rejects_empty_via_from_str() {
        assert!("".parse::<SubjectKey>().is_err());
    }

    #[test]
    fn subject_key_new_allows_any_input() {
        // new() is for trusted/internal callers, not external parsing.
        let key = SubjectKey::new("");
        assert_eq!(key.as_str(), "");
    }

    #[test]
    fn schedule_id_ordering_breaks_ties() {
        let a = ScheduleId::new(1);
        let b = ScheduleId::new(2);
        assert!(a < b);
    }
}
