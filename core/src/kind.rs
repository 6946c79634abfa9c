//! Discriminator narrowing payload semantics within one schedule table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Narrows payload semantics within a single schedule table.
///
/// A schedule table (e.g. the reminder/notification table) can carry rows of
/// several semantic kinds — `"reminder"`, `"join_notification"` — all sharing
/// the same physical shape. `ScheduleKind` is an open string-backed
/// discriminator rather than a fixed enum so that the retry daemon can mint
/// new kinds (`"retry:reminder"`) without the schema or the Rust type
/// changing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleKind(String);

impl ScheduleKind {
    /// Create a new kind from any owned-string-convertible value.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// View the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the retry-daemon's derived kind for a message that failed and
    /// is being reintroduced through the schedule store, e.g. `"reminder"`
    /// becomes `"retry:reminder"`.
    ///
    /// Idempotent: retrying a retry keeps a single `retry:` prefix rather
    /// than stacking (`retry:retry:reminder`), since the attempt counter
    /// already tracks how many times a message has been dead-lettered.
    #[must_use]
    pub fn as_retry(&self) -> Self {
        if self.0.starts_with("retry:") {
            self.clone()
        } else {
            Self(format!("retry:{}", self.0))
        }
    }

    /// Whether this kind marks a retry-daemon-reinserted row.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.0.starts_with("retry:")
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ScheduleKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ScheduleKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_retry_prefixes_once() {
        let kind = ScheduleKind::new("reminder");
        assert_eq!(kind.as_retry().as_str(), "retry:reminder");
    }

    #[test]
    fn as_retry_does_not_double_prefix() {
        let kind = ScheduleKind::new("retry:reminder");
        assert_eq!(kind.as_retry().as_str(), "retry:reminder");
    }

    #[test]
    fn is_retry_detects_prefix() {
        assert!(ScheduleKind::new("retry:reminder").is_retry());
        assert!(!ScheduleKind::new("reminder").is_retry());
    }
}
