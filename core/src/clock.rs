//! Time abstraction for deterministic testing of time-based scheduling logic.

use chrono::{DateTime, Utc};

/// Abstracts "the current time" so the scheduler daemon's due/claim/backoff
/// logic can be driven by a fixed or controllable clock in tests instead of
/// the system clock.
///
/// # Examples
///
/// ```
/// use scheduler_core::clock::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let _now = clock.now();
/// ```
pub trait Clock: Send + Sync {
    /// The current time, UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
