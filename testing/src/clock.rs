//! Controllable clocks for deterministic time-based tests.

use chrono::{DateTime, Utc};
use scheduler_core::clock::Clock;
use std::sync::Mutex;

/// A clock fixed at construction time and never advanced.
///
/// Useful when a test only needs a stable `now()` and does not exercise
/// due-time arithmetic across an interval.
#[derive(Debug)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Build a clock fixed at `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A fixed, well-known instant for tests that don't care which instant, only
/// that it's stable.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        "2025-01-01T00:00:00Z"
            .parse()
            .expect("hardcoded timestamp is valid"),
    )
}

/// A clock whose `now()` can be advanced under test control.
///
/// Pair this with `tokio::time::pause()` and `tokio::time::advance()`: call
/// [`ControllableClock::advance`] with the same duration passed to
/// `tokio::time::advance` so the daemon's notion of "now" and tokio's
/// notion of elapsed real time stay in lockstep. Without this, a daemon
/// computing `sleep_until(due_at - clock.now())` against a clock that never
/// moves would sleep forever even while tokio's paused clock advances.
#[derive(Debug)]
pub struct ControllableClock {
    time: Mutex<DateTime<Utc>>,
}

impl ControllableClock {
    /// Build a clock starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: chrono::Duration) {
        let mut time = self.time.lock().expect("clock mutex poisoned");
        *time += delta;
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.lock().expect("clock mutex poisoned") = time;
    }
}

impl Clock for ControllableClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn controllable_clock_advances() {
        let start: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let clock = ControllableClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
