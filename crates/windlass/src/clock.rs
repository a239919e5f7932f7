//! Pluggable time sources
//!
//! Workflow code never reads the host clock. Everything that needs a
//! timestamp (event creation, visibility checks, lease expiry) goes through a
//! [`Clock`] so tests can substitute a controlled [`MockClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync + 'static {
    /// The current instant according to this clock
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the host wall clock.
///
/// The wall clock is read once per event at creation time; nothing in the
/// engine observes it continuously.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A user-controlled monotonic clock for tests.
///
/// Time only moves when the test moves it. [`MockClock::advance`] and
/// [`MockClock::set`] refuse to travel backwards.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    /// Create a mock clock frozen at the given start time
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by a duration
    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock();
        *now += ChronoDuration::from_std(by).expect("duration out of range");
    }

    /// Move the clock to an absolute instant, never backwards
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock();
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mock_clock_advance() {
        let start = Utc::now();
        let clock = MockClock::new(start);

        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), start + ChronoDuration::seconds(30));
    }

    #[test]
    fn test_mock_clock_never_goes_backwards() {
        let start = Utc::now();
        let clock = MockClock::new(start);

        clock.advance(Duration::from_secs(60));
        clock.set(start);

        assert_eq!(clock.now(), start + ChronoDuration::seconds(60));
    }

    #[test]
    fn test_wall_clock_moves() {
        let clock = WallClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
