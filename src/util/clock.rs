//! Time sources.
//!
//! Components that compute schedules read time through [`Clock`] so that tests
//! can drive them with a [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current unix time in seconds.
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }

    /// Current unix time in milliseconds.
    ///
    /// Used as the ordering score of arrival-ordered sets; it stays well
    /// inside the integer range a double score represents exactly.
    fn unix_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Start the clock at a unix timestamp (seconds).
    #[must_use]
    pub fn at_unix(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Jump to `to`.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_unix(1_000);
        assert_eq!(clock.unix(), 1_000);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.unix(), 1_090);
        assert_eq!(clock.unix_millis(), 1_090_000);
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.unix() > 1_600_000_000);
    }
}
