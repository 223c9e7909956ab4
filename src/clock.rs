//! Process-wide clock source, injectable for tests.
//!
//! The teacher calls `chrono::Utc::now()` directly wherever it needs a
//! timestamp. Several of this crate's invariants (run sequence ordering,
//! session-expiry sweeps) need to be exercised deterministically in tests, so
//! time is threaded through a small trait instead.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed/steppable clock for deterministic tests.
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        })
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.millis
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).expect("valid test clock timestamp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::new(Utc::now());
        let first = clock.now();
        clock.advance(chrono::Duration::seconds(5));
        let second = clock.now();
        assert!(second > first);
        assert_eq!((second - first).num_seconds(), 5);
    }
}
