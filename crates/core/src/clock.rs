//! Injectable time source.
//!
//! Lease bookkeeping needs a wall-clock instant that is both serializable
//! (it is stored alongside a [`crate::session_id::SessionId`] in a
//! [`crate::config`]-adjacent record) and swappable for a deterministic one
//! in tests, so lease-expiry properties don't depend on real sleeps.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Totally ordered, serializable, and
/// cheap to compare — the unit every lease deadline is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }

    pub fn has_passed(&self, now: Timestamp) -> bool {
        now.0 >= self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A source of the current time, injectable so tests can control lease
/// expiry without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Timestamp(millis)
    }
}

/// A manually-advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::ZERO);
        assert_eq!(clock.now(), Timestamp::ZERO);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Timestamp::from_millis(5000));
    }

    #[test]
    fn has_passed() {
        let deadline = Timestamp::from_millis(1000);
        assert!(!deadline.has_passed(Timestamp::from_millis(999)));
        assert!(deadline.has_passed(Timestamp::from_millis(1000)));
        assert!(deadline.has_passed(Timestamp::from_millis(1001)));
    }
}
