//! Clocks used for call timeouts.

use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;

/// A source of wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).max(0) as u64
    }
}

/// A clock that only moves when told to.
/// Useful for hosts that run on simulated time and for tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);
impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }
    /// Moves the clock forward.
    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Relaxed);
    }
}
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(100);
    clock.advance(50);
    assert_eq!(clock.now_ms(), 150);
    clock.set(10);
    assert_eq!(clock.now_ms(), 10);
    assert!(SystemClock.now_ms() > 1_600_000_000_000);
}
