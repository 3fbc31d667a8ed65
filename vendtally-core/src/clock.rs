//! Wall-clock sources
//!
//! The counter never reads the system time directly; it asks a [`Clock`].
//! Hosts with an RTC or network time plug in their own implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::types::Timestamp;

/// Source of the current time in seconds since the Unix epoch
///
/// Must not visibly go backwards and must not roll over during the
/// lifetime of the device.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // Pre-epoch system time is a misconfigured device; clamp to zero
        Utc::now().timestamp().max(0) as Timestamp
    }
}

/// Manually driven clock
///
/// Clones share the same time, so a test can keep a handle and advance the
/// clock owned by a counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let handle = clock.clone();

        handle.advance(60);
        assert_eq!(clock.now(), 1_060);

        handle.set(5);
        assert_eq!(clock.now(), 5);
    }
}
