//! Injectable time source.
//!
//! Every component that needs "now" takes a `&dyn Clock` instead of calling
//! `time::OffsetDateTime::now_utc()` directly, so tests can exercise
//! idle-timeout, TTL, and clock-skew boundaries deterministically.

use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock whose value is set explicitly, for tests.
pub struct FixedClock {
    unix_seconds: AtomicI64,
}

impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self {
            unix_seconds: AtomicI64::new(at.unix_timestamp()),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        self.unix_seconds.fetch_add(by.whole_seconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: OffsetDateTime) {
        self.unix_seconds.store(at.unix_timestamp(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        // unwrap: any value previously produced by `unix_timestamp()` round-trips.
        OffsetDateTime::from_unix_timestamp(self.unix_seconds.load(Ordering::SeqCst))
            .expect("stored timestamp is always in range")
    }
}
