use chrono::Utc;
use std::time::Duration;

/// Milliseconds since the Unix epoch, the unit lease expiries are stored in.
pub type EpochMillis = i64;

/// Source of wall-clock time used to stamp and judge lease expiries.
///
/// Every coordinating instance compares the expiries written by others
/// against its own clock, so instances are assumed to be roughly in sync.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> EpochMillis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> EpochMillis {
        Utc::now().timestamp_millis()
    }
}

/// `now + duration`, saturating instead of overflowing on absurd timeouts.
pub fn expiry_after(now: EpochMillis, duration: Duration) -> EpochMillis {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    now.saturating_add(millis)
}
