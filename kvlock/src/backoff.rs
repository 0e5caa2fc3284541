use crate::config::LockConfig;
use rand::Rng;
use std::time::Duration;

/// Why a pass failed to acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Another owner's unexpired record was found under one of the keys.
    Busy,
    /// A competitor overwrote our tentative claim on keyX mid-pass.
    LostRace,
}

/// Wait before the next pass.
///
/// Busy waits are fixed: the holder is making progress and will either
/// release or stop renewing. Lost races wait a uniformly random fraction of
/// the period instead, because contenders that collided once are in lockstep
/// and would collide again on a fixed cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    reacquisition_time: Duration,
}

impl BackoffPolicy {
    pub fn new(reacquisition_time: Duration) -> Self {
        Self { reacquisition_time }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.reacquisition_time)
    }

    pub fn delay(&self, contention: Contention) -> Duration {
        match contention {
            Contention::Busy => self.reacquisition_time,
            Contention::LostRace => self.jittered(&mut rand::rng()),
        }
    }

    /// Uniform in `[0, reacquisition_time)`; zero when the period is zero.
    pub fn jittered<R: Rng>(&self, rng: &mut R) -> Duration {
        let nanos = u64::try_from(self.reacquisition_time.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rng.random_range(0..nanos))
    }
}
