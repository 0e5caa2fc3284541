use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a held lease is refreshed, and the fixed wait after finding the
/// lock busy.
pub const DEFAULT_REACQUISITION_TIME: Duration = Duration::from_millis(100);

/// How far into the future each claim or renewal pushes the expiry.
pub const DEFAULT_TIMEOUT_TIME: Duration = Duration::from_millis(1000);

/// `timeout_time` as a multiple of `reacquisition_time` when both are derived
/// from one value.
pub const TIMEOUT_MULTIPLIER: u32 = 10;

/// Which acquisition passes a manager runs one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sequencing {
    /// Passes for the same lock name are ordered; different names proceed
    /// independently.
    #[default]
    PerName,
    /// Every pass of the manager goes through a single lane.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(rename = "reacquisition_time_ms", with = "millis")]
    pub reacquisition_time: Duration,
    #[serde(rename = "timeout_time_ms", with = "millis")]
    pub timeout_time: Duration,
    pub sequencing: Sequencing,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            reacquisition_time: DEFAULT_REACQUISITION_TIME,
            timeout_time: DEFAULT_TIMEOUT_TIME,
            sequencing: Sequencing::default(),
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `reacquisition_time` and derives `timeout_time` as ten times it.
    pub fn with_times(mut self, reacquisition_time: Duration) -> Self {
        self.set_times(reacquisition_time);
        self
    }

    pub fn with_reacquisition_time(mut self, reacquisition_time: Duration) -> Self {
        self.reacquisition_time = reacquisition_time;
        self
    }

    pub fn with_timeout_time(mut self, timeout_time: Duration) -> Self {
        self.timeout_time = timeout_time;
        self
    }

    pub fn with_sequencing(mut self, sequencing: Sequencing) -> Self {
        self.sequencing = sequencing;
        self
    }

    pub fn set_times(&mut self, reacquisition_time: Duration) {
        self.reacquisition_time = reacquisition_time;
        self.timeout_time = reacquisition_time.saturating_mul(TIMEOUT_MULTIPLIER);
    }

    /// Parses a JSON config document. Missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// A renewal must land well before the lease it refreshes runs out, and
    /// a zero refresh period would spin the renewal task.
    pub fn validate(&self) -> Result<()> {
        if self.reacquisition_time.is_zero() {
            return Err(Error::InvalidConfig(
                "reacquisition_time must be greater than zero".to_string(),
            ));
        }
        if self.timeout_time <= self.reacquisition_time {
            return Err(Error::InvalidConfig(format!(
                "timeout_time ({}ms) must exceed reacquisition_time ({}ms)",
                self.timeout_time.as_millis(),
                self.reacquisition_time.as_millis()
            )));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
