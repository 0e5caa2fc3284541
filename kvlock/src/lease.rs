use crate::{
    storage::Storage,
    time::{self, EpochMillis},
    Result,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const KEY_X_SUFFIX: &str = "__MUTEX_x";
pub const KEY_Y_SUFFIX: &str = "__MUTEX_y";

/// Identifies one acquisition attempt. Generated once per attempt and reused
/// by every retry of that attempt, so a pass never mistakes its own earlier
/// tentative writes for a competitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for OwnerToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ownership claim as stored under one of a lock's two keys.
///
/// Serialized as `{"id": "<owner>", "time": <expiry in epoch millis>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    #[serde(rename = "id")]
    pub owner: OwnerToken,
    #[serde(rename = "time")]
    pub expires_at: EpochMillis,
}

impl LeaseRecord {
    pub fn new(owner: OwnerToken, expires_at: EpochMillis) -> Self {
        Self { owner, expires_at }
    }

    pub fn is_owned_by(&self, owner: &OwnerToken) -> bool {
        self.owner == *owner
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.expires_at <= now
    }

    /// Whether this record keeps `observer` out: held by someone else and
    /// still strictly in the future.
    pub fn blocks(&self, observer: &OwnerToken, now: EpochMillis) -> bool {
        !self.is_owned_by(observer) && !self.is_expired(now)
    }

    pub fn time_remaining(&self, now: EpochMillis) -> Duration {
        if self.is_expired(now) {
            Duration::ZERO
        } else {
            Duration::from_millis(self.expires_at.saturating_sub(now).unsigned_abs())
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// The two store keys backing one logical lock name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKeys {
    pub x: String,
    pub y: String,
}

impl LockKeys {
    pub fn for_name(name: &str) -> Self {
        Self {
            x: format!("{name}{KEY_X_SUFFIX}"),
            y: format!("{name}{KEY_Y_SUFFIX}"),
        }
    }
}

/// Reads the record under `key`.
///
/// A value that does not decode cannot be anyone's live claim, so it is
/// reported as absent and left for the next write to replace.
pub async fn read_record(storage: &dyn Storage, key: &str) -> Result<Option<LeaseRecord>> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    match LeaseRecord::decode(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(key, error = %e, "Ignoring undecodable lease record");
            Ok(None)
        }
    }
}

pub async fn write_record(storage: &dyn Storage, key: &str, record: &LeaseRecord) -> Result<()> {
    storage.set(key, record.encode()?).await
}

/// Builds a record for `owner` expiring `timeout` from `now`.
pub fn claim(owner: &OwnerToken, now: EpochMillis, timeout: Duration) -> LeaseRecord {
    LeaseRecord::new(owner.clone(), time::expiry_after(now, timeout))
}
