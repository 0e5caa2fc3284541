//! One pass of the two-key acquisition algorithm.
//!
//! The store offers no compare-and-swap, so a single key cannot be claimed
//! atomically. Instead a contender claims keyX, then keyY, then re-reads
//! keyX: whoever wrote keyX last wins, and everyone else notices their claim
//! on keyX was overwritten and backs off. The protocol can only detect a
//! clobbered keyX after the fact, never prevent it.
//!
//! A pass never waits. Retrying is the caller's job.

use crate::{
    backoff::Contention,
    lease::{self, LockKeys, OwnerToken},
    storage::Storage,
    time::Clock,
    Result,
};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Both keys carry our token and keyX was not overwritten mid-pass.
    Acquired,
    /// `key` holds an unexpired record belonging to `holder`.
    Busy { key: String, holder: OwnerToken },
    /// Our tentative claim on keyX was replaced before the pass finished.
    LostRace,
}

impl PassOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }

    pub fn contention(&self) -> Option<Contention> {
        match self {
            Self::Acquired => None,
            Self::Busy { .. } => Some(Contention::Busy),
            Self::LostRace => Some(Contention::LostRace),
        }
    }
}

pub async fn run_pass(
    storage: &dyn Storage,
    clock: &dyn Clock,
    keys: &LockKeys,
    owner: &OwnerToken,
    timeout_time: Duration,
) -> Result<PassOutcome> {
    let claim = lease::claim(owner, clock.now_millis(), timeout_time);

    if let Some(busy) = check_free(storage, clock, &keys.x, owner).await? {
        return Ok(busy);
    }
    lease::write_record(storage, &keys.x, &claim).await?;
    trace!(key = %keys.x, expires_at = claim.expires_at, "Claimed keyX");

    // Our keyX claim stays behind if keyY is taken. It is harmless: a later
    // pass of this attempt recognises it, and anyone else overwrites it.
    if let Some(busy) = check_free(storage, clock, &keys.y, owner).await? {
        return Ok(busy);
    }
    lease::write_record(storage, &keys.y, &claim).await?;
    trace!(key = %keys.y, "Claimed keyY");

    match lease::read_record(storage, &keys.x).await? {
        Some(current) if current.is_owned_by(owner) => Ok(PassOutcome::Acquired),
        current => {
            trace!(
                key = %keys.x,
                winner = current.as_ref().map(|r| r.owner.as_str()),
                "keyX changed hands during the pass"
            );
            Ok(PassOutcome::LostRace)
        }
    }
}

async fn check_free(
    storage: &dyn Storage,
    clock: &dyn Clock,
    key: &str,
    owner: &OwnerToken,
) -> Result<Option<PassOutcome>> {
    let Some(record) = lease::read_record(storage, key).await? else {
        return Ok(None);
    };
    if record.blocks(owner, clock.now_millis()) {
        return Ok(Some(PassOutcome::Busy {
            key: key.to_string(),
            holder: record.owner,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lease::{read_record, write_record, LeaseRecord},
        storage::InMemoryStorage,
        test_utils::ManualClock,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn setup() -> (InMemoryStorage, ManualClock, LockKeys, OwnerToken) {
        (
            InMemoryStorage::new(),
            ManualClock::new(10_000),
            LockKeys::for_name("r"),
            OwnerToken::generate(),
        )
    }

    #[tokio::test]
    async fn test_free_name_is_acquired() {
        let (storage, clock, keys, owner) = setup();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert_eq!(outcome, PassOutcome::Acquired);

        for key in [&keys.x, &keys.y] {
            let record = read_record(&storage, key).await.unwrap().unwrap();
            assert_eq!(record.owner, owner);
            assert_eq!(record.expires_at, 11_000);
        }
    }

    #[tokio::test]
    async fn test_live_x_is_busy_and_untouched() {
        let (storage, clock, keys, owner) = setup();
        let holder = LeaseRecord::new(OwnerToken::from("holder"), 10_500);
        write_record(&storage, &keys.x, &holder).await.unwrap();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Busy {
                key: keys.x.clone(),
                holder: OwnerToken::from("holder")
            }
        );
        assert_eq!(outcome.contention(), Some(Contention::Busy));
        assert_eq!(read_record(&storage, &keys.x).await.unwrap(), Some(holder));
        assert!(read_record(&storage, &keys.y).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_y_is_busy_after_tentative_x() {
        let (storage, clock, keys, owner) = setup();
        let holder = LeaseRecord::new(OwnerToken::from("holder"), 10_500);
        write_record(&storage, &keys.y, &holder).await.unwrap();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Busy { ref key, .. } if *key == keys.y));

        let tentative = read_record(&storage, &keys.x).await.unwrap().unwrap();
        assert!(tentative.is_owned_by(&owner));
    }

    #[tokio::test]
    async fn test_own_stale_writes_do_not_block() {
        let (storage, clock, keys, owner) = setup();
        let mine = LeaseRecord::new(owner.clone(), 99_999);
        write_record(&storage, &keys.x, &mine).await.unwrap();
        write_record(&storage, &keys.y, &mine).await.unwrap();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert!(outcome.is_acquired());
    }

    #[tokio::test]
    async fn test_expired_foreign_records_are_free() {
        let (storage, clock, keys, owner) = setup();
        let stale = LeaseRecord::new(OwnerToken::from("stale"), 0);
        write_record(&storage, &keys.x, &stale).await.unwrap();
        write_record(&storage, &keys.y, &stale).await.unwrap();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert!(outcome.is_acquired());
    }

    #[tokio::test]
    async fn test_record_expiring_now_is_free() {
        let (storage, clock, keys, owner) = setup();
        let boundary = LeaseRecord::new(OwnerToken::from("holder"), 10_000);
        write_record(&storage, &keys.x, &boundary).await.unwrap();

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert!(outcome.is_acquired());
    }

    /// Lets a competitor overwrite keyX right after we claim keyY.
    #[derive(Debug)]
    struct ClobberAfterY {
        inner: InMemoryStorage,
        x_key: String,
        y_key: String,
        competitor: Option<LeaseRecord>,
    }

    #[async_trait]
    impl Storage for ClobberAfterY {
        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Bytes) -> Result<()> {
            self.inner.set(key, value).await?;
            if key == self.y_key {
                match &self.competitor {
                    Some(record) => write_record(&self.inner, &self.x_key, record).await?,
                    None => self.inner.delete(&self.x_key).await?,
                }
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_overwritten_x_is_lost_race() {
        let (_, clock, keys, owner) = setup();
        let storage = ClobberAfterY {
            inner: InMemoryStorage::new(),
            x_key: keys.x.clone(),
            y_key: keys.y.clone(),
            competitor: Some(LeaseRecord::new(OwnerToken::from("rival"), 11_000)),
        };

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert_eq!(outcome, PassOutcome::LostRace);
        assert_eq!(outcome.contention(), Some(Contention::LostRace));
    }

    #[tokio::test]
    async fn test_vanished_x_is_lost_race() {
        let (_, clock, keys, owner) = setup();
        let storage = ClobberAfterY {
            inner: InMemoryStorage::new(),
            x_key: keys.x.clone(),
            y_key: keys.y.clone(),
            competitor: None,
        };

        let outcome = run_pass(&storage, &clock, &keys, &owner, TIMEOUT).await.unwrap();
        assert_eq!(outcome, PassOutcome::LostRace);
    }

    #[tokio::test]
    async fn test_second_contender_sees_busy() {
        let (storage, clock, keys, first) = setup();
        let second = OwnerToken::generate();

        assert!(run_pass(&storage, &clock, &keys, &first, TIMEOUT).await.unwrap().is_acquired());
        let outcome = run_pass(&storage, &clock, &keys, &second, TIMEOUT).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Busy { ref holder, .. } if *holder == first));

        clock.advance(Duration::from_millis(1001));
        assert!(run_pass(&storage, &clock, &keys, &second, TIMEOUT).await.unwrap().is_acquired());
    }
}
