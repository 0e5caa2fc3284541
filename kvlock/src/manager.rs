//! Public entry point: run a critical section while holding a named lock.
//!
//! ```ignore
//! let manager = LockManager::new(Arc::new(InMemoryStorage::new()));
//! let total = manager
//!     .acquire("ledger", || async { Ok::<_, kvlock::Error>(recount().await) })
//!     .await?;
//! ```

use crate::{
    backoff::BackoffPolicy,
    config::LockConfig,
    lease::{read_record, LockKeys, OwnerToken},
    protocol::{run_pass, PassOutcome},
    release::release,
    renewal::RenewalTask,
    sequencer::Sequencer,
    storage::Storage,
    time::{Clock, EpochMillis, SystemClock},
    Error, Result,
};
use futures::FutureExt;
use parking_lot::RwLock;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

/// What the two keys of a lock say right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    /// An unexpired record exists. Tentative claims left by failed passes
    /// count too, since they turn other contenders away just the same.
    Held {
        owner: OwnerToken,
        expires_at: EpochMillis,
    },
}

impl LockStatus {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

#[derive(Debug)]
pub struct LockManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: RwLock<LockConfig>,
    sequencer: Sequencer,
}

impl LockManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, LockConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Storage>, config: LockConfig) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock::new()),
            sequencer: Sequencer::new(config.sequencing),
            config: RwLock::new(config),
        }
    }

    /// Replaces the wall clock used to stamp and judge expiries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> LockConfig {
        self.config.read().clone()
    }

    pub fn set_reacquisition_time(&self, reacquisition_time: Duration) {
        self.config.write().reacquisition_time = reacquisition_time;
    }

    pub fn set_timeout_time(&self, timeout_time: Duration) {
        self.config.write().timeout_time = timeout_time;
    }

    /// Sets the reacquisition time and a timeout ten times as long.
    pub fn set_times(&self, reacquisition_time: Duration) {
        self.config.write().set_times(reacquisition_time);
    }

    /// Waits as long as it takes to obtain `name`, then runs
    /// `critical_section` and releases the lock.
    ///
    /// Returns exactly what the critical section returns. Its error comes
    /// back unchanged, after the lock has been released. Store failures while
    /// acquiring abort the wait and surface as `E::from(Error)`.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn acquire<F, Fut, T, E>(&self, name: &str, critical_section: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let keys = LockKeys::for_name(name);
        let owner = OwnerToken::generate();
        self.obtain_blocking(name, &keys, &owner, None).await?;
        self.run_held(name, keys, owner, critical_section).await
    }

    /// Like [`LockManager::acquire`], but gives up with [`Error::Timeout`]
    /// once `max_wait` has passed without obtaining the lock. The deadline
    /// only bounds the wait; a critical section that has started runs to
    /// completion.
    #[instrument(skip_all, fields(name = %name, max_wait_ms = max_wait.as_millis() as u64))]
    pub async fn acquire_timeout<F, Fut, T, E>(
        &self,
        name: &str,
        max_wait: Duration,
        critical_section: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let keys = LockKeys::for_name(name);
        let owner = OwnerToken::generate();
        let deadline = Instant::now() + max_wait;
        self.obtain_blocking(name, &keys, &owner, Some(deadline)).await?;
        self.run_held(name, keys, owner, critical_section).await
    }

    /// One attempt. If the lock is not obtained, waits once as the backoff
    /// policy dictates and returns `Ok(None)` without running the critical
    /// section. `Some` carries the critical section's value and means it ran.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn try_acquire<F, Fut, T, E>(&self, name: &str, critical_section: F) -> std::result::Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.attempt_lock(name, false, critical_section).await
    }

    /// Shared implementation of [`LockManager::acquire`] (`blocking`) and
    /// [`LockManager::try_acquire`].
    pub async fn attempt_lock<F, Fut, T, E>(
        &self,
        name: &str,
        blocking: bool,
        critical_section: F,
    ) -> std::result::Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let keys = LockKeys::for_name(name);
        let owner = OwnerToken::generate();
        if blocking {
            self.obtain_blocking(name, &keys, &owner, None).await?;
        } else if !self.obtain_once(name, &keys, &owner).await? {
            return Ok(None);
        }
        self.run_held(name, keys, owner, critical_section).await.map(Some)
    }

    /// Reads the lock's keys without taking part in the protocol.
    pub async fn inspect(&self, name: &str) -> Result<LockStatus> {
        let keys = LockKeys::for_name(name);
        let now = self.clock.now_millis();
        for key in [&keys.x, &keys.y] {
            if let Some(record) = read_record(&*self.storage, key).await? {
                if !record.is_expired(now) {
                    return Ok(LockStatus::Held {
                        owner: record.owner,
                        expires_at: record.expires_at,
                    });
                }
            }
        }
        Ok(LockStatus::Free)
    }

    async fn pass(&self, name: &str, keys: &LockKeys, owner: &OwnerToken) -> Result<PassOutcome> {
        let timeout_time = self.config.read().timeout_time;
        self.sequencer
            .run(
                name,
                run_pass(&*self.storage, &*self.clock, keys, owner, timeout_time),
            )
            .await
    }

    async fn obtain_once(&self, name: &str, keys: &LockKeys, owner: &OwnerToken) -> Result<bool> {
        let outcome = self.pass(name, keys, owner).await?;
        let Some(contention) = outcome.contention() else {
            return Ok(true);
        };
        let wait = BackoffPolicy::from_config(&self.config()).delay(contention);
        debug!(?outcome, wait_ms = wait.as_millis() as u64, "Lock not acquired, giving up after backoff");
        sleep(wait).await;
        Ok(false)
    }

    async fn obtain_blocking(
        &self,
        name: &str,
        keys: &LockKeys,
        owner: &OwnerToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let outcome = self.pass(name, keys, owner).await?;
            let Some(contention) = outcome.contention() else {
                return Ok(());
            };

            let mut wait = BackoffPolicy::from_config(&self.config()).delay(contention);
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout {
                        name: name.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                wait = wait.min(remaining);
            }
            debug!(?outcome, wait_ms = wait.as_millis() as u64, "Lock not acquired, backing off");
            sleep(wait).await;
        }
    }

    async fn run_held<F, Fut, T, E>(
        &self,
        name: &str,
        keys: LockKeys,
        owner: OwnerToken,
        critical_section: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let config = self.config();
        let renewal = RenewalTask::spawn(
            self.storage.clone(),
            self.clock.clone(),
            keys.x.clone(),
            owner,
            config.reacquisition_time,
            config.timeout_time,
        );
        debug!(name, "Lock acquired");

        let outcome = AssertUnwindSafe(async move { critical_section().await })
            .catch_unwind()
            .await;
        let released = release(&*self.storage, &keys, renewal).await;

        match outcome {
            Ok(Ok(value)) => {
                released?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(release_err) = released {
                    warn!(name, error = %release_err, "Release failed after critical section error");
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(release_err) = released {
                    warn!(name, error = %release_err, "Release failed after critical section panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}
