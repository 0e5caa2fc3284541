//! Keeps a held lease alive while its critical section runs.
//!
//! Only keyX is refreshed: it is the key contenders check first, and a live
//! keyX alone turns every competing pass away.

use crate::{
    lease::{self, OwnerToken},
    storage::Storage,
    time::Clock,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{trace, warn};

const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running renewal loop.
///
/// [`RenewalTask::stop`] is the only orderly shutdown: it returns once the
/// loop has exited, so no renewal write can land after it. Dropping the
/// handle without stopping aborts the loop.
#[derive(Debug)]
pub struct RenewalTask {
    key: String,
    renewals: Arc<AtomicU64>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RenewalTask {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        key: String,
        owner: OwnerToken,
        reacquisition_time: Duration,
        timeout_time: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let renewals = Arc::new(AtomicU64::new(0));
        let period = reacquisition_time.max(MIN_RENEWAL_PERIOD);

        let task_key = key.clone();
        let task_renewals = renewals.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the claim is still fresh.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let record = lease::claim(&owner, clock.now_millis(), timeout_time);
                match lease::write_record(&*storage, &task_key, &record).await {
                    Ok(()) => {
                        task_renewals.fetch_add(1, Ordering::SeqCst);
                        trace!(key = %task_key, expires_at = record.expires_at, "Renewed lease");
                    }
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "Failed to renew lease, retrying next period");
                    }
                }
            }
        });

        Self {
            key,
            renewals,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Successful renewal writes so far.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Stops the loop and waits for it to exit. A write already in flight is
    /// allowed to finish; no new one starts.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(key = %self.key, "Renewal task panicked");
                }
            }
        }
        self.renewals()
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
