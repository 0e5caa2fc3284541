use crate::{lease::LockKeys, renewal::RenewalTask, storage::Storage, Result};
use tracing::{debug, warn};

/// Tears down a held lock: renewal first, then keyY, then keyX.
///
/// Renewal is fully stopped before anything is deleted so a late renewal
/// cannot resurrect keyX. Keys go in reverse claim order, keeping the window
/// where keyX is gone but our keyY is still around as short as possible.
/// Both deletes are attempted; the first failure is returned.
pub async fn release(storage: &dyn Storage, keys: &LockKeys, renewal: RenewalTask) -> Result<()> {
    let renewals = renewal.stop().await;

    let deleted_y = storage.delete(&keys.y).await;
    if let Err(e) = &deleted_y {
        warn!(key = %keys.y, error = %e, "Failed to delete lease record");
    }
    let deleted_x = storage.delete(&keys.x).await;
    if let Err(e) = &deleted_x {
        warn!(key = %keys.x, error = %e, "Failed to delete lease record");
    }

    debug!(key = %keys.x, renewals, "Released lock");
    deleted_y.and(deleted_x)
}
