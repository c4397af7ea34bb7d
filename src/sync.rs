//! Startup barrier: wait until every backing cache has completed its
//! initial list.
//!
//! Dispatching earlier would turn "not cached yet" into "not found" and skip
//! work that is actually needed.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::SyncCheck;
use crate::queue::deadline_after;

pub const SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Poll `checks` until all pass. Returns false if `timeout` elapses or
/// `cancel` fires first.
pub async fn wait_for_cache_sync(
    controller: &str,
    checks: &[SyncCheck],
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = deadline_after(timeout);
    let mut ticker = tokio::time::interval(SYNC_POLL_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(controller, "cancelled while waiting for caches to sync");
                return false;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(controller, timeout_ms = timeout.as_millis() as u64, "timed out waiting for caches to sync");
                return false;
            }
            _ = ticker.tick() => {
                if checks.iter().all(|synced| synced()) {
                    info!(controller, "caches synced");
                    return true;
                }
            }
        }
    }
}
