//! Background sweep of expired pending requests and replay records.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use super::store::{AssertionReplayCache, PendingRequestStore};

/// Default sweep interval in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Spawn a background task that periodically drops expired entries.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_sweep_task(
    pending: Arc<PendingRequestStore>,
    replay: Arc<AssertionReplayCache>,
    sweep_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_interval_secs));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let now = Utc::now();
            let requests = pending.evict_expired(now);
            let assertions = replay.evict_expired(now);

            if requests > 0 || assertions > 0 {
                info!(
                    requests = requests,
                    assertions = assertions,
                    "Expired SAML state evicted"
                );
            } else {
                debug!(
                    pending_requests = pending.len(),
                    replay_records = replay.len(),
                    "SAML state sweep: nothing expired"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::RequestKind;

    #[tokio::test]
    async fn test_sweep_task_evicts() {
        let pending = Arc::new(PendingRequestStore::new());
        let replay = Arc::new(AssertionReplayCache::new());
        let now = Utc::now();

        pending.insert("_short".to_string(), RequestKind::Authn, now, Duration::from_millis(10)).unwrap();
        pending.insert("_long".to_string(), RequestKind::Authn, now, Duration::from_secs(3600)).unwrap();
        replay.record("_gone", now, now - chrono::Duration::seconds(1));

        let handle = spawn_sweep_task(Arc::clone(&pending), Arc::clone(&replay), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.abort();

        assert_eq!(pending.len(), 1);
        assert!(replay.is_empty());
    }
}
