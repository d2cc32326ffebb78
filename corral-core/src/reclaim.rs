//! background lease reclamation
use std::{sync::Arc, time::Duration};

use lease_manager::LeaseStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically deletes leases whose grace window has fully passed.
/// Persistent leases are never touched and errors only skip the pass,
/// the task itself runs until `token` is cancelled.
pub fn spawn_reclaim_task<S: LeaseStore>(
    store: Arc<S>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("lease reclamation task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match store.purge_expired(false).await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "reclaimed expired leases"),
                        Err(err) => warn!(%err, "lease reclamation pass failed"),
                    }
                }
            }
        }
    })
}
