//! Daily snapshot retention sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::PolicyStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Purge snapshots older than `retention_days`, once now and then daily.
///
/// Returns `None` when retention is disabled (`retention_days == 0`).
pub fn spawn_retention_task(
    store: Arc<dyn PolicyStore>,
    retention_days: u32,
) -> Option<tokio::task::JoinHandle<()>> {
    if retention_days == 0 {
        debug!("Snapshot retention disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = store.purge_snapshots_older_than(retention_days).await {
                warn!(error = %e, "Snapshot purge failed");
            }
        }
    }))
}
