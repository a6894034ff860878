use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::WalStore;

/// Background task that rewrites a department's WAL once enough changes
/// have accumulated since the last compaction.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if compact_if_due(&store, threshold).await {
            info!(department = store.department(), path = %store.path().display(), "WAL compacted");
        }
    }
}

/// Compact when the append count has reached `threshold`. Returns whether it ran.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            warn!(department = store.department(), appends, "compaction failed: {e}");
            false
        }
    }
}
