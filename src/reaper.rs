use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Expire every pending booking whose start has passed. Returns how many
/// were expired on this pass.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = engine.now_ms();
    let mut expired = 0;
    for id in engine.collect_expirable_bookings(now).await {
        match engine.expire_stale_booking(id, now).await {
            Ok(true) => {
                expired += 1;
                info!("expired unconfirmed booking {id}");
            }
            // Confirmed or cancelled since it was collected.
            Ok(false) => {}
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    if expired > 0 {
        metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL).increment(expired as u64);
    }
    expired
}

/// Background task that periodically expires stale pending bookings.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
