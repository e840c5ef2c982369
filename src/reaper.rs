use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Release expired holds once. Returns how many were released.
pub async fn sweep(engine: &Engine) -> usize {
    let now = engine.now();
    let mut released = 0;
    for (reservation_id, provider_id) in engine.collect_expired_reservations(now) {
        match engine.release_expired(reservation_id).await {
            Ok(true) => {
                released += 1;
                info!(reservation = %reservation_id, provider = %provider_id, "reaped expired hold");
            }
            Ok(false) => {}
            Err(e) => {
                // May already have been released
                debug!("reaper skip {reservation_id}: {e}");
            }
        }
    }
    if released > 0 {
        metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(released as u64);
    }
    released
}

/// Background task that periodically frees expired holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep(&engine).await;
    }
}

/// Background task that compacts the WAL once enough commits have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(events) => info!(appends, events, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
