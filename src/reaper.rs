use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Ms;

/// Deletes TENTATIVE rows whose hold lapsed more than `retention` ago.
/// Purely housekeeping: lapsed holds are already ignored everywhere.
pub async fn run_reaper(engine: Arc<Engine>, retention: Ms) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        reap_once(&engine, retention).await;
    }
}

/// One sweep. Returns how many rows were deleted.
pub async fn reap_once(engine: &Engine, retention: Ms) -> usize {
    let now = engine.now();
    let mut reaped = 0;
    for id in engine.collect_expired_holds(now, retention) {
        match engine.purge_expired_hold(id).await {
            Ok(true) => {
                info!("reaped expired hold {id}");
                reaped += 1;
            }
            Ok(false) => debug!("reaper skip {id}: no longer an expired hold"),
            Err(e) => warn!("reaper failed on {id}: {e}"),
        }
    }
    if reaped > 0 {
        metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(reaped as u64);
    }
    reaped
}

/// Rewrites the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
