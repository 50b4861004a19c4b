use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::RefundStatus;

/// Refunds dispatched to the gateway at once.
const DISPATCH_CONCURRENCY: usize = 8;

/// Periodically re-issue refunds lost to a crash between cancellation
/// and refund creation.
pub async fn run_refund_recovery(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.recover_missing_refunds().await {
            Ok(ids) if !ids.is_empty() => info!("recovered {} missing refunds", ids.len()),
            Ok(_) => {}
            Err(e) => warn!("refund recovery failed: {e}"),
        }
    }
}

/// Send every PENDING refund to the gateway. Returns how many were accepted.
pub async fn dispatch_pending_refunds(engine: &Arc<Engine>) -> usize {
    let pending = engine.refunds_by_status(RefundStatus::Pending);
    let dispatched = futures::stream::iter(pending)
        .map(|refund| {
            let engine = engine.clone();
            async move {
                match engine.dispatch_refund(refund.id).await {
                    Ok(_) => true,
                    // Already moved on by a concurrent dispatcher
                    Err(EngineError::InvalidState { .. }) => false,
                    Err(e) => {
                        debug!("dispatch skip {}: {e}", refund.id);
                        false
                    }
                }
            }
        })
        .buffer_unordered(DISPATCH_CONCURRENCY)
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await;
    dispatched
}

/// Compact the WAL once enough appends have accumulated.
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
