//! # Compactor
//!
//! One background task that periodically trims obsolete history. Each
//! pass compacts up to `current − retention`, leaving a window of
//! recent revisions live so restarting watchers can resume without a
//! `Compacted` round trip. The heavy lifting (the windowed delete
//! transaction and its retry loop) lives in the engine; this task is
//! just the scheduler, and it never dies on an error — a failed pass is
//! logged, recorded, and retried from scratch at the next tick.
//!
//! ## Why Keep a Retention Window?
//!
//! Compacting all the way to the current revision would be correct, but
//! every watcher that reconnects after a blip would land below the
//! watermark and eat a `Compacted` round trip. Leaving the most recent
//! revisions intact makes the common reconnect cheap; callers that want
//! an exact cut still have the explicit compact operation, which
//! ignores the window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch as shutdown_signal;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::types::Revision;

/// Spawns the periodic compaction task.
///
/// `interval` must be positive — a disabled compactor is simply not
/// spawned (the lifecycle layer decides).
pub(crate) fn spawn_compactor(
    engine: Arc<Engine>,
    interval: Duration,
    retention: i64,
    mut shutdown: shutdown_signal::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First pass only after one full interval; a freshly opened
        // store has nothing worth trimming.
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(?interval, retention, "compactor started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match compact_pass(&engine, retention).await {
                        Ok(Some(watermark)) => {
                            debug!(%watermark, "compaction pass finished");
                        }
                        Ok(None) => trace!("compaction pass had nothing to do"),
                        Err(err) => warn!(error = %err, "compaction pass failed"),
                    }
                }
            }
        }
        debug!("compactor stopped");
    })
}

/// One pass: compact up to `current − retention` if that is ahead of
/// the watermark. Returns the new watermark, or `None` when there was
/// nothing to do.
async fn compact_pass(engine: &Engine, retention: i64) -> Result<Option<Revision>> {
    let (compact, current) = engine.compact_revision().await?;
    let target = current.get() - retention;
    if target <= 0 || target <= compact.get() {
        return Ok(None);
    }
    let watermark = engine.compact(Revision::new(target)).await?;
    Ok(Some(watermark))
}
