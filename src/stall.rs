//! Stall supervisor loop.
//!
//! Each worker runs this loop alongside its fetch loop: every
//! `stall_interval` it re-enqueues the jobs whose worker missed the window
//! and snapshots the active list into a fresh stalling set.

use std::sync::Arc;

use crate::queue::Inner;

pub(crate) async fn run(core: Arc<Inner>) {
    tracing::debug!(queue = core.keys.name(), "Stall supervisor started");

    let mut interval = tokio::time::interval(core.settings.stall_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !core.is_closed() {
        interval.tick().await;
        if core.is_closed() {
            break;
        }
        match core.check_stalled().await {
            Ok(0) => {}
            Ok(recovered) => {
                tracing::info!(
                    queue = core.keys.name(),
                    recovered,
                    "Re-enqueued stalled jobs"
                );
            }
            Err(e) => core.emit_error("stall check", e.to_string()),
        }
    }

    tracing::debug!("Stall supervisor stopped");
}
