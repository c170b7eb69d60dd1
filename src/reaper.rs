use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// One housekeeping pass: close out classes that have ended and retry
/// refunds the payment service did not confirm.
pub async fn sweep(engine: &Engine) -> (usize, usize) {
    let completed = engine.complete_elapsed().await;
    let refunded = engine.retry_pending_refunds().await;
    if completed > 0 || refunded > 0 {
        info!(completed, refunded, "reaper pass");
    } else {
        tracing::debug!("reaper pass: nothing to do");
    }
    (completed, refunded)
}

/// Background task that runs [`sweep`] on a fixed interval.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep(&engine).await;
    }
}
