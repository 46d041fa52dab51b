use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::Reconciler;

/// Background task: apply push notifications as they arrive. If the feed closes,
/// wait one poll interval, subscribe again and poll once to cover the gap.
pub async fn run_push_listener(reconciler: Arc<Reconciler>) {
    let mut reconnecting = false;
    loop {
        let mut feed = reconciler.chart().backend().subscribe();
        if reconnecting {
            info!("push feed re-subscribed");
            if let Err(e) = reconciler.poll_once().await {
                debug!("catch-up poll failed: {e}");
            }
        }

        while let Some(signal) = feed.next().await {
            if let Err(e) = reconciler.handle_signal(signal).await {
                // Counted and logged by the reconciler; the listener stays up.
                debug!("push signal skipped: {e}");
            }
        }

        let pause = reconciler.settings().poll_interval;
        warn!("push feed closed, re-subscribing in {pause:?}");
        tokio::time::sleep(pause).await;
        reconnecting = true;
    }
}
