use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Reconciler;

/// Background task: poll for changes every `poll_interval`. The first tick fires at
/// once and doubles as the initial load. A failed cycle is logged and the loop
/// carries on.
pub async fn run_poll_loop(reconciler: Arc<Reconciler>) {
    let mut interval = tokio::time::interval(reconciler.settings().poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match reconciler.poll_once().await {
            Ok(report) if !report.is_noop() => debug!(
                "poll applied {} changes, {} removals",
                report.changed.len(),
                report.removed.len()
            ),
            Ok(_) => {}
            // Already counted and logged by the reconciler.
            Err(e) => debug!("poll cycle skipped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::NaiveDate;

    use crate::backend::{BackendError, MemoryBackend};
    use crate::chart::Chart;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::sync::SyncSettings;

    #[tokio::test]
    async fn loop_survives_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let room = backend.seed_resource("101", 1);
        let chart = Chart::new(backend.clone(), Arc::new(NotifyHub::new()), 50);
        let reconciler = Arc::new(Reconciler::new(
            chart.clone(),
            SyncSettings {
                poll_interval: Duration::from_millis(10),
                fetch_timeout: Duration::from_millis(200),
                degraded_after: 3,
            },
        ));

        backend.fail_next_n(2, BackendError::Unavailable("restarting".into()));
        let task = tokio::spawn(run_poll_loop(reconciler.clone()));

        let booked = backend.seed_reservation(ReservationDraft::new(
            room.id,
            Stay::new(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            ),
            BookingDetails::default(),
        ));

        let mut loaded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if chart.reservation(&booked.id).is_some() {
                loaded = true;
                break;
            }
        }
        task.abort();
        assert!(loaded, "poll loop stopped after failures");
        assert_eq!(reconciler.consecutive_failures(), 0);
    }
}
