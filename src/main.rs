use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate};
use tracing::info;

use tapechart::backend::MemoryBackend;
use tapechart::chart::Chart;
use tapechart::config::ChartConfig;
use tapechart::gesture::{GestureController, GestureOutcome};
use tapechart::grid::{Pointer, TimelineGrid};
use tapechart::model::*;
use tapechart::notify::{ChartEvent, NotifyHub};
use tapechart::sync::{self, Reconciler, SyncSettings};

const DEMO_DAYS: u32 = 31;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ChartConfig::from_env();
    tapechart::observability::init(config.metrics_port)?;

    info!("tapechart demo session");
    info!("  poll_interval: {:?}", config.poll_interval);
    info!("  fetch_timeout: {:?}", config.fetch_timeout);
    info!("  max_undo: {}", config.max_undo);
    info!("  density: {}", config.density.label());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let today = Local::now().date_naive();
    let backend = Arc::new(MemoryBackend::new());
    let rooms: Vec<Resource> = ["101", "102", "201"]
        .iter()
        .zip(1..)
        .map(|(name, position)| backend.seed_resource(name, position))
        .collect();
    let guest = |name: &str, reference: &str| BookingDetails {
        reference: reference.to_string(),
        guest_name: name.to_string(),
        guests: 2,
        ..BookingDetails::default()
    };
    let day = |offset: u64| today.checked_add_days(Days::new(offset)).unwrap_or(NaiveDate::MAX);
    let moving = backend.seed_reservation(ReservationDraft::new(
        rooms[0].id,
        Stay::new(day(2), day(5)),
        guest("Meyer", "R-1001"),
    ));
    backend.seed_reservation(ReservationDraft::new(
        rooms[1].id,
        Stay::new(day(3), day(8)),
        guest("Okafor", "R-1002"),
    ));

    let notify = Arc::new(NotifyHub::new());
    let chart = Chart::new(backend.clone(), notify.clone(), config.max_undo);
    let reconciler = Arc::new(Reconciler::new(chart.clone(), SyncSettings::from(&config)));

    // Initial load before handing the chart to the loops.
    let loaded = reconciler.poll_once().await?;
    info!("loaded {} entities", loaded.changed.len());

    let poller = tokio::spawn(sync::run_poll_loop(reconciler.clone()));
    let listener = tokio::spawn(sync::run_push_listener(reconciler.clone()));

    let mut events = notify.subscribe_all();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChartEvent::MutationConfirmed { reservation_id, kind, version } => {
                    info!("confirmed {kind} of {reservation_id} ({version})")
                }
                ChartEvent::MutationRolledBack { reservation_id, kind, reason } => {
                    tracing::warn!("rolled back {kind} of {reservation_id}: {reason}")
                }
                other => tracing::debug!("{other:?}"),
            }
        }
    });

    // Drag the first booking two rows down and three days later.
    let grid = TimelineGrid::from_store(today, DEMO_DAYS, config.density, &chart.snapshot());
    let cell = grid.cell_width();
    let row = grid.row_height();
    let mut gestures = GestureController::new(chart.clone(), grid);
    let start = Pointer::new(cell * 3.5, row * 0.5);
    gestures.pointer_down_on_bar(moving.id, start)?;
    gestures.pointer_move(Pointer::new(start.x + cell, start.y + row))?;
    match gestures.pointer_up(Pointer::new(start.x + cell * 3.0, start.y + row * 2.0)).await {
        Ok(GestureOutcome::Moved(r)) => info!("moved {} to {}", r.details.reference, r.stay),
        Ok(other) => info!("gesture ended without change: {other:?}"),
        Err(e) => tracing::warn!("gesture failed: {e}"),
    }
    info!("undo available: {}", chart.can_undo());

    // Graceful shutdown on SIGTERM/ctrl-c
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    info!("session running; ctrl-c to stop");
    shutdown.await;

    info!("shutdown signal received, stopping sync");
    poller.abort();
    listener.abort();
    // Give any in-flight settlement a moment to land.
    let drain = Duration::from_millis(200);
    let _ = tokio::time::timeout(drain, async {
        while chart.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    logger.abort();
    info!("tapechart stopped");
    Ok(())
}
