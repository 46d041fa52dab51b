use std::net::SocketAddr;

// ── Mutations ───────────────────────────────────────────────────

/// Counter: settled or rejected mutations. Labels: kind, outcome (confirmed|rolled_back|rejected).
pub const MUTATIONS_TOTAL: &str = "tapechart_mutations_total";

/// Counter: optimistic changes undone after a backend refusal. Labels: kind.
pub const ROLLBACKS_TOTAL: &str = "tapechart_rollbacks_total";

/// Histogram: backend mutation round trip in seconds. Labels: kind.
pub const BACKEND_CALL_DURATION_SECONDS: &str = "tapechart_backend_call_duration_seconds";

/// Gauge: mutations applied locally and waiting on the backend.
pub const PENDING_MUTATIONS: &str = "tapechart_pending_mutations";

/// Gauge: entries on the undo stack.
pub const UNDO_DEPTH: &str = "tapechart_undo_depth";

// ── Sync ────────────────────────────────────────────────────────

/// Counter: poll cycles. Labels: status (ok|error).
pub const POLLS_TOTAL: &str = "tapechart_polls_total";

/// Counter: push notifications received. Labels: action.
pub const PUSH_EVENTS_TOTAL: &str = "tapechart_push_events_total";

/// Counter: failed push-triggered fetches.
pub const PUSH_FETCH_FAILURES_TOTAL: &str = "tapechart_push_fetch_failures_total";

/// Counter: remote entities merged. Labels: source, outcome.
pub const MERGES_TOTAL: &str = "tapechart_merges_total";

/// Gauge: 1 while sync is degraded.
pub const SYNC_DEGRADED: &str = "tapechart_sync_degraded";

// ── Interaction ─────────────────────────────────────────────────

/// Counter: finished gestures. Labels: kind (drag|resize|create), outcome.
pub const GESTURES_TOTAL: &str = "tapechart_gestures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
