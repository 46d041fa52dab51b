//! Keeps the chart in step with the backend through two channels: a periodic
//! "changes since cursor" poll and a push feed of change notifications. Both feed
//! the same version-ordered merge, so neither channel outranks the other.

pub mod merge;
mod poll;
mod push;

pub use merge::{MergeOutcome, ReconcileReport, merge_entity, remove_entity};
pub use poll::run_poll_loop;
pub use push::run_push_listener;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, PushSignal};
use crate::chart::Chart;
use crate::config::ChartConfig;
use crate::model::*;
use crate::notify::{ChangeSource, ChartEvent};
use crate::observability;

/// A poll or push fetch that did not complete. Absorbed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Timeout(Duration),
    Backend(BackendError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Timeout(after) => write!(f, "sync request timed out after {after:?}"),
            SyncError::Backend(e) => write!(f, "sync request failed: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Backend(e) => Some(e),
            SyncError::Timeout(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub degraded_after: u32,
}

impl From<&ChartConfig> for SyncSettings {
    fn from(config: &ChartConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            fetch_timeout: config.fetch_timeout,
            degraded_after: config.degraded_after,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&ChartConfig::default())
    }
}

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    degraded: bool,
}

pub struct Reconciler {
    chart: Chart,
    settings: SyncSettings,
    /// Held for a whole poll, so polls never overlap.
    cursor: tokio::sync::Mutex<SyncCursor>,
    health: Mutex<Health>,
}

impl Reconciler {
    pub fn new(chart: Chart, settings: SyncSettings) -> Self {
        Self {
            chart,
            settings,
            cursor: tokio::sync::Mutex::new(SyncCursor::ORIGIN),
            health: Mutex::new(Health::default()),
        }
    }

    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings
    }

    pub async fn cursor(&self) -> SyncCursor {
        *self.cursor.lock().await
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health().consecutive_failures
    }

    pub fn is_degraded(&self) -> bool {
        self.health().degraded
    }

    fn health(&self) -> std::sync::MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One poll cycle. The cursor moves only when the backend answered, even with
    /// nothing new.
    pub async fn poll_once(&self) -> Result<ReconcileReport, SyncError> {
        let mut cursor = self.cursor.lock().await;
        let backend = self.chart.backend().clone();
        let answer = match timeout(self.settings.fetch_timeout, backend.changes_since(*cursor)).await {
            Err(_) => Err(SyncError::Timeout(self.settings.fetch_timeout)),
            Ok(result) => result.map_err(SyncError::Backend),
        };

        let changes = match answer {
            Ok(changes) => changes,
            Err(e) => {
                metrics::counter!(observability::POLLS_TOTAL, "status" => "error").increment(1);
                self.record_failure("poll", &e);
                return Err(e);
            }
        };
        metrics::counter!(observability::POLLS_TOTAL, "status" => "ok").increment(1);

        let ChangeSet {
            entities,
            removed,
            cursor: next,
        } = changes;
        let report = self.chart.apply_remote(entities, removed, ChangeSource::Poll);
        debug!("poll {} -> {}", cursor.0, next.0);
        *cursor = next;
        drop(cursor);
        self.record_success();
        Ok(report)
    }

    /// Apply one push notification. Deletes need no round trip; inserts and updates
    /// fetch the entity and go through the merge rule.
    pub async fn handle_push(&self, event: PushEvent) -> Result<ReconcileReport, SyncError> {
        let action = match event.action {
            PushAction::Insert => "insert",
            PushAction::Update => "update",
            PushAction::Delete => "delete",
        };
        metrics::counter!(observability::PUSH_EVENTS_TOTAL, "action" => action).increment(1);
        let key = event.key();

        if event.action == PushAction::Delete {
            return Ok(self.chart.apply_remote(Vec::new(), vec![key], ChangeSource::Push));
        }

        let backend = self.chart.backend().clone();
        let fetched = match timeout(self.settings.fetch_timeout, backend.fetch(event.kind, event.id)).await {
            Err(_) => Err(SyncError::Timeout(self.settings.fetch_timeout)),
            Ok(result) => result.map_err(SyncError::Backend),
        };
        let report = match fetched {
            Ok(Some(entity)) => self.chart.apply_remote(vec![entity], Vec::new(), ChangeSource::Push),
            // Gone by the time we asked.
            Ok(None) => self.chart.apply_remote(Vec::new(), vec![key], ChangeSource::Push),
            Err(e) => {
                metrics::counter!(observability::PUSH_FETCH_FAILURES_TOTAL).increment(1);
                self.record_failure("push fetch", &e);
                return Err(e);
            }
        };
        self.record_success();
        Ok(report)
    }

    pub async fn handle_signal(&self, signal: PushSignal) -> Result<ReconcileReport, SyncError> {
        match signal {
            PushSignal::Event(event) => self.handle_push(event).await,
            PushSignal::Lagged(missed) => {
                warn!("push feed dropped {missed} events, polling to catch up");
                self.poll_once().await
            }
        }
    }

    fn record_failure(&self, channel: &str, err: &SyncError) {
        let mut health = self.health();
        health.consecutive_failures += 1;
        warn!(
            "{channel} failed ({} in a row): {err}",
            health.consecutive_failures
        );
        if !health.degraded && health.consecutive_failures >= self.settings.degraded_after {
            health.degraded = true;
            let consecutive_failures = health.consecutive_failures;
            drop(health);
            warn!("sync degraded after {consecutive_failures} consecutive failures");
            metrics::gauge!(observability::SYNC_DEGRADED).set(1.0);
            self.chart.notify().send(ChartEvent::SyncDegraded {
                consecutive_failures,
                last_error: err.to_string(),
            });
        }
    }

    fn record_success(&self) {
        let mut health = self.health();
        health.consecutive_failures = 0;
        if health.degraded {
            health.degraded = false;
            drop(health);
            info!("sync recovered");
            metrics::gauge!(observability::SYNC_DEGRADED).set(0.0);
            self.chart.notify().send(ChartEvent::SyncRecovered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;

    use crate::backend::{MemoryBackend, RecordedCall};
    use crate::notify::NotifyHub;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            poll_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_millis(100),
            degraded_after: 3,
        }
    }

    fn setup() -> (Arc<MemoryBackend>, Reconciler, Resource, Reservation) {
        let backend = Arc::new(MemoryBackend::new());
        let room = backend.seed_resource("101", 1);
        let booked = backend.seed_reservation(ReservationDraft::new(
            room.id,
            Stay::new(d(10), d(15)),
            BookingDetails::default(),
        ));
        let chart = Chart::new(backend.clone(), Arc::new(NotifyHub::new()), 50);
        (backend, Reconciler::new(chart, settings()), room, booked)
    }

    #[tokio::test]
    async fn first_poll_is_initial_load() {
        let (backend, sync, room, booked) = setup();
        let report = sync.poll_once().await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(sync.chart().reservation(&booked.id), Some(booked));
        assert_eq!(sync.chart().resources(), vec![room]);
        assert_eq!(sync.cursor().await, backend.cursor());
    }

    #[tokio::test]
    async fn empty_poll_still_advances_cursor() {
        let (backend, sync, _, _) = setup();
        sync.poll_once().await.unwrap();
        let before = sync.cursor().await;
        let report = sync.poll_once().await.unwrap();
        assert!(report.is_noop());
        assert_eq!(sync.cursor().await, before);
        assert_eq!(backend.cursor(), before);
    }

    #[tokio::test]
    async fn failed_poll_keeps_cursor() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        let cursor = sync.cursor().await;
        backend.external_update(booked.id, |r| r.details.guests = 3);
        backend.fail_next(BackendError::Unavailable("connection reset".into()));
        assert!(matches!(sync.poll_once().await, Err(SyncError::Backend(_))));
        assert_eq!(sync.cursor().await, cursor);
        assert_eq!(sync.consecutive_failures(), 1);

        let report = sync.poll_once().await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(sync.chart().reservation(&booked.id).unwrap().details.guests, 3);
        assert_eq!(sync.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn slow_poll_times_out() {
        let (backend, sync, _, _) = setup();
        backend.set_latency(Duration::from_millis(400));
        assert!(matches!(sync.poll_once().await, Err(SyncError::Timeout(_))));
        assert_eq!(sync.cursor().await, SyncCursor::ORIGIN);
    }

    #[tokio::test]
    async fn degraded_fires_once_then_recovers() {
        let (backend, sync, _, _) = setup();
        let mut events = sync.chart().subscribe();
        backend.fail_next_n(4, BackendError::Timeout);
        for _ in 0..4 {
            assert!(sync.poll_once().await.is_err());
        }
        assert!(sync.is_degraded());
        sync.poll_once().await.unwrap();
        assert!(!sync.is_degraded());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                ChartEvent::SyncDegraded { consecutive_failures, .. } => {
                    seen.push(format!("degraded@{consecutive_failures}"))
                }
                ChartEvent::SyncRecovered => seen.push("recovered".to_string()),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["degraded@3", "recovered"]);
    }

    #[tokio::test]
    async fn push_delete_removes_without_fetch() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        let calls = backend.calls().len();
        backend.external_delete(booked.id);
        sync.handle_push(PushEvent {
            kind: EntityKind::Reservation,
            action: PushAction::Delete,
            id: booked.id,
        })
        .await
        .unwrap();
        assert!(sync.chart().reservation(&booked.id).is_none());
        assert_eq!(backend.calls().len(), calls);
    }

    #[tokio::test]
    async fn push_update_fetches_and_merges() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        backend.external_update(booked.id, |r| r.status = ReservationStatus::CheckedIn);
        let report = sync
            .handle_push(PushEvent {
                kind: EntityKind::Reservation,
                action: PushAction::Update,
                id: booked.id,
            })
            .await
            .unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(
            sync.chart().reservation(&booked.id).unwrap().status,
            ReservationStatus::CheckedIn
        );
    }

    #[tokio::test]
    async fn push_for_vanished_entity_removes_it() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        backend.external_delete(booked.id);
        let report = sync
            .handle_push(PushEvent {
                kind: EntityKind::Reservation,
                action: PushAction::Update,
                id: booked.id,
            })
            .await
            .unwrap();
        assert_eq!(report.removed, vec![booked.id]);
    }

    #[tokio::test]
    async fn push_fetch_failure_is_absorbed() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        backend.fail_next(BackendError::Unavailable("down".into()));
        let result = sync
            .handle_push(PushEvent {
                kind: EntityKind::Reservation,
                action: PushAction::Update,
                id: booked.id,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(sync.consecutive_failures(), 1);
        assert!(sync.chart().reservation(&booked.id).is_some());
    }

    #[tokio::test]
    async fn push_fetch_times_out() {
        let (backend, sync, _, booked) = setup();
        sync.poll_once().await.unwrap();
        let cursor = sync.cursor().await;
        backend.external_update(booked.id, |r| r.details.guests = 4);
        backend.set_latency(Duration::from_millis(400));
        let result = sync
            .handle_push(PushEvent {
                kind: EntityKind::Reservation,
                action: PushAction::Update,
                id: booked.id,
            })
            .await;
        assert!(matches!(result, Err(SyncError::Timeout(t)) if t == Duration::from_millis(100)));
        assert_eq!(sync.consecutive_failures(), 1);
        assert_eq!(sync.chart().reservation(&booked.id), Some(booked));
        assert_eq!(sync.cursor().await, cursor);
    }

    #[tokio::test]
    async fn lagged_signal_triggers_full_poll() {
        let (backend, sync, _, _) = setup();
        let report = sync.handle_signal(PushSignal::Lagged(12)).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert!(matches!(
            backend.calls().last(),
            Some(RecordedCall::ChangesSince { .. })
        ));
    }
}
