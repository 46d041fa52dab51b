use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::NOTIFY_CHANNEL_CAPACITY;
use crate::model::{ReservationId, ResourceId, Version};

/// Where a store change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Poll,
    Push,
    /// Remote changes held back while a mutation was in flight.
    Settlement,
}

impl ChangeSource {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeSource::Poll => "poll",
            ChangeSource::Push => "push",
            ChangeSource::Settlement => "settlement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChartEvent {
    MutationConfirmed {
        reservation_id: ReservationId,
        kind: &'static str,
        version: Version,
    },
    MutationRolledBack {
        reservation_id: ReservationId,
        kind: &'static str,
        reason: String,
    },
    HistoryChanged {
        can_undo: bool,
        can_redo: bool,
    },
    Reconciled {
        source: ChangeSource,
        changed: Vec<Ulid>,
        removed: Vec<Ulid>,
    },
    SyncDegraded {
        consecutive_failures: u32,
        last_error: String,
    },
    SyncRecovered,
}

/// Broadcast hub: one chart-wide channel plus lazily created per-resource channels.
pub struct NotifyHub {
    all: broadcast::Sender<ChartEvent>,
    channels: DashMap<ResourceId, broadcast::Sender<ChartEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ChartEvent> {
        self.all.subscribe()
    }

    /// Subscribe to events touching one row. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: ResourceId) -> broadcast::Receiver<ChartEvent> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Chart-wide only. No-op if nobody is listening.
    pub fn send(&self, event: ChartEvent) {
        let _ = self.all.send(event);
    }

    /// Chart-wide, plus each listed row once.
    pub fn send_to(&self, resources: &[ResourceId], event: ChartEvent) {
        let mut seen: Vec<ResourceId> = Vec::with_capacity(resources.len());
        for rid in resources {
            if seen.contains(rid) {
                continue;
            }
            seen.push(*rid);
            if let Some(sender) = self.channels.get(rid) {
                let _ = sender.send(event.clone());
            }
        }
        self.send(event);
    }

    /// Drop a row's channel (e.g. when the resource disappears).
    pub fn remove(&self, resource_id: &ResourceId) {
        self.channels.remove(resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(id: Ulid) -> ChartEvent {
        ChartEvent::MutationConfirmed {
            reservation_id: id,
            kind: "move",
            version: Version(2),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut row = hub.subscribe(rid);
        let mut all = hub.subscribe_all();

        let event = confirmed(Ulid::new());
        hub.send_to(&[rid, rid], event.clone());

        assert_eq!(row.recv().await.unwrap(), event);
        assert_eq!(all.recv().await.unwrap(), event);
        assert!(row.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_rows_stay_quiet() {
        let hub = NotifyHub::new();
        let mut row = hub.subscribe(Ulid::new());
        hub.send_to(&[Ulid::new()], confirmed(Ulid::new()));
        assert!(row.try_recv().is_err());
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let hub = NotifyHub::new();
        hub.send(ChartEvent::SyncRecovered);
        let mut all = hub.subscribe_all();
        hub.send(confirmed(Ulid::new()));
        let event = tokio_test::block_on(all.recv());
        assert!(matches!(tokio_test::assert_ok!(event), ChartEvent::MutationConfirmed { .. }));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send_to(&[rid], ChartEvent::SyncRecovered);
        hub.remove(&rid);
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&ChartEvent::HistoryChanged {
            can_undo: true,
            can_redo: false,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"history_changed","can_undo":true,"can_redo":false}"#);
    }
}
