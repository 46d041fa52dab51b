use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::interval::{self, Placement};
use crate::limits::NOTIFY_CHANNEL_CAPACITY;
use crate::model::*;

use super::{Backend, BackendError, PushSignal};

/// What the backend was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Create { resource_id: ResourceId, stay: Stay },
    Update { id: ReservationId, expected: Version, stay: Stay },
    Delete { id: ReservationId, expected: Version },
    Fetch { kind: EntityKind, id: Ulid },
    ChangesSince { cursor: SyncCursor },
}

#[derive(Default)]
struct MemoryState {
    /// Bumped on every write; doubles as the sync cursor.
    seq: u64,
    resources: HashMap<ResourceId, Resource>,
    reservations: HashMap<ReservationId, Reservation>,
    /// seq → key written at that point.
    log: Vec<(u64, EntityKey)>,
}

impl MemoryState {
    fn record(&mut self, key: EntityKey) -> u64 {
        self.seq += 1;
        self.log.push((self.seq, key));
        self.seq
    }

    fn next_version(&self, key: &EntityKey) -> Version {
        let current = match key {
            EntityKey::Resource(id) => self.resources.get(id).map(|r| r.version),
            EntityKey::Reservation(id) => self.reservations.get(id).map(|r| r.version),
        };
        current.unwrap_or(Version::INITIAL).next()
    }

    fn check_placement(&self, candidate: &Reservation) -> Result<(), BackendError> {
        if !candidate.stay.is_valid() {
            return Err(BackendError::Rejected(format!(
                "check-out must be after check-in ({})",
                candidate.stay
            )));
        }
        if !self.resources.contains_key(&candidate.resource_id) {
            return Err(BackendError::Rejected(format!(
                "unknown room {}",
                candidate.resource_id
            )));
        }
        if !candidate.blocks() {
            return Ok(());
        }
        let conflicts = interval::find_conflicts(
            &Placement::of(candidate),
            self.reservations.values(),
            Some(candidate.id),
        );
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(BackendError::DoubleBooking)
        }
    }
}

/// In-process stand-in for the booking service: per-entity versions, optimistic
/// locking, double-booking rejection, a change log and a push feed.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    feed: Mutex<broadcast::Sender<PushEvent>>,
    faults: Mutex<VecDeque<BackendError>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            feed: Mutex::new(broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0),
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }

    // ── Test and demo controls ───────────────────────────────

    pub fn seed_resource(&self, name: &str, position: u32) -> Resource {
        let mut state = lock(&self.state);
        let resource = Resource {
            id: Ulid::new(),
            name: name.to_string(),
            building: None,
            location: None,
            position,
            version: Version::INITIAL.next(),
        };
        state.resources.insert(resource.id, resource.clone());
        state.record(EntityKey::Resource(resource.id));
        drop(state);
        self.publish(EntityKind::Resource, PushAction::Insert, resource.id);
        resource
    }

    /// Insert a reservation as if another operator had booked it. Skips conflict checks.
    pub fn seed_reservation(&self, draft: ReservationDraft) -> Reservation {
        let mut state = lock(&self.state);
        let reservation = draft.into_reservation(Ulid::new(), Version::INITIAL.next());
        state.reservations.insert(reservation.id, reservation.clone());
        state.record(EntityKey::Reservation(reservation.id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Insert, reservation.id);
        reservation
    }

    /// A concurrent edit by another client: bumps the version and notifies.
    pub fn external_update(
        &self,
        id: ReservationId,
        edit: impl FnOnce(&mut Reservation),
    ) -> Option<Reservation> {
        let mut state = lock(&self.state);
        let version = state.next_version(&EntityKey::Reservation(id));
        let stored = state.reservations.get_mut(&id)?;
        edit(stored);
        stored.id = id;
        stored.version = version;
        let updated = stored.clone();
        state.record(EntityKey::Reservation(id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Update, id);
        Some(updated)
    }

    pub fn external_delete(&self, id: ReservationId) -> Option<Reservation> {
        let mut state = lock(&self.state);
        let removed = state.reservations.remove(&id)?;
        state.record(EntityKey::Reservation(id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Delete, id);
        Some(removed)
    }

    /// Make the next call (of any kind) fail with `err`.
    pub fn fail_next(&self, err: BackendError) {
        self.fail_next_n(1, err);
    }

    pub fn fail_next_n(&self, n: usize, err: BackendError) {
        let mut faults = lock(&self.faults);
        faults.extend(std::iter::repeat_n(err, n));
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Close the push feed; current subscribers see their stream end.
    pub fn disconnect_push(&self) {
        *lock(&self.feed) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<Reservation> {
        lock(&self.state).reservations.get(id).cloned()
    }

    pub fn reservation_count(&self) -> usize {
        lock(&self.state).reservations.len()
    }

    pub fn cursor(&self) -> SyncCursor {
        SyncCursor(lock(&self.state).seq)
    }

    // ── Internals ────────────────────────────────────────────

    fn publish(&self, kind: EntityKind, action: PushAction, id: Ulid) {
        let _ = lock(&self.feed).send(PushEvent { kind, action, id });
    }

    /// Shared preamble: record the call, wait out the latency, pop an injected fault.
    async fn enter(&self, call: RecordedCall) -> Result<(), BackendError> {
        lock(&self.calls).push(call);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.faults).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_reservation(&self, draft: ReservationDraft) -> Result<Reservation, BackendError> {
        self.enter(RecordedCall::Create {
            resource_id: draft.resource_id,
            stay: draft.stay,
        })
        .await?;
        let mut state = lock(&self.state);
        let reservation = draft.into_reservation(Ulid::new(), Version::INITIAL.next());
        state.check_placement(&reservation)?;
        state.reservations.insert(reservation.id, reservation.clone());
        state.record(EntityKey::Reservation(reservation.id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Insert, reservation.id);
        Ok(reservation)
    }

    async fn update_reservation(
        &self,
        reservation: Reservation,
        expected: Version,
    ) -> Result<Reservation, BackendError> {
        self.enter(RecordedCall::Update {
            id: reservation.id,
            expected,
            stay: reservation.stay,
        })
        .await?;
        let mut state = lock(&self.state);
        let stored = state
            .reservations
            .get(&reservation.id)
            .ok_or(BackendError::NotFound)?;
        if stored.version != expected {
            return Err(BackendError::VersionConflict);
        }
        state.check_placement(&reservation)?;
        let mut updated = reservation;
        updated.version = state.next_version(&EntityKey::Reservation(updated.id));
        state.reservations.insert(updated.id, updated.clone());
        state.record(EntityKey::Reservation(updated.id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Update, updated.id);
        Ok(updated)
    }

    async fn delete_reservation(&self, id: ReservationId, expected: Version) -> Result<(), BackendError> {
        self.enter(RecordedCall::Delete { id, expected }).await?;
        let mut state = lock(&self.state);
        let stored = state.reservations.get(&id).ok_or(BackendError::NotFound)?;
        if stored.version != expected {
            return Err(BackendError::VersionConflict);
        }
        state.reservations.remove(&id);
        state.record(EntityKey::Reservation(id));
        drop(state);
        self.publish(EntityKind::Reservation, PushAction::Delete, id);
        Ok(())
    }

    async fn fetch(&self, kind: EntityKind, id: Ulid) -> Result<Option<Entity>, BackendError> {
        self.enter(RecordedCall::Fetch { kind, id }).await?;
        let state = lock(&self.state);
        Ok(match kind {
            EntityKind::Resource => state.resources.get(&id).cloned().map(Entity::Resource),
            EntityKind::Reservation => state.reservations.get(&id).cloned().map(Entity::Reservation),
        })
    }

    async fn changes_since(&self, cursor: SyncCursor) -> Result<ChangeSet, BackendError> {
        self.enter(RecordedCall::ChangesSince { cursor }).await?;
        let state = lock(&self.state);
        // The log is ordered by seq, so a binary search finds the first unseen write.
        let from = state.log.partition_point(|(seq, _)| *seq <= cursor.0);
        let touched: BTreeSet<EntityKey> = state.log[from..].iter().map(|(_, key)| *key).collect();

        let mut changes = ChangeSet {
            cursor: SyncCursor(state.seq),
            ..ChangeSet::default()
        };
        for key in touched {
            let current = match key {
                EntityKey::Resource(id) => state.resources.get(&id).cloned().map(Entity::Resource),
                EntityKey::Reservation(id) => {
                    state.reservations.get(&id).cloned().map(Entity::Reservation)
                }
            };
            match current {
                Some(entity) => changes.entities.push(entity),
                None if cursor != SyncCursor::ORIGIN => changes.removed.push(key),
                None => {}
            }
        }
        Ok(changes)
    }

    fn subscribe(&self) -> BoxStream<'static, PushSignal> {
        let rx = lock(&self.feed).subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((PushSignal::Event(event), rx)),
                Err(RecvError::Lagged(n)) => Some((PushSignal::Lagged(n), rx)),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}
