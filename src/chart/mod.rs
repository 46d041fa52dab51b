mod error;
mod mutations;

pub use error::{Attempt, MutationError};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::debug;
use ulid::Ulid;

use crate::command::{CommandId, CommandInfo, CommandStack, StackChange};
use crate::backend::Backend;
use crate::interval::Placement;
use crate::model::*;
use crate::notify::{ChangeSource, ChartEvent, NotifyHub};
use crate::store::EntityStore;
use crate::sync::merge::{self, MergeOutcome, ReconcileReport};

/// A remote change that arrived while a local call on the same entity was in flight.
#[derive(Debug, Clone)]
pub(super) enum HeldChange {
    Upsert(Entity),
    Remove(EntityKey),
}

#[derive(Debug)]
pub(super) struct Pending {
    /// Restored on failure if the command has already left the history.
    pub(super) before: Option<Entity>,
    pub(super) held: Vec<HeldChange>,
}

/// Everything that must change together. Guarded by one std mutex that is never
/// held across an `.await`.
pub(super) struct ChartState {
    pub(super) store: EntityStore,
    pub(super) history: CommandStack,
    pub(super) pending: HashMap<ReservationId, Pending>,
    /// Temporary create id → id assigned by the backend.
    pub(super) aliases: HashMap<ReservationId, ReservationId>,
}

impl ChartState {
    pub(super) fn resolve(&self, id: ReservationId) -> ReservationId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    pub(super) fn history_event(&self) -> ChartEvent {
        ChartEvent::HistoryChanged {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        }
    }

    /// Merge one remote entity, holding it back if its reservation is pending.
    pub(super) fn merge_remote(&mut self, entity: Entity) -> MergeOutcome {
        if let Some(id) = entity.as_reservation().map(|r| r.id)
            && let Some(pending) = self.pending.get_mut(&id)
        {
            debug!("holding remote {} until the local call settles", entity.key());
            pending.held.push(HeldChange::Upsert(entity));
            return MergeOutcome::Deferred;
        }
        merge::merge_entity(&mut self.store, entity)
    }

    /// `None` when held back, else whether anything was removed.
    pub(super) fn remove_remote(&mut self, key: EntityKey) -> Option<bool> {
        if let EntityKey::Reservation(id) = key
            && let Some(pending) = self.pending.get_mut(&id)
        {
            debug!("holding remote removal of {key} until the local call settles");
            pending.held.push(HeldChange::Remove(key));
            return None;
        }
        Some(merge::remove_entity(&mut self.store, &key))
    }

    /// Rows a set of ids touches, for per-resource notification.
    pub(super) fn rows_of(&self, ids: &[Ulid]) -> Vec<ResourceId> {
        ids.iter()
            .filter_map(|id| self.store.reservation(id).map(|r| r.resource_id))
            .collect()
    }
}

pub(super) struct ChartInner {
    pub(super) state: Mutex<ChartState>,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) notify: Arc<NotifyHub>,
    /// One async lock per reservation with a call in flight. A second mutation on the
    /// same reservation waits here instead of racing the first.
    pub(super) gates: DashMap<ReservationId, Arc<tokio::sync::Mutex<()>>>,
}

/// The optimistic booking chart. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Chart {
    pub(super) inner: Arc<ChartInner>,
}

impl Chart {
    pub fn new(backend: Arc<dyn Backend>, notify: Arc<NotifyHub>, max_undo: usize) -> Self {
        Self {
            inner: Arc::new(ChartInner {
                state: Mutex::new(ChartState {
                    store: EntityStore::new(),
                    history: CommandStack::new(max_undo),
                    pending: HashMap::new(),
                    aliases: HashMap::new(),
                }),
                backend,
                notify,
                gates: DashMap::new(),
            }),
        }
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut ChartState) -> R) -> R {
        let mut guard = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.inner.notify
    }

    // ── Per-entity gate ──────────────────────────────────────

    async fn lock_gate(&self, id: ReservationId) -> OwnedMutexGuard<()> {
        let gate = self.inner.gates.entry(id).or_default().clone();
        gate.lock_owned().await
    }

    /// Wait until no call on `id` is in flight, following a create's temporary id to
    /// the id the backend assigned. Returns the id to use and the held gate.
    pub(super) async fn enter(&self, id: ReservationId) -> (ReservationId, OwnedMutexGuard<()>) {
        let guard = self.lock_gate(id).await;
        let resolved = self.with_state(|st| st.resolve(id));
        if resolved == id {
            return (id, guard);
        }
        drop(guard);
        self.release_gate(id);
        (resolved, self.lock_gate(resolved).await)
    }

    /// Drop the gate entry once nobody else holds or waits on it.
    pub(super) fn release_gate(&self, id: ReservationId) {
        self.inner.gates.remove_if(&id, |_, gate| Arc::strong_count(gate) == 1);
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn reservation(&self, id: &ReservationId) -> Option<Reservation> {
        self.with_state(|st| {
            let id = st.resolve(*id);
            st.store.reservation(&id).cloned()
        })
    }

    /// All reservations, in start order.
    pub fn reservations(&self) -> Vec<Reservation> {
        self.with_state(|st| {
            let mut list: Vec<Reservation> = st.store.reservations().cloned().collect();
            list.sort_by_key(|r| (r.stay.start, r.id));
            list
        })
    }

    pub fn reservations_on(&self, resource_id: &ResourceId) -> Vec<Reservation> {
        self.with_state(|st| st.store.reservations_on(resource_id).into_iter().cloned().collect())
    }

    /// Rows in display order.
    pub fn resources(&self) -> Vec<Resource> {
        self.with_state(|st| st.store.resources_sorted().into_iter().cloned().collect())
    }

    pub fn resource(&self, id: &ResourceId) -> Option<Resource> {
        self.with_state(|st| st.store.resource(id).cloned())
    }

    /// Deep copy of the store.
    pub fn snapshot(&self) -> EntityStore {
        self.with_state(|st| st.store.clone())
    }

    pub fn find_conflicts(&self, candidate: &Placement, exclude: Option<ReservationId>) -> Vec<ReservationId> {
        self.with_state(|st| st.store.find_conflicts(candidate, exclude))
    }

    /// A backend call for this reservation is in flight.
    pub fn is_pending(&self, id: &ReservationId) -> bool {
        self.with_state(|st| st.pending.contains_key(id))
    }

    pub fn pending_count(&self) -> usize {
        self.with_state(|st| st.pending.len())
    }

    // ── History ──────────────────────────────────────────────

    /// Local only: restores the snapshot, issues no backend call.
    pub fn undo(&self) -> Option<CommandInfo> {
        self.step_history(|st| st.history.undo(&mut st.store))
    }

    pub fn redo(&self) -> Option<CommandInfo> {
        self.step_history(|st| st.history.redo(&mut st.store))
    }

    pub fn undo_to(&self, id: CommandId) -> usize {
        self.step_history(|st| st.history.undo_to(id, &mut st.store))
    }

    pub fn clear_history(&self) {
        self.step_history(|st| st.history.clear())
    }

    pub fn can_undo(&self) -> bool {
        self.with_state(|st| st.history.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.with_state(|st| st.history.can_redo())
    }

    /// Newest first.
    pub fn history(&self) -> Vec<CommandInfo> {
        self.with_state(|st| st.history.history())
    }

    pub fn redo_history(&self) -> Vec<CommandInfo> {
        self.with_state(|st| st.history.redo_history())
    }

    pub fn history_len(&self) -> usize {
        self.with_state(|st| st.history.len())
    }

    fn step_history<R>(&self, f: impl FnOnce(&mut ChartState) -> R) -> R {
        let (result, event, depth) = self.with_state(|st| {
            let result = f(st);
            (result, st.history_event(), st.history.len())
        });
        metrics::gauge!(crate::observability::UNDO_DEPTH).set(depth as f64);
        self.inner.notify.send(event);
        result
    }

    // ── Subscriptions ────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<ChartEvent> {
        self.inner.notify.subscribe_all()
    }

    pub fn subscribe_resource(&self, resource_id: ResourceId) -> broadcast::Receiver<ChartEvent> {
        self.inner.notify.subscribe(resource_id)
    }

    pub fn subscribe_history(&self) -> broadcast::Receiver<StackChange> {
        self.with_state(|st| st.history.subscribe())
    }

    // ── Remote changes ───────────────────────────────────────

    /// Fold backend truth into the store. Entities with a call in flight are held
    /// and applied when that call settles.
    pub fn apply_remote(
        &self,
        entities: Vec<Entity>,
        removed: Vec<EntityKey>,
        source: ChangeSource,
    ) -> ReconcileReport {
        let (report, rows) = self.with_state(|st| {
            let mut report = ReconcileReport::default();
            let mut rows = Vec::new();
            for entity in entities {
                let key = entity.key();
                if let Some(r) = st.store.reservation(&key.id()) {
                    rows.push(r.resource_id);
                }
                let outcome = st.merge_remote(entity);
                metrics::counter!(
                    crate::observability::MERGES_TOTAL,
                    "source" => source.label(),
                    "outcome" => outcome.label()
                )
                .increment(1);
                report.record(key.id(), outcome);
            }
            for key in removed {
                if let Some(r) = st.store.reservation(&key.id()) {
                    rows.push(r.resource_id);
                }
                match st.remove_remote(key) {
                    Some(true) => report.removed.push(key.id()),
                    Some(false) => {}
                    None => report.deferred += 1,
                }
            }
            rows.extend(st.rows_of(&report.changed));
            (report, rows)
        });
        self.announce(source, &report, &rows);
        report
    }

    pub fn merge_remote(&self, entity: Entity, source: ChangeSource) -> MergeOutcome {
        let key = entity.key();
        let report = self.apply_remote(vec![entity], Vec::new(), source);
        if report.deferred > 0 {
            MergeOutcome::Deferred
        } else if report.inserted > 0 {
            MergeOutcome::Inserted
        } else if report.replaced > 0 {
            MergeOutcome::Replaced
        } else {
            debug!("ignored stale remote {key}");
            MergeOutcome::Stale
        }
    }

    /// Returns false if nothing was removed (absent, or held back).
    pub fn remove_remote(&self, key: EntityKey, source: ChangeSource) -> bool {
        !self.apply_remote(Vec::new(), vec![key], source).removed.is_empty()
    }

    pub(super) fn announce(&self, source: ChangeSource, report: &ReconcileReport, rows: &[ResourceId]) {
        if report.is_noop() {
            return;
        }
        debug!(
            "reconciled from {}: {} changed, {} removed, {} stale, {} deferred",
            source.label(),
            report.changed.len(),
            report.removed.len(),
            report.stale,
            report.deferred
        );
        self.inner.notify.send_to(
            rows,
            ChartEvent::Reconciled {
                source,
                changed: report.changed.clone(),
                removed: report.removed.clone(),
            },
        );
    }
}
