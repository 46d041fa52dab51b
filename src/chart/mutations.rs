use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::backend::BackendError;
use crate::command::{Command, CommandId, Revoked};
use crate::interval::Placement;
use crate::limits::DEFAULT_PAYMENT_METHOD;
use crate::model::*;
use crate::notify::{ChangeSource, ChartEvent};
use crate::observability;
use crate::store::EntityStore;
use crate::sync::merge::ReconcileReport;

use super::{Attempt, Chart, ChartState, HeldChange, MutationError, Pending};

pub(super) enum BackendCall {
    Create(ReservationDraft),
    Update {
        reservation: Reservation,
        expected: Version,
    },
    Delete {
        id: ReservationId,
        expected: Version,
    },
}

/// What a mutation intends, worked out against the current store.
pub(super) struct Plan {
    attempt: Attempt,
    before: Option<Reservation>,
    after: Option<Reservation>,
    call: BackendCall,
}

impl Plan {
    fn update(attempt: Attempt, base: &Reservation, after: Reservation) -> Self {
        Self {
            attempt,
            before: Some(base.clone()),
            call: BackendCall::Update {
                reservation: after.clone(),
                expected: base.version,
            },
            after: Some(after),
        }
    }
}

/// Applied locally, waiting on the backend.
struct InFlight {
    command_id: CommandId,
    attempt: Attempt,
    call: BackendCall,
    rows: Vec<ResourceId>,
}

/// Local checks, skipped when neither placement nor blocking status changes.
fn validate(store: &EntityStore, id: ReservationId, plan: &Plan) -> Result<(), MutationError> {
    let Some(after) = &plan.after else {
        return Ok(());
    };
    let needs_check = match &plan.before {
        None => true,
        Some(before) => {
            Placement::of(before) != Placement::of(after) || (!before.blocks() && after.blocks())
        }
    };
    if !needs_check {
        return Ok(());
    }
    if !after.stay.is_valid() {
        return Err(MutationError::InvalidStay {
            reservation_id: id,
            stay: after.stay,
        });
    }
    if !store.contains_resource(&after.resource_id) {
        return Err(MutationError::UnknownResource {
            reservation_id: id,
            resource_id: after.resource_id,
        });
    }
    if after.blocks() {
        let attempted = Placement::of(after);
        let conflicts = store.find_conflicts(&attempted, Some(id));
        if !conflicts.is_empty() {
            return Err(MutationError::ValidationConflict {
                reservation_id: id,
                attempted,
                conflicts,
            });
        }
    }
    Ok(())
}

fn classify(id: ReservationId, attempt: Attempt, err: BackendError) -> MutationError {
    match err {
        BackendError::VersionConflict | BackendError::NotFound => MutationError::StaleData {
            reservation_id: id,
            attempt,
        },
        BackendError::DoubleBooking => MutationError::DoubleBooking {
            reservation_id: id,
            attempt,
        },
        BackendError::Rejected(message) => MutationError::Backend {
            reservation_id: id,
            attempt,
            message,
        },
        other => MutationError::Backend {
            reservation_id: id,
            attempt,
            message: other.to_string(),
        },
    }
}

fn apply_held(st: &mut ChartState, held: Vec<HeldChange>) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for change in held {
        match change {
            HeldChange::Upsert(entity) => {
                let id = entity.key().id();
                let outcome = st.merge_remote(entity);
                report.record(id, outcome);
            }
            HeldChange::Remove(key) => {
                if st.remove_remote(key) == Some(true) {
                    report.removed.push(key.id());
                }
            }
        }
    }
    report
}

fn rows_of(before: &Option<Reservation>, after: &Option<Reservation>) -> Vec<ResourceId> {
    before
        .iter()
        .chain(after.iter())
        .map(|r| r.resource_id)
        .collect()
}

impl Chart {
    // ── Entry points ─────────────────────────────────────────

    /// Shows the new bar at once under a temporary id, then swaps in the backend's.
    pub async fn create_reservation(&self, draft: ReservationDraft) -> Result<Reservation, MutationError> {
        let temp_id = Ulid::new();
        let saved = self
            .run(temp_id, move |_, id| {
                let placement = Placement::new(draft.resource_id, draft.stay);
                Ok(Plan {
                    attempt: Attempt::Create { placement },
                    before: None,
                    after: Some(draft.clone().into_reservation(id, Version::INITIAL)),
                    call: BackendCall::Create(draft),
                })
            })
            .await?;
        saved.ok_or(MutationError::NotFound(temp_id))
    }

    pub async fn update_reservation(
        &self,
        id: ReservationId,
        patch: ReservationPatch,
    ) -> Result<Reservation, MutationError> {
        if patch.is_empty() {
            return self.reservation(&id).ok_or(MutationError::NotFound(id));
        }
        self.run_update(id, move |base| {
            let after = patch.apply_to(base);
            let attempt = if patch.resource_id.is_some() || patch.stay.is_some() {
                Attempt::Move {
                    placement: Placement::of(&after),
                }
            } else if let Some(to) = patch.status {
                Attempt::Status { to }
            } else {
                Attempt::Update
            };
            (attempt, after)
        })
        .await
    }

    /// Keep the length of stay; start on `start` in row `resource_id`.
    pub async fn move_reservation(
        &self,
        id: ReservationId,
        resource_id: ResourceId,
        start: NaiveDate,
    ) -> Result<Reservation, MutationError> {
        self.run_update(id, move |base| {
            let placement = Placement::new(resource_id, base.stay.starting_on(start));
            (Attempt::Move { placement }, placed(base, placement))
        })
        .await
    }

    /// Move to an exact row and stay.
    pub async fn place_reservation(
        &self,
        id: ReservationId,
        placement: Placement,
    ) -> Result<Reservation, MutationError> {
        self.run_update(id, move |base| (Attempt::Move { placement }, placed(base, placement)))
            .await
    }

    /// Move one bound; the other stays where it is.
    pub async fn resize_reservation(
        &self,
        id: ReservationId,
        edge: Edge,
        date: NaiveDate,
    ) -> Result<Reservation, MutationError> {
        self.run_update(id, move |base| {
            let stay = match edge {
                Edge::Start => Stay {
                    start: date,
                    end: base.stay.end,
                },
                Edge::End => Stay {
                    start: base.stay.start,
                    end: date,
                },
            };
            let placement = Placement::new(base.resource_id, stay);
            (Attempt::Resize { edge, stay }, placed(base, placement))
        })
        .await
    }

    pub async fn set_status(
        &self,
        id: ReservationId,
        status: ReservationStatus,
    ) -> Result<Reservation, MutationError> {
        self.run_update(id, move |base| {
            let mut after = base.clone();
            after.status = status;
            (Attempt::Status { to: status }, after)
        })
        .await
    }

    /// Marking paid stamps `today` and the method (bank transfer unless given);
    /// marking unpaid clears both.
    pub async fn set_payment(
        &self,
        id: ReservationId,
        paid: bool,
        method: Option<String>,
        today: NaiveDate,
    ) -> Result<Reservation, MutationError> {
        self.run_update(id, move |base| {
            let mut after = base.clone();
            after.payment = if paid {
                Payment::paid(today, method.unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string()))
            } else {
                Payment::unpaid()
            };
            (Attempt::Payment { paid }, after)
        })
        .await
    }

    /// Removed locally first; restored whole if the backend refuses.
    pub async fn delete_reservation(&self, id: ReservationId) -> Result<(), MutationError> {
        self.run(id, |store, id| {
            let base = store.reservation(&id).ok_or(MutationError::NotFound(id))?;
            Ok(Plan {
                attempt: Attempt::Delete,
                before: Some(base.clone()),
                after: None,
                call: BackendCall::Delete {
                    id,
                    expected: base.version,
                },
            })
        })
        .await
        .map(|_| ())
    }

    // ── Pipeline ─────────────────────────────────────────────

    async fn run_update<F>(&self, id: ReservationId, edit: F) -> Result<Reservation, MutationError>
    where
        F: FnOnce(&Reservation) -> (Attempt, Reservation) + Send + 'static,
    {
        let saved = self
            .run(id, move |store, id| {
                let base = store.reservation(&id).ok_or(MutationError::NotFound(id))?;
                let (attempt, after) = edit(base);
                Ok(Plan::update(attempt, base, after))
            })
            .await?;
        saved.ok_or(MutationError::NotFound(id))
    }

    /// Gate, plan, apply, call the backend, settle. The backend leg runs on its own
    /// task so it always settles, even if the caller stops waiting.
    async fn run<F>(&self, id: ReservationId, plan: F) -> Result<Option<Reservation>, MutationError>
    where
        F: FnOnce(&EntityStore, ReservationId) -> Result<Plan, MutationError>,
    {
        let (id, gate) = self.enter(id).await;
        let in_flight = match self.apply_locally(id, plan) {
            Ok(in_flight) => in_flight,
            Err(e) => {
                drop(gate);
                self.release_gate(id);
                return Err(e);
            }
        };

        let attempt = in_flight.attempt.clone();
        let chart = self.clone();
        let task = tokio::spawn(async move {
            let result = chart.complete(id, in_flight).await;
            drop(gate);
            chart.release_gate(id);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(MutationError::Backend {
                reservation_id: id,
                attempt,
                message: format!("mutation task failed: {e}"),
            }),
        }
    }

    fn apply_locally<F>(&self, id: ReservationId, plan: F) -> Result<InFlight, MutationError>
    where
        F: FnOnce(&EntityStore, ReservationId) -> Result<Plan, MutationError>,
    {
        let prepared = self.with_state(|st| {
            let plan = plan(&st.store, id)?;
            validate(&st.store, id, &plan)?;

            let rows = rows_of(&plan.before, &plan.after);
            let key = EntityKey::Reservation(id);
            let before = plan.before.map(Entity::Reservation);
            let after = plan.after.map(Entity::Reservation);
            let command = Command::new(plan.attempt.to_string(), key, before.clone(), after);
            let command_id = st.history.execute(command, &mut st.store);
            st.pending.insert(
                id,
                Pending {
                    before,
                    held: Vec::new(),
                },
            );
            let in_flight = InFlight {
                command_id,
                attempt: plan.attempt,
                call: plan.call,
                rows,
            };
            Ok((in_flight, st.history_event(), st.history.len(), st.pending.len()))
        });

        match prepared {
            Ok((in_flight, history, depth, pending)) => {
                debug!("applied {} to {id} locally", in_flight.attempt);
                metrics::gauge!(observability::UNDO_DEPTH).set(depth as f64);
                metrics::gauge!(observability::PENDING_MUTATIONS).set(pending as f64);
                self.inner.notify.send(history);
                Ok(in_flight)
            }
            Err(e) => {
                debug!("rejected locally: {e}");
                metrics::counter!(observability::MUTATIONS_TOTAL, "kind" => "local", "outcome" => "rejected")
                    .increment(1);
                Err(e)
            }
        }
    }

    async fn complete(&self, id: ReservationId, in_flight: InFlight) -> Result<Option<Reservation>, MutationError> {
        let InFlight {
            command_id,
            attempt,
            call,
            rows,
        } = in_flight;
        let kind = attempt.kind();
        let started = Instant::now();
        let result = self.dispatch(call).await;
        metrics::histogram!(observability::BACKEND_CALL_DURATION_SECONDS, "kind" => kind)
            .record(started.elapsed().as_secs_f64());
        self.settle(id, command_id, attempt, rows, result)
    }

    async fn dispatch(&self, call: BackendCall) -> Result<Option<Reservation>, BackendError> {
        let backend = &self.inner.backend;
        match call {
            BackendCall::Create(draft) => backend.create_reservation(draft).await.map(Some),
            BackendCall::Update {
                reservation,
                expected,
            } => backend.update_reservation(reservation, expected).await.map(Some),
            BackendCall::Delete { id, expected } => {
                backend.delete_reservation(id, expected).await.map(|()| None)
            }
        }
    }

    /// Second critical section: fold in the backend's answer or roll back, then apply
    /// whatever remote changes were held meanwhile.
    fn settle(
        &self,
        id: ReservationId,
        command_id: CommandId,
        attempt: Attempt,
        mut rows: Vec<ResourceId>,
        result: Result<Option<Reservation>, BackendError>,
    ) -> Result<Option<Reservation>, MutationError> {
        let kind = attempt.kind();
        let (outcome, held, history, depth, pending) = self.with_state(|st| {
            let (before, held) = st
                .pending
                .remove(&id)
                .map(|p: Pending| (p.before, p.held))
                .unwrap_or_default();

            let outcome = match result {
                Ok(Some(confirmed)) => {
                    let key = EntityKey::Reservation(confirmed.id);
                    let applied = st.history.is_applied(command_id);
                    let kept = st
                        .history
                        .amend(command_id, key, Some(Entity::Reservation(confirmed.clone())));
                    // Undone while in flight: the store stays as the operator left it.
                    if applied || !kept {
                        if confirmed.id != id {
                            st.store.take(&EntityKey::Reservation(id));
                        }
                        st.store.put(key, Some(Entity::Reservation(confirmed.clone())));
                    }
                    if confirmed.id != id {
                        st.aliases.insert(id, confirmed.id);
                    }
                    Ok(Some(confirmed))
                }
                Ok(None) => {
                    if !st.history.contains(command_id) {
                        st.store.take(&EntityKey::Reservation(id));
                    }
                    Ok(None)
                }
                Err(err) => {
                    if st.history.revoke(command_id, &mut st.store) == Revoked::Missing {
                        st.store.put(EntityKey::Reservation(id), before);
                    }
                    Err(classify(id, attempt, err))
                }
            };

            // The entity is gone on the backend: held upserts are older than the
            // delete, but a held removal still has to land if an undo brought it back.
            let held = if matches!(outcome, Ok(None)) {
                let removals = held
                    .into_iter()
                    .filter(|change| matches!(change, HeldChange::Remove(_)))
                    .collect();
                apply_held(st, removals)
            } else {
                apply_held(st, held)
            };
            rows.extend(st.rows_of(&held.changed));
            (
                outcome,
                held,
                st.history_event(),
                st.history.len(),
                st.pending.len(),
            )
        });

        metrics::gauge!(observability::UNDO_DEPTH).set(depth as f64);
        metrics::gauge!(observability::PENDING_MUTATIONS).set(pending as f64);
        let notify = &self.inner.notify;
        match &outcome {
            Ok(saved) => {
                let (reservation_id, version) = saved
                    .as_ref()
                    .map_or((id, Version::INITIAL), |r| (r.id, r.version));
                info!("{kind} confirmed for {reservation_id} at {version}");
                metrics::counter!(observability::MUTATIONS_TOTAL, "kind" => kind, "outcome" => "confirmed")
                    .increment(1);
                notify.send_to(
                    &rows,
                    ChartEvent::MutationConfirmed {
                        reservation_id,
                        kind,
                        version,
                    },
                );
            }
            Err(e) => {
                warn!("{kind} rolled back for {id}: {e}");
                metrics::counter!(observability::MUTATIONS_TOTAL, "kind" => kind, "outcome" => "rolled_back")
                    .increment(1);
                metrics::counter!(observability::ROLLBACKS_TOTAL, "kind" => kind).increment(1);
                notify.send_to(
                    &rows,
                    ChartEvent::MutationRolledBack {
                        reservation_id: id,
                        kind,
                        reason: e.to_string(),
                    },
                );
                notify.send(history);
            }
        }
        if !held.is_noop() {
            self.announce(ChangeSource::Settlement, &held, &rows);
        }
        outcome
    }
}

fn placed(base: &Reservation, placement: Placement) -> Reservation {
    let mut after = base.clone();
    after.resource_id = placement.resource_id;
    after.stay = placement.stay;
    after
}
