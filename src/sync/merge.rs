//! The version-ordering merge rule shared by the poll and push channels.

use ulid::Ulid;

use crate::model::*;
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// Incoming version older than the stored one; ignored.
    Stale,
    /// Held back because a local mutation on the entity is in flight.
    Deferred,
}

impl MergeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MergeOutcome::Inserted => "inserted",
            MergeOutcome::Replaced => "replaced",
            MergeOutcome::Stale => "stale",
            MergeOutcome::Deferred => "deferred",
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Replaced)
    }
}

/// Insert unseen entities; replace a stored one only if `incoming` is not older.
pub fn merge_entity(store: &mut EntityStore, incoming: Entity) -> MergeOutcome {
    let key = incoming.key();
    match store.version_of(&key) {
        None => {
            store.put(key, Some(incoming));
            MergeOutcome::Inserted
        }
        Some(current) if incoming.version() >= current => {
            store.put(key, Some(incoming));
            MergeOutcome::Replaced
        }
        Some(_) => MergeOutcome::Stale,
    }
}

/// Returns true if something was removed.
pub fn remove_entity(store: &mut EntityStore, key: &EntityKey) -> bool {
    store.take(key).is_some()
}

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub replaced: usize,
    pub stale: usize,
    pub deferred: usize,
    /// Ids inserted or replaced.
    pub changed: Vec<Ulid>,
    pub removed: Vec<Ulid>,
}

impl ReconcileReport {
    pub fn record(&mut self, id: Ulid, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Replaced => self.replaced += 1,
            MergeOutcome::Stale => self.stale += 1,
            MergeOutcome::Deferred => self.deferred += 1,
        }
        if outcome.changed() {
            self.changed.push(id);
        }
    }

    /// Nothing in the store moved.
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn absorb(&mut self, other: ReconcileReport) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.stale += other.stale;
        self.deferred += other.deferred;
        self.changed.extend(other.changed);
        self.removed.extend(other.removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at_version(v: u64) -> Reservation {
        Reservation {
            id: Ulid::from_parts(1, 1),
            resource_id: Ulid::from_parts(1, 2),
            stay: Stay::new(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(),
            ),
            status: ReservationStatus::Confirmed,
            version: Version(v),
            payment: Payment::unpaid(),
            details: BookingDetails {
                guest_name: format!("guest v{v}"),
                ..BookingDetails::default()
            },
        }
    }

    #[test]
    fn older_version_is_ignored_newer_wins() {
        let mut store = EntityStore::new();
        assert_eq!(merge_entity(&mut store, Entity::Reservation(at_version(5))), MergeOutcome::Inserted);

        assert_eq!(merge_entity(&mut store, Entity::Reservation(at_version(4))), MergeOutcome::Stale);
        assert_eq!(store.reservation(&at_version(5).id), Some(&at_version(5)));

        assert_eq!(merge_entity(&mut store, Entity::Reservation(at_version(6))), MergeOutcome::Replaced);
        assert_eq!(store.reservation(&at_version(6).id), Some(&at_version(6)));
    }

    #[test]
    fn equal_version_replaces() {
        let mut store = EntityStore::new();
        merge_entity(&mut store, Entity::Reservation(at_version(5)));
        let mut same = at_version(5);
        same.details.notes = Some("late arrival".into());
        assert_eq!(merge_entity(&mut store, Entity::Reservation(same.clone())), MergeOutcome::Replaced);
        assert_eq!(store.reservation(&same.id), Some(&same));
    }

    #[test]
    fn remove_reports_presence() {
        let mut store = EntityStore::new();
        let r = at_version(1);
        merge_entity(&mut store, Entity::Reservation(r.clone()));
        assert!(remove_entity(&mut store, &EntityKey::Reservation(r.id)));
        assert!(!remove_entity(&mut store, &EntityKey::Reservation(r.id)));
    }

    #[test]
    fn report_tallies() {
        let mut report = ReconcileReport::default();
        let id = Ulid::new();
        report.record(id, MergeOutcome::Inserted);
        report.record(id, MergeOutcome::Stale);
        report.record(id, MergeOutcome::Deferred);
        assert_eq!((report.inserted, report.stale, report.deferred), (1, 1, 1));
        assert_eq!(report.changed, vec![id]);
        assert!(!report.is_noop());
        assert!(ReconcileReport::default().is_noop());
    }
}
