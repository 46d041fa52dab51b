use std::collections::{BTreeSet, HashMap};

use crate::interval::{self, Placement};
use crate::model::*;

/// The in-memory projection of resources and reservations.
///
/// Every write goes through [`EntityStore::put`], which keeps the per-resource index
/// in step, so two stores holding the same entities compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityStore {
    resources: HashMap<ResourceId, Resource>,
    reservations: HashMap<ReservationId, Reservation>,
    /// Resource → reservations placed on it.
    on_resource: HashMap<ResourceId, BTreeSet<ReservationId>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Generic access ───────────────────────────────────────

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        match key {
            EntityKey::Resource(id) => self.resources.get(id).cloned().map(Entity::Resource),
            EntityKey::Reservation(id) => {
                self.reservations.get(id).cloned().map(Entity::Reservation)
            }
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        match key {
            EntityKey::Resource(id) => self.resources.contains_key(id),
            EntityKey::Reservation(id) => self.reservations.contains_key(id),
        }
    }

    pub fn version_of(&self, key: &EntityKey) -> Option<Version> {
        match key {
            EntityKey::Resource(id) => self.resources.get(id).map(|r| r.version),
            EntityKey::Reservation(id) => self.reservations.get(id).map(|r| r.version),
        }
    }

    /// Make `key` hold exactly `value` (`None` removes it). Returns what was there.
    pub fn put(&mut self, key: EntityKey, value: Option<Entity>) -> Option<Entity> {
        let previous = self.take(&key);
        if let Some(entity) = value {
            debug_assert_eq!(entity.key(), key, "entity stored under a foreign key");
            self.insert(entity);
        }
        previous
    }

    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        match entity {
            Entity::Resource(resource) => self
                .resources
                .insert(resource.id, resource)
                .map(Entity::Resource),
            Entity::Reservation(reservation) => {
                let previous = self.take(&EntityKey::Reservation(reservation.id));
                self.on_resource
                    .entry(reservation.resource_id)
                    .or_default()
                    .insert(reservation.id);
                self.reservations.insert(reservation.id, reservation);
                previous
            }
        }
    }

    pub fn take(&mut self, key: &EntityKey) -> Option<Entity> {
        match key {
            EntityKey::Resource(id) => self.resources.remove(id).map(Entity::Resource),
            EntityKey::Reservation(id) => {
                let reservation = self.reservations.remove(id)?;
                if let Some(ids) = self.on_resource.get_mut(&reservation.resource_id) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.on_resource.remove(&reservation.resource_id);
                    }
                }
                Some(Entity::Reservation(reservation))
            }
        }
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Reservations on one row, in start order.
    pub fn reservations_on(&self, resource_id: &ResourceId) -> Vec<&Reservation> {
        let mut list: Vec<&Reservation> = self
            .on_resource
            .get(resource_id)
            .map(|ids| ids.iter().filter_map(|id| self.reservations.get(id)).collect())
            .unwrap_or_default();
        list.sort_by_key(|r| (r.stay.start, r.id));
        list
    }

    pub fn find_conflicts(
        &self,
        candidate: &Placement,
        exclude: Option<ReservationId>,
    ) -> Vec<ReservationId> {
        interval::find_conflicts(candidate, self.reservations_on(&candidate.resource_id), exclude)
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn contains_resource(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Rows in display order.
    pub fn resources_sorted(&self) -> Vec<&Resource> {
        let mut list: Vec<&Resource> = self.resources.values().collect();
        list.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn room(name: &str, position: u32) -> Resource {
        Resource {
            id: Ulid::new(),
            name: name.into(),
            building: None,
            location: None,
            position,
            version: Version(1),
        }
    }

    fn booking(resource_id: ResourceId, start: u32, end: u32) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id,
            stay: Stay::new(d(start), d(end)),
            status: ReservationStatus::Confirmed,
            version: Version(1),
            payment: Payment::unpaid(),
            details: BookingDetails::default(),
        }
    }

    #[test]
    fn put_and_take_keep_index() {
        let mut store = EntityStore::new();
        let r = room("101", 1);
        let b = booking(r.id, 1, 5);
        store.insert(Entity::Resource(r.clone()));
        store.insert(Entity::Reservation(b.clone()));
        assert_eq!(store.reservations_on(&r.id).len(), 1);

        let taken = store.put(EntityKey::Reservation(b.id), None);
        assert_eq!(taken, Some(Entity::Reservation(b)));
        assert!(store.reservations_on(&r.id).is_empty());
    }

    #[test]
    fn moving_between_rows_updates_index() {
        let mut store = EntityStore::new();
        let a = room("101", 1);
        let b = room("102", 2);
        let mut x = booking(a.id, 1, 5);
        store.insert(Entity::Reservation(x.clone()));

        x.resource_id = b.id;
        store.put(EntityKey::Reservation(x.id), Some(Entity::Reservation(x.clone())));
        assert!(store.reservations_on(&a.id).is_empty());
        assert_eq!(store.reservations_on(&b.id)[0].id, x.id);
    }

    #[test]
    fn equal_content_compares_equal() {
        let r = room("101", 1);
        let x = booking(r.id, 1, 5);
        let y = booking(r.id, 6, 9);

        let mut one = EntityStore::new();
        one.insert(Entity::Resource(r.clone()));
        one.insert(Entity::Reservation(x.clone()));

        let mut two = one.clone();
        two.insert(Entity::Reservation(y.clone()));
        two.take(&EntityKey::Reservation(y.id));
        assert_eq!(one, two);
    }

    #[test]
    fn reservations_on_sorted_by_start() {
        let mut store = EntityStore::new();
        let r = room("101", 1);
        let late = booking(r.id, 10, 12);
        let early = booking(r.id, 1, 3);
        store.insert(Entity::Reservation(late.clone()));
        store.insert(Entity::Reservation(early.clone()));
        let ids: Vec<_> = store.reservations_on(&r.id).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[test]
    fn resources_sorted_by_position_then_name() {
        let mut store = EntityStore::new();
        store.insert(Entity::Resource(room("B", 2)));
        store.insert(Entity::Resource(room("Z", 1)));
        store.insert(Entity::Resource(room("A", 2)));
        let names: Vec<_> = store.resources_sorted().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["Z", "A", "B"]);
    }

    #[test]
    fn store_conflicts_use_index() {
        let mut store = EntityStore::new();
        let r = room("101", 1);
        let x = booking(r.id, 1, 5);
        store.insert(Entity::Reservation(x.clone()));
        let hit = Placement::new(r.id, Stay::new(d(4), d(6)));
        let touch = Placement::new(r.id, Stay::new(d(5), d(6)));
        assert_eq!(store.find_conflicts(&hit, None), vec![x.id]);
        assert!(store.find_conflicts(&touch, None).is_empty());
        assert!(store.find_conflicts(&hit, Some(x.id)).is_empty());
    }

    #[test]
    fn version_lookup() {
        let mut store = EntityStore::new();
        let r = room("101", 1);
        store.insert(Entity::Resource(r.clone()));
        assert_eq!(store.version_of(&EntityKey::Resource(r.id)), Some(Version(1)));
        assert_eq!(store.version_of(&EntityKey::Reservation(r.id)), None);
    }
}
