use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type ResourceId = Ulid;
pub type ReservationId = Ulid;

/// Optimistic-concurrency token handed out by the backend. Higher wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Half-open day interval `[start, end)`. `end` is the checkout day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// Same length, moved by `days` (negative moves earlier).
    pub fn shifted(&self, days: i64) -> Stay {
        Stay {
            start: add_days(self.start, days),
            end: add_days(self.end, days),
        }
    }

    /// Same length, starting on `start`.
    pub fn starting_on(&self, start: NaiveDate) -> Stay {
        Stay {
            start,
            end: add_days(start, self.nights()),
        }
    }
}

impl std::fmt::Display for Stay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Saturating day arithmetic; the calendar never reaches chrono's limits in practice.
pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    let magnitude = Days::new(days.unsigned_abs());
    let moved = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    moved.unwrap_or(if days >= 0 { NaiveDate::MAX } else { NaiveDate::MIN })
}

/// Which bound of a stay a resize moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Tentative,
    Confirmed,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    /// Cancelled reservations are retained but never block a resource.
    pub fn blocks(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Tentative => "tentative",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::CheckedIn => "checked-in",
            ReservationStatus::CheckedOut => "checked-out",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub paid: bool,
    pub paid_on: Option<NaiveDate>,
    pub method: Option<String>,
}

impl Payment {
    pub fn unpaid() -> Self {
        Self::default()
    }

    pub fn paid(on: NaiveDate, method: impl Into<String>) -> Self {
        Self {
            paid: true,
            paid_on: Some(on),
            method: Some(method.into()),
        }
    }
}

/// Denormalized fields shown on the bar. The backend owns the real guest record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub reference: String,
    pub guest_name: String,
    pub guests: u32,
    /// Server-computed, in cents.
    pub total_cents: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub stay: Stay,
    pub status: ReservationStatus,
    pub version: Version,
    pub payment: Payment,
    pub details: BookingDetails,
}

impl Reservation {
    pub fn blocks(&self) -> bool {
        self.status.blocks()
    }
}

/// Everything the client supplies for a new reservation; id and version come from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub resource_id: ResourceId,
    pub stay: Stay,
    pub status: ReservationStatus,
    pub payment: Payment,
    pub details: BookingDetails,
}

impl ReservationDraft {
    pub fn new(resource_id: ResourceId, stay: Stay, details: BookingDetails) -> Self {
        Self {
            resource_id,
            stay,
            status: ReservationStatus::Confirmed,
            payment: Payment::unpaid(),
            details,
        }
    }

    pub fn into_reservation(self, id: ReservationId, version: Version) -> Reservation {
        Reservation {
            id,
            resource_id: self.resource_id,
            stay: self.stay,
            status: self.status,
            version,
            payment: self.payment,
            details: self.details,
        }
    }
}

/// Field-level update. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPatch {
    pub resource_id: Option<ResourceId>,
    pub stay: Option<Stay>,
    pub status: Option<ReservationStatus>,
    pub payment: Option<Payment>,
    pub details: Option<BookingDetails>,
}

impl ReservationPatch {
    pub fn placement(resource_id: ResourceId, stay: Stay) -> Self {
        Self {
            resource_id: Some(resource_id),
            stay: Some(stay),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resource_id.is_none()
            && self.stay.is_none()
            && self.status.is_none()
            && self.payment.is_none()
            && self.details.is_none()
    }

    /// The patched copy keeps the version of `base`: it is the token the backend must match.
    pub fn apply_to(&self, base: &Reservation) -> Reservation {
        let mut next = base.clone();
        if let Some(resource_id) = self.resource_id {
            next.resource_id = resource_id;
        }
        if let Some(stay) = self.stay {
            next.stay = stay;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(ref payment) = self.payment {
            next.payment = payment.clone();
        }
        if let Some(ref details) = self.details {
            next.details = details.clone();
        }
        next
    }
}

/// A row on the chart (e.g. a room).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub building: Option<String>,
    pub location: Option<String>,
    /// Row order; ties break on name.
    pub position: u32,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Resource,
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    Resource(ResourceId),
    Reservation(ReservationId),
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: Ulid) -> Self {
        match kind {
            EntityKind::Resource => EntityKey::Resource(id),
            EntityKind::Reservation => EntityKey::Reservation(id),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::Resource(_) => EntityKind::Resource,
            EntityKey::Reservation(_) => EntityKind::Reservation,
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            EntityKey::Resource(id) | EntityKey::Reservation(id) => *id,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Resource(id) => write!(f, "resource {id}"),
            EntityKey::Reservation(id) => write!(f, "reservation {id}"),
        }
    }
}

/// Anything the store holds. Commands snapshot these whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    Resource(Resource),
    Reservation(Reservation),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Resource(r) => EntityKey::Resource(r.id),
            Entity::Reservation(r) => EntityKey::Reservation(r.id),
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Entity::Resource(r) => r.version,
            Entity::Reservation(r) => r.version,
        }
    }

    pub fn as_reservation(&self) -> Option<&Reservation> {
        match self {
            Entity::Reservation(r) => Some(r),
            Entity::Resource(_) => None,
        }
    }
}

// ── Sync wire types ──────────────────────────────────────────────

/// Opaque "last confirmed backend state point".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCursor(pub u64);

impl SyncCursor {
    /// Polling from here returns the full dataset.
    pub const ORIGIN: SyncCursor = SyncCursor(0);
}

/// Response to "changes since cursor".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entities: Vec<Entity>,
    pub removed: Vec<EntityKey>,
    pub cursor: SyncCursor,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PushAction {
    Insert,
    Update,
    Delete,
}

/// Change notification from the backend: only identifies what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "table")]
    pub kind: EntityKind,
    pub action: PushAction,
    pub id: Ulid,
}

impl PushEvent {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id)
    }

    /// Parse a NOTIFY-style JSON payload, e.g.
    /// `{"table":"reservation","action":"UPDATE","id":"01J..."}`.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, day).unwrap()
    }

    fn reservation(stay: Stay) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            stay,
            status: ReservationStatus::Confirmed,
            version: Version(3),
            payment: Payment::unpaid(),
            details: BookingDetails {
                reference: "R-1".into(),
                guest_name: "Meyer".into(),
                guests: 2,
                total_cents: Some(24_000),
                notes: None,
            },
        }
    }

    #[test]
    fn stay_basics() {
        let s = Stay::new(d(6, 1), d(6, 5));
        assert_eq!(s.nights(), 4);
        assert!(s.contains_day(d(6, 1)));
        assert!(s.contains_day(d(6, 4)));
        assert!(!s.contains_day(d(6, 5))); // half-open
    }

    #[test]
    fn stay_overlap() {
        let a = Stay::new(d(6, 1), d(6, 5));
        let b = Stay::new(d(6, 3), d(6, 8));
        let c = Stay::new(d(6, 5), d(6, 10));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn stay_shift_keeps_length() {
        let s = Stay::new(d(6, 10), d(6, 15));
        assert_eq!(s.shifted(10), Stay::new(d(6, 20), d(6, 25)));
        assert_eq!(s.shifted(-9), Stay::new(d(6, 1), d(6, 6)));
        assert_eq!(s.starting_on(d(7, 30)), Stay::new(d(7, 30), d(8, 4)));
    }

    #[test]
    fn invalid_stay_detected() {
        let s = Stay { start: d(6, 5), end: d(6, 5) };
        assert!(!s.is_valid());
    }

    #[test]
    fn cancelled_does_not_block() {
        assert!(ReservationStatus::Confirmed.blocks());
        assert!(ReservationStatus::CheckedIn.blocks());
        assert!(!ReservationStatus::Cancelled.blocks());
    }

    #[test]
    fn patch_touches_only_named_fields() {
        let base = reservation(Stay::new(d(6, 1), d(6, 5)));
        let patch = ReservationPatch {
            status: Some(ReservationStatus::CheckedIn),
            ..Default::default()
        };
        let next = patch.apply_to(&base);
        assert_eq!(next.status, ReservationStatus::CheckedIn);
        assert_eq!(next.stay, base.stay);
        assert_eq!(next.details, base.details);
        assert_eq!(next.version, base.version);
        assert!(ReservationPatch::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn entity_key_roundtrip() {
        let r = reservation(Stay::new(d(6, 1), d(6, 5)));
        let e = Entity::Reservation(r.clone());
        assert_eq!(e.key(), EntityKey::Reservation(r.id));
        assert_eq!(e.key().kind(), EntityKind::Reservation);
        assert_eq!(e.version(), Version(3));
        assert_eq!(EntityKey::new(EntityKind::Reservation, r.id), e.key());
    }

    #[test]
    fn push_event_parses_notify_payload() {
        let id = Ulid::new();
        let payload = format!(r#"{{"table":"reservation","action":"UPDATE","id":"{id}"}}"#);
        let event = PushEvent::from_json(&payload).unwrap();
        assert_eq!(event.kind, EntityKind::Reservation);
        assert_eq!(event.action, PushAction::Update);
        assert_eq!(event.key(), EntityKey::Reservation(id));
        assert!(PushEvent::from_json(r#"{"table":"guest","action":"UPDATE","id":"x"}"#).is_err());
    }

    #[test]
    fn version_ordering() {
        assert!(Version(6) > Version(5));
        assert_eq!(Version(5).next(), Version(6));
        assert_eq!(Version::INITIAL.to_string(), "v0");
    }
}
