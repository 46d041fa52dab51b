use crate::interval::Placement;
use crate::model::*;

/// The change a mutation tried to make. Carried by every error so the message can
/// name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Create { placement: Placement },
    Move { placement: Placement },
    Resize { edge: Edge, stay: Stay },
    Update,
    Status { to: ReservationStatus },
    Payment { paid: bool },
    Delete,
}

impl Attempt {
    /// Short label, used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Attempt::Create { .. } => "create",
            Attempt::Move { .. } => "move",
            Attempt::Resize { .. } => "resize",
            Attempt::Update => "update",
            Attempt::Status { .. } => "status",
            Attempt::Payment { .. } => "payment",
            Attempt::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Create { placement } => write!(f, "create {placement}"),
            Attempt::Move { placement } => write!(f, "move to {placement}"),
            Attempt::Resize { edge: Edge::Start, stay } => write!(f, "move check-in, giving {stay}"),
            Attempt::Resize { edge: Edge::End, stay } => write!(f, "move check-out, giving {stay}"),
            Attempt::Update => write!(f, "update"),
            Attempt::Status { to } => write!(f, "set status to {}", to.label()),
            Attempt::Payment { paid: true } => write!(f, "mark as paid"),
            Attempt::Payment { paid: false } => write!(f, "mark as unpaid"),
            Attempt::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Rejected locally before any backend call; nothing to roll back.
    ValidationConflict {
        reservation_id: ReservationId,
        attempted: Placement,
        conflicts: Vec<ReservationId>,
    },
    InvalidStay {
        reservation_id: ReservationId,
        stay: Stay,
    },
    UnknownResource {
        reservation_id: ReservationId,
        resource_id: ResourceId,
    },
    NotFound(ReservationId),
    /// The backend holds a newer version. Rolled back; reload and retry.
    StaleData {
        reservation_id: ReservationId,
        attempt: Attempt,
    },
    /// Someone else booked the same dates first. Rolled back.
    DoubleBooking {
        reservation_id: ReservationId,
        attempt: Attempt,
    },
    /// Any other backend refusal. Rolled back; `message` is the backend's own.
    Backend {
        reservation_id: ReservationId,
        attempt: Attempt,
        message: String,
    },
}

impl MutationError {
    pub fn reservation_id(&self) -> ReservationId {
        match self {
            MutationError::ValidationConflict { reservation_id, .. }
            | MutationError::InvalidStay { reservation_id, .. }
            | MutationError::UnknownResource { reservation_id, .. }
            | MutationError::StaleData { reservation_id, .. }
            | MutationError::DoubleBooking { reservation_id, .. }
            | MutationError::Backend { reservation_id, .. } => *reservation_id,
            MutationError::NotFound(id) => *id,
        }
    }

    /// True if the optimistic change was applied and then undone.
    pub fn rolled_back(&self) -> bool {
        matches!(
            self,
            MutationError::StaleData { .. }
                | MutationError::DoubleBooking { .. }
                | MutationError::Backend { .. }
        )
    }
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::ValidationConflict {
                reservation_id,
                attempted,
                conflicts,
            } => {
                write!(
                    f,
                    "cannot place reservation {reservation_id} at {attempted}: overlaps {conflicts:?}"
                )
            }
            MutationError::InvalidStay { reservation_id, stay } => {
                write!(f, "invalid stay {stay} for reservation {reservation_id}: check-out must follow check-in")
            }
            MutationError::UnknownResource {
                reservation_id,
                resource_id,
            } => write!(f, "reservation {reservation_id}: unknown room {resource_id}"),
            MutationError::NotFound(id) => write!(f, "reservation not found: {id}"),
            MutationError::StaleData {
                reservation_id,
                attempt,
            } => write!(
                f,
                "stale data: reservation {reservation_id} was changed elsewhere; reload and retry ({attempt})"
            ),
            MutationError::DoubleBooking {
                reservation_id,
                attempt,
            } => write!(
                f,
                "double booking: another reservation already holds these dates ({attempt}, reservation {reservation_id})"
            ),
            MutationError::Backend { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for MutationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[test]
    fn backend_message_is_verbatim() {
        let err = MutationError::Backend {
            reservation_id: Ulid::new(),
            attempt: Attempt::Delete,
            message: "Guest has unpaid invoices".into(),
        };
        assert_eq!(err.to_string(), "Guest has unpaid invoices");
        assert!(err.rolled_back());
    }

    #[test]
    fn stale_and_double_booking_have_distinct_messages() {
        let id = Ulid::new();
        let stay = Stay::new(
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(),
        );
        let attempt = Attempt::Resize { edge: Edge::End, stay };
        let stale = MutationError::StaleData { reservation_id: id, attempt: attempt.clone() };
        let double = MutationError::DoubleBooking { reservation_id: id, attempt };
        assert!(stale.to_string().starts_with("stale data"));
        assert!(stale.to_string().contains("retry"));
        assert!(double.to_string().starts_with("double booking"));
        assert_eq!(stale.reservation_id(), id);
    }

    #[test]
    fn validation_is_not_a_rollback() {
        let err = MutationError::NotFound(Ulid::new());
        assert!(!err.rolled_back());
        assert_eq!(Attempt::Payment { paid: true }.kind(), "payment");
    }
}
