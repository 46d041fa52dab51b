//! The authoritative collaborator the chart talks to.

mod memory;

pub use memory::{MemoryBackend, RecordedCall};

use async_trait::async_trait;
use futures::stream::BoxStream;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The expected version no longer matches the stored one.
    VersionConflict,
    /// The placement overlaps a reservation the backend already holds.
    DoubleBooking,
    NotFound,
    /// Validation failure on the backend side; the message is meant for the operator.
    Rejected(String),
    Unavailable(String),
    Timeout,
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::VersionConflict => write!(f, "version conflict"),
            BackendError::DoubleBooking => write!(f, "resource already booked for these dates"),
            BackendError::NotFound => write!(f, "record not found"),
            BackendError::Rejected(msg) => write!(f, "{msg}"),
            BackendError::Unavailable(msg) => write!(f, "backend unavailable: {msg}"),
            BackendError::Timeout => write!(f, "backend call timed out"),
        }
    }
}

impl std::error::Error for BackendError {}

/// One item of the push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSignal {
    Event(PushEvent),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_reservation(&self, draft: ReservationDraft) -> Result<Reservation, BackendError>;

    /// `expected` is the version the client last saw; a mismatch is a `VersionConflict`.
    async fn update_reservation(
        &self,
        reservation: Reservation,
        expected: Version,
    ) -> Result<Reservation, BackendError>;

    async fn delete_reservation(&self, id: ReservationId, expected: Version) -> Result<(), BackendError>;

    async fn fetch(&self, kind: EntityKind, id: Ulid) -> Result<Option<Entity>, BackendError>;

    /// Everything changed after `cursor`. From [`SyncCursor::ORIGIN`] this is the full dataset.
    async fn changes_since(&self, cursor: SyncCursor) -> Result<ChangeSet, BackendError>;

    /// Change notifications. The stream ends if the backend drops the feed.
    fn subscribe(&self) -> BoxStream<'static, PushSignal>;
}
