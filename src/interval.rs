//! Pure placement geometry: overlap, conflict search, pixel snapping.

use serde::{Deserialize, Serialize};

use crate::model::*;

/// Where a reservation would sit: a row and a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub resource_id: ResourceId,
    pub stay: Stay,
}

impl Placement {
    pub fn new(resource_id: ResourceId, stay: Stay) -> Self {
        Self { resource_id, stay }
    }

    pub fn of(reservation: &Reservation) -> Self {
        Self {
            resource_id: reservation.resource_id,
            stay: reservation.stay,
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.stay, self.resource_id)
    }
}

/// Half-open overlap; touching stays (`a.end == b.start`) never overlap.
pub fn overlaps(a: &Stay, b: &Stay) -> bool {
    a.overlaps(b)
}

/// Reservations that block `candidate`: same resource, not cancelled, not `exclude`,
/// overlapping. Returned in start order.
pub fn find_conflicts<'a, I>(
    candidate: &Placement,
    existing: I,
    exclude: Option<ReservationId>,
) -> Vec<ReservationId>
where
    I: IntoIterator<Item = &'a Reservation>,
{
    let mut hits: Vec<&Reservation> = existing
        .into_iter()
        .filter(|r| r.resource_id == candidate.resource_id)
        .filter(|r| r.blocks())
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| overlaps(&r.stay, &candidate.stay))
        .collect();
    hits.sort_by_key(|r| (r.stay.start, r.id));
    hits.into_iter().map(|r| r.id).collect()
}

/// Quantize a horizontal pointer offset to whole days, rounding to the nearest day.
pub fn snap_to_grid(pixel_offset: f64, cell_width: f64) -> i64 {
    if !pixel_offset.is_finite() || !cell_width.is_finite() || cell_width <= 0.0 {
        return 0;
    }
    (pixel_offset / cell_width).round() as i64
}
