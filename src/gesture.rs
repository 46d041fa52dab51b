//! Pointer gestures on the chart: drag a bar, resize one of its edges, or sweep over
//! empty cells to propose a new booking.
//!
//! Nothing is mutated until release. A release that is blocked, off the grid or back
//! where it started is a cancellation and leaves the store and history untouched.

use chrono::NaiveDate;
use tracing::debug;

use crate::chart::{Chart, MutationError};
use crate::grid::{Pointer, TimelineGrid};
use crate::interval::{Placement, snap_to_grid};
use crate::limits::{MIN_STAY_NIGHTS, RESIZE_HANDLE_WIDTH_PX};
use crate::model::*;
use crate::observability;

/// Public view of the controller's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureState {
    Idle,
    Dragging,
    Resizing(Edge),
    Creating,
}

/// Live result of the last pointer position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    /// `None` while the pointer is off the grid.
    pub candidate: Option<Placement>,
    pub conflicts: Vec<ReservationId>,
}

impl Feedback {
    fn at(candidate: Option<Placement>, conflicts: Vec<ReservationId>) -> Self {
        Self {
            candidate,
            conflicts,
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn is_off_grid(&self) -> bool {
        self.candidate.is_none()
    }
}

/// A swept range of empty cells. Turning it into a draft is the booking dialog's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateProposal {
    pub resource_id: ResourceId,
    pub stay: Stay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    Blocked { conflicts: Vec<ReservationId> },
    OffGrid,
    Unchanged,
    Aborted,
}

impl CancelReason {
    fn label(&self) -> &'static str {
        match self {
            CancelReason::Blocked { .. } => "blocked",
            CancelReason::OffGrid => "off_grid",
            CancelReason::Unchanged => "unchanged",
            CancelReason::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GestureOutcome {
    Moved(Reservation),
    Resized(Reservation),
    Proposed(CreateProposal),
    Cancelled(CancelReason),
}

#[derive(Debug)]
pub enum GestureError {
    /// A gesture is already in progress.
    Busy,
    /// No gesture to move or release.
    Idle,
    UnknownReservation(ReservationId),
    /// The bar's row is not on the grid.
    NotShown(ReservationId),
    /// The press landed outside the bar and its resize handles.
    MissedBar(ReservationId),
    OffGrid,
    /// The backend refused the change; local state has been rolled back.
    Mutation(MutationError),
}

impl std::fmt::Display for GestureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GestureError::Busy => write!(f, "another gesture is in progress"),
            GestureError::Idle => write!(f, "no gesture in progress"),
            GestureError::UnknownReservation(id) => write!(f, "reservation not found: {id}"),
            GestureError::NotShown(id) => write!(f, "reservation {id} is not on the visible grid"),
            GestureError::MissedBar(id) => write!(f, "pointer is not on reservation {id}"),
            GestureError::OffGrid => write!(f, "pointer is outside the grid"),
            GestureError::Mutation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GestureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GestureError::Mutation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MutationError> for GestureError {
    fn from(e: MutationError) -> Self {
        GestureError::Mutation(e)
    }
}

enum Mode {
    Drag { reservation: Reservation },
    Resize { reservation: Reservation, edge: Edge },
    Create { resource_id: ResourceId, anchor: NaiveDate },
}

impl Mode {
    fn label(&self) -> &'static str {
        match self {
            Mode::Drag { .. } => "drag",
            Mode::Resize { .. } => "resize",
            Mode::Create { .. } => "create",
        }
    }
}

struct Active {
    mode: Mode,
    origin: Pointer,
    feedback: Feedback,
}

pub struct GestureController {
    chart: Chart,
    grid: TimelineGrid,
    handle_width: f64,
    active: Option<Active>,
}

impl GestureController {
    pub fn new(chart: Chart, grid: TimelineGrid) -> Self {
        Self {
            chart,
            grid,
            handle_width: RESIZE_HANDLE_WIDTH_PX,
            active: None,
        }
    }

    pub fn with_handle_width(mut self, px: f64) -> Self {
        self.handle_width = px.max(0.0);
        self
    }

    pub fn grid(&self) -> &TimelineGrid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut TimelineGrid {
        &mut self.grid
    }

    pub fn state(&self) -> GestureState {
        match &self.active {
            None => GestureState::Idle,
            Some(active) => match active.mode {
                Mode::Drag { .. } => GestureState::Dragging,
                Mode::Resize { edge, .. } => GestureState::Resizing(edge),
                Mode::Create { .. } => GestureState::Creating,
            },
        }
    }

    pub fn feedback(&self) -> Option<&Feedback> {
        self.active.as_ref().map(|a| &a.feedback)
    }

    /// Start a drag, or a resize if `at` is within half a handle of either edge.
    /// The start edge wins when both are in reach.
    pub fn pointer_down_on_bar(&mut self, id: ReservationId, at: Pointer) -> Result<GestureState, GestureError> {
        if self.active.is_some() {
            return Err(GestureError::Busy);
        }
        let reservation = self
            .chart
            .reservation(&id)
            .ok_or(GestureError::UnknownReservation(id))?;
        let bounds = self.grid.bar_bounds(&reservation).ok_or(GestureError::NotShown(id))?;

        let reach = self.handle_width / 2.0;
        if !bounds.widened(reach).contains(at) {
            return Err(GestureError::MissedBar(id));
        }
        let edge = if (at.x - bounds.left).abs() <= reach {
            Some(Edge::Start)
        } else if (at.x - bounds.right).abs() <= reach {
            Some(Edge::End)
        } else {
            None
        };

        let feedback = Feedback::at(Some(Placement::of(&reservation)), Vec::new());
        let mode = match edge {
            Some(edge) => Mode::Resize { reservation, edge },
            None => Mode::Drag { reservation },
        };
        debug!("{} started on {id}", mode.label());
        self.active = Some(Active {
            mode,
            origin: at,
            feedback,
        });
        Ok(self.state())
    }

    /// Start sweeping out a new booking from the cell under `at`.
    pub fn pointer_down_on_cell(&mut self, at: Pointer) -> Result<GestureState, GestureError> {
        if self.active.is_some() {
            return Err(GestureError::Busy);
        }
        let resource_id = self.grid.row_at(at.y).ok_or(GestureError::OffGrid)?;
        let anchor = self.grid.day_at(at.x).ok_or(GestureError::OffGrid)?;
        let mode = Mode::Create { resource_id, anchor };
        let feedback = self.evaluate(&mode, at, at);
        self.active = Some(Active {
            mode,
            origin: at,
            feedback,
        });
        Ok(self.state())
    }

    pub fn pointer_move(&mut self, at: Pointer) -> Result<Feedback, GestureError> {
        let active = self.active.as_ref().ok_or(GestureError::Idle)?;
        let feedback = self.evaluate(&active.mode, active.origin, at);
        if let Some(active) = self.active.as_mut() {
            if active.feedback.is_blocked() != feedback.is_blocked() {
                debug!(
                    "{} {}",
                    active.mode.label(),
                    if feedback.is_blocked() { "blocked" } else { "clear" }
                );
            }
            active.feedback = feedback.clone();
        }
        Ok(feedback)
    }

    /// Finish the gesture. Commits through the chart only for a clear, changed
    /// candidate; everything else comes back as `Cancelled`.
    pub async fn pointer_up(&mut self, at: Pointer) -> Result<GestureOutcome, GestureError> {
        self.pointer_move(at)?;
        let active = self.active.take().ok_or(GestureError::Idle)?;
        let label = active.mode.label();
        let result = self.finish(active).await;
        let outcome = match &result {
            Ok(GestureOutcome::Cancelled(reason)) => reason.label(),
            Ok(_) => "committed",
            Err(_) => "failed",
        };
        metrics::counter!(observability::GESTURES_TOTAL, "kind" => label, "outcome" => outcome).increment(1);
        result
    }

    /// Escape: back to idle, nothing applied.
    pub fn cancel(&mut self) -> Option<GestureOutcome> {
        let active = self.active.take()?;
        debug!("{} aborted", active.mode.label());
        metrics::counter!(observability::GESTURES_TOTAL, "kind" => active.mode.label(), "outcome" => "aborted")
            .increment(1);
        Some(GestureOutcome::Cancelled(CancelReason::Aborted))
    }

    async fn finish(&self, active: Active) -> Result<GestureOutcome, GestureError> {
        let Feedback {
            candidate,
            conflicts,
        } = active.feedback;
        let Some(candidate) = candidate else {
            return Ok(GestureOutcome::Cancelled(CancelReason::OffGrid));
        };
        if !conflicts.is_empty() {
            return Ok(GestureOutcome::Cancelled(CancelReason::Blocked { conflicts }));
        }

        let committed = match active.mode {
            Mode::Create { .. } => {
                return Ok(GestureOutcome::Proposed(CreateProposal {
                    resource_id: candidate.resource_id,
                    stay: candidate.stay,
                }));
            }
            Mode::Drag { reservation } => {
                if candidate == Placement::of(&reservation) {
                    return Ok(GestureOutcome::Cancelled(CancelReason::Unchanged));
                }
                self.chart
                    .place_reservation(reservation.id, candidate)
                    .await
                    .map(GestureOutcome::Moved)
            }
            Mode::Resize { reservation, edge } => {
                if candidate == Placement::of(&reservation) {
                    return Ok(GestureOutcome::Cancelled(CancelReason::Unchanged));
                }
                let date = match edge {
                    Edge::Start => candidate.stay.start,
                    Edge::End => candidate.stay.end,
                };
                self.chart
                    .resize_reservation(reservation.id, edge, date)
                    .await
                    .map(GestureOutcome::Resized)
            }
        };

        match committed {
            Ok(outcome) => Ok(outcome),
            // Someone else took the slot between the last move and release.
            Err(MutationError::ValidationConflict { conflicts, .. }) => {
                Ok(GestureOutcome::Cancelled(CancelReason::Blocked { conflicts }))
            }
            Err(e) => Err(GestureError::Mutation(e)),
        }
    }

    /// Candidate and conflicts for the pointer at `at`, given where it went down.
    fn evaluate(&self, mode: &Mode, origin: Pointer, at: Pointer) -> Feedback {
        if !self.grid.contains(at) {
            return Feedback::at(None, Vec::new());
        }
        let delta = snap_to_grid(at.x - origin.x, self.grid.cell_width());

        let (candidate, exclude, checked) = match mode {
            Mode::Drag { reservation } => {
                let Some(resource_id) = self.grid.row_at(at.y) else {
                    return Feedback::at(None, Vec::new());
                };
                let candidate = Placement::new(resource_id, reservation.stay.shifted(delta));
                (candidate, Some(reservation.id), reservation.blocks())
            }
            Mode::Resize { reservation, edge } => {
                let stay = resized(&reservation.stay, *edge, delta);
                let candidate = Placement::new(reservation.resource_id, stay);
                (candidate, Some(reservation.id), reservation.blocks())
            }
            Mode::Create { resource_id, anchor } => {
                let Some(day) = self.grid.day_at(at.x) else {
                    return Feedback::at(None, Vec::new());
                };
                let first = (*anchor).min(day);
                let last = (*anchor).max(day);
                let candidate = Placement::new(*resource_id, Stay::new(first, add_days(last, 1)));
                (candidate, None, true)
            }
        };

        let conflicts = if checked {
            self.chart.find_conflicts(&candidate, exclude)
        } else {
            Vec::new()
        };
        Feedback::at(Some(candidate), conflicts)
    }
}

/// Move one bound by `delta` days, never below the minimum stay.
fn resized(stay: &Stay, edge: Edge, delta: i64) -> Stay {
    match edge {
        Edge::Start => {
            let latest = add_days(stay.end, -MIN_STAY_NIGHTS);
            Stay {
                start: add_days(stay.start, delta).min(latest),
                end: stay.end,
            }
        }
        Edge::End => {
            let earliest = add_days(stay.start, MIN_STAY_NIGHTS);
            Stay {
                start: stay.start,
                end: add_days(stay.end, delta).max(earliest),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    #[test]
    fn resize_clamps_to_one_night() {
        let stay = Stay::new(d(10), d(13));
        assert_eq!(resized(&stay, Edge::Start, 1), Stay::new(d(11), d(13)));
        assert_eq!(resized(&stay, Edge::Start, 5), Stay::new(d(12), d(13)));
        assert_eq!(resized(&stay, Edge::Start, -2), Stay::new(d(8), d(13)));
        assert_eq!(resized(&stay, Edge::End, -7), Stay::new(d(10), d(11)));
        assert_eq!(resized(&stay, Edge::End, 2), Stay::new(d(10), d(15)));
    }

    #[test]
    fn feedback_flags() {
        let f = Feedback::at(None, Vec::new());
        assert!(f.is_off_grid());
        assert!(!f.is_blocked());
    }
}
