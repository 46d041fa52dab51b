//! Timeline geometry: which row and day sit under a pointer, and where a bar is drawn.

use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Density {
    Compact,
    #[default]
    Comfortable,
    Spacious,
}

impl Density {
    pub fn cell_width(&self) -> f64 {
        match self {
            Density::Compact => 80.0,
            Density::Comfortable => 120.0,
            Density::Spacious => 160.0,
        }
    }

    pub fn row_height(&self) -> f64 {
        match self {
            Density::Compact => 60.0,
            Density::Comfortable => 80.0,
            Density::Spacious => 100.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Density::Compact => "compact",
            Density::Comfortable => "comfortable",
            Density::Spacious => "spacious",
        }
    }
}

impl FromStr for Density {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Density::Compact),
            "comfortable" => Ok(Density::Comfortable),
            "spacious" => Ok(Density::Spacious),
            other => Err(format!("unknown density: {other}")),
        }
    }
}

/// Pointer position in grid coordinates (origin at the first day of the first row).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
}

impl Pointer {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarBounds {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl BarBounds {
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn contains(&self, p: Pointer) -> bool {
        p.x >= self.left && p.x < self.right && p.y >= self.top && p.y < self.bottom
    }

    /// Grown by `dx` on both sides; the row band is unchanged.
    pub fn widened(&self, dx: f64) -> Self {
        Self {
            left: self.left - dx,
            right: self.right + dx,
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineGrid {
    origin: NaiveDate,
    days: u32,
    cell_width: f64,
    row_height: f64,
    rows: Vec<ResourceId>,
}

impl TimelineGrid {
    pub fn new(origin: NaiveDate, days: u32, density: Density, rows: Vec<ResourceId>) -> Self {
        Self {
            origin,
            days,
            cell_width: density.cell_width(),
            row_height: density.row_height(),
            rows,
        }
    }

    /// Rows in the store's display order.
    pub fn from_store(origin: NaiveDate, days: u32, density: Density, store: &EntityStore) -> Self {
        let rows = store.resources_sorted().iter().map(|r| r.id).collect();
        Self::new(origin, days, density, rows)
    }

    pub fn set_rows(&mut self, rows: Vec<ResourceId>) {
        self.rows = rows;
    }

    pub fn set_density(&mut self, density: Density) {
        self.cell_width = density.cell_width();
        self.row_height = density.row_height();
    }

    pub fn origin(&self) -> NaiveDate {
        self.origin
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn cell_width(&self) -> f64 {
        self.cell_width
    }

    pub fn row_height(&self) -> f64 {
        self.row_height
    }

    pub fn rows(&self) -> &[ResourceId] {
        &self.rows
    }

    fn width(&self) -> f64 {
        f64::from(self.days) * self.cell_width
    }

    fn height(&self) -> f64 {
        self.rows.len() as f64 * self.row_height
    }

    pub fn contains(&self, p: Pointer) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x < self.width() && p.y < self.height()
    }

    /// The row under `y`, or `None` above or below the grid.
    pub fn row_at(&self, y: f64) -> Option<ResourceId> {
        if !y.is_finite() || y < 0.0 {
            return None;
        }
        let index = (y / self.row_height).floor() as usize;
        self.rows.get(index).copied()
    }

    pub fn row_index(&self, resource_id: &ResourceId) -> Option<usize> {
        self.rows.iter().position(|r| r == resource_id)
    }

    /// The day under `x`, or `None` left or right of the visible range.
    pub fn day_at(&self, x: f64) -> Option<NaiveDate> {
        if !x.is_finite() || x < 0.0 || x >= self.width() {
            return None;
        }
        let offset = (x / self.cell_width).floor() as i64;
        Some(add_days(self.origin, offset))
    }

    /// Left edge of `date`'s column; negative before the origin.
    pub fn x_of(&self, date: NaiveDate) -> f64 {
        (date - self.origin).num_days() as f64 * self.cell_width
    }

    /// Where a reservation's bar is drawn; `None` if its row is not shown.
    pub fn bar_bounds(&self, reservation: &Reservation) -> Option<BarBounds> {
        let index = self.row_index(&reservation.resource_id)?;
        let top = index as f64 * self.row_height;
        Some(BarBounds {
            left: self.x_of(reservation.stay.start),
            right: self.x_of(reservation.stay.end),
            top,
            bottom: top + self.row_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn grid(rows: usize) -> (TimelineGrid, Vec<ResourceId>) {
        let ids: Vec<ResourceId> = (0..rows).map(|_| Ulid::new()).collect();
        (TimelineGrid::new(d(1), 30, Density::Comfortable, ids.clone()), ids)
    }

    #[test]
    fn density_presets() {
        assert_eq!(Density::Compact.cell_width(), 80.0);
        assert_eq!(Density::Comfortable.cell_width(), 120.0);
        assert_eq!(Density::Spacious.cell_width(), 160.0);
        assert_eq!("Spacious".parse::<Density>(), Ok(Density::Spacious));
        assert!("huge".parse::<Density>().is_err());
    }

    #[test]
    fn row_lookup() {
        let (g, ids) = grid(3);
        assert_eq!(g.row_at(0.0), Some(ids[0]));
        assert_eq!(g.row_at(79.9), Some(ids[0]));
        assert_eq!(g.row_at(80.0), Some(ids[1]));
        assert_eq!(g.row_at(239.0), Some(ids[2]));
        assert_eq!(g.row_at(240.0), None);
        assert_eq!(g.row_at(-1.0), None);
    }

    #[test]
    fn day_lookup() {
        let (g, _) = grid(1);
        assert_eq!(g.day_at(0.0), Some(d(1)));
        assert_eq!(g.day_at(119.0), Some(d(1)));
        assert_eq!(g.day_at(120.0), Some(d(2)));
        assert_eq!(g.day_at(-0.5), None);
        assert_eq!(g.day_at(30.0 * 120.0), None);
    }

    #[test]
    fn bar_bounds_follow_stay() {
        let (g, ids) = grid(2);
        let r = Reservation {
            id: Ulid::new(),
            resource_id: ids[1],
            stay: Stay::new(d(3), d(6)),
            status: ReservationStatus::Confirmed,
            version: Version(1),
            payment: Payment::unpaid(),
            details: BookingDetails::default(),
        };
        let bounds = g.bar_bounds(&r).unwrap();
        assert_eq!(bounds.left, 240.0);
        assert_eq!(bounds.right, 600.0);
        assert_eq!(bounds.width(), 360.0);
        assert_eq!((bounds.top, bounds.bottom), (80.0, 160.0));
        assert!(bounds.contains(Pointer::new(300.0, 100.0)));
        assert!(!bounds.contains(Pointer::new(600.0, 100.0)));
        assert!(bounds.widened(15.0).contains(Pointer::new(610.0, 100.0)));
        assert!(!bounds.widened(15.0).contains(Pointer::new(300.0, 170.0)));

        let hidden = Reservation { resource_id: Ulid::new(), ..r };
        assert!(g.bar_bounds(&hidden).is_none());
    }

    #[test]
    fn x_of_before_origin_is_negative() {
        let (g, _) = grid(1);
        assert_eq!(g.x_of(NaiveDate::from_ymd_opt(2025, 5, 31).unwrap()), -120.0);
    }
}
