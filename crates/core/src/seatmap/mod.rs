//! Per-course seat grids.
//!
//! A classroom is a fixed rows x seats-per-row grid addressed by
//! [`SeatLabel`]. `pick_lowest_free` scans in row-major order, which defines
//! the canonical "any seat" policy.

use dashmap::DashMap;
use serde::Serialize;

use crate::domain::{RegistrationError, Result, SeatLabel};

#[derive(Debug)]
struct SeatGrid {
    rows: u32,
    seats_per_row: u32,
    /// Row-major cells; `Some(student_id)` when occupied.
    cells: Vec<Option<String>>,
    occupied: u32,
}

impl SeatGrid {
    fn total_seats(&self) -> u32 {
        self.rows * self.seats_per_row
    }
}

/// One cell in a classroom snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatState {
    pub label: SeatLabel,
    pub row: u32,
    pub column: u32,
    pub occupied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
}

/// Full classroom snapshot for one course.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomState {
    pub total_seats: u32,
    pub occupied: u32,
    pub available: u32,
    pub seats: Vec<SeatState>,
}

/// Thread-safe store of per-course seat grids. Mutations happen under the
/// owning course's lock.
#[derive(Default)]
pub struct SeatMapStore {
    grids: DashMap<String, SeatGrid>,
}

impl SeatMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or resets) the grid for a course.
    pub fn init_course(&self, course_id: &str, rows: u32, seats_per_row: u32) {
        self.grids.insert(
            course_id.to_string(),
            SeatGrid {
                rows,
                seats_per_row,
                cells: vec![None; (rows * seats_per_row) as usize],
                occupied: 0,
            },
        );
    }

    pub fn contains_course(&self, course_id: &str) -> bool {
        self.grids.contains_key(course_id)
    }

    /// Claims a seat for a student.
    pub fn occupy(&self, course_id: &str, label: &SeatLabel, student_id: &str) -> Result<()> {
        let mut grid = self
            .grids
            .get_mut(course_id)
            .ok_or_else(|| RegistrationError::CourseNotFound(course_id.to_string()))?;
        if !label.fits(grid.rows, grid.seats_per_row) {
            return Err(RegistrationError::InvalidSeatLabel(label.to_string()));
        }
        if grid.occupied >= grid.total_seats() {
            return Err(RegistrationError::CapacityExceeded(course_id.to_string()));
        }
        let index = label.cell_index(grid.seats_per_row);
        if grid.cells[index].is_some() {
            return Err(RegistrationError::SeatTaken { seat: *label });
        }
        grid.cells[index] = Some(student_id.to_string());
        grid.occupied += 1;
        Ok(())
    }

    /// Frees a seat, returning its previous occupant.
    pub fn release(&self, course_id: &str, label: &SeatLabel) -> Option<String> {
        let mut grid = self.grids.get_mut(course_id)?;
        if !label.fits(grid.rows, grid.seats_per_row) {
            return None;
        }
        let index = label.cell_index(grid.seats_per_row);
        let previous = grid.cells[index].take();
        if previous.is_some() {
            grid.occupied -= 1;
        }
        previous
    }

    /// Seat currently held by a student, if any.
    pub fn occupant_seat(&self, course_id: &str, student_id: &str) -> Option<SeatLabel> {
        let grid = self.grids.get(course_id)?;
        grid.cells.iter().position(|cell| {
            cell.as_deref() == Some(student_id)
        })
        .map(|index| SeatLabel::from_cell_index(index, grid.seats_per_row))
    }

    /// First free seat in row-major order.
    pub fn pick_lowest_free(&self, course_id: &str) -> Option<SeatLabel> {
        let grid = self.grids.get(course_id)?;
        grid.cells
            .iter()
            .position(|cell| cell.is_none())
            .map(|index| SeatLabel::from_cell_index(index, grid.seats_per_row))
    }

    pub fn seat_is_free(&self, course_id: &str, label: &SeatLabel) -> bool {
        match self.grids.get(course_id) {
            Some(grid) => {
                label.fits(grid.rows, grid.seats_per_row)
                    && grid.cells[label.cell_index(grid.seats_per_row)].is_none()
            }
            None => false,
        }
    }

    /// Whether a label addresses a cell of the course's grid at all.
    pub fn label_is_valid(&self, course_id: &str, label: &SeatLabel) -> bool {
        self.grids
            .get(course_id)
            .map(|grid| label.fits(grid.rows, grid.seats_per_row))
            .unwrap_or(false)
    }

    pub fn occupied_count(&self, course_id: &str) -> u32 {
        self.grids.get(course_id).map(|g| g.occupied).unwrap_or(0)
    }

    pub fn free_count(&self, course_id: &str) -> u32 {
        self.grids
            .get(course_id)
            .map(|g| g.total_seats() - g.occupied)
            .unwrap_or(0)
    }

    pub fn is_full(&self, course_id: &str) -> bool {
        self.grids
            .get(course_id)
            .map(|g| g.occupied >= g.total_seats())
            .unwrap_or(false)
    }

    /// Snapshot for the classroom query and reconnect reconciliation.
    pub fn state(&self, course_id: &str) -> Option<ClassroomState> {
        let grid = self.grids.get(course_id)?;
        let seats = grid
            .cells
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let label = SeatLabel::from_cell_index(index, grid.seats_per_row);
                SeatState {
                    label,
                    row: label.row(),
                    column: label.column(),
                    occupied: cell.is_some(),
                    student_id: cell.clone(),
                }
            })
            .collect();
        Some(ClassroomState {
            total_seats: grid.total_seats(),
            occupied: grid.occupied,
            available: grid.total_seats() - grid.occupied,
            seats,
        })
    }
}
