use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeatLabelError {
    #[error("empty seat label")]
    Empty,

    #[error("invalid row letter in seat label: {0}")]
    InvalidRow(String),

    #[error("invalid column number in seat label: {0}")]
    InvalidColumn(String),
}

/// A seat position expressed as row letter + 1-based column index, e.g. `A1`
/// or `M20`. Row `A` is index 0; the grammar supports rows `A`-`Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeatLabel {
    /// 0-based row index
    row: u32,
    /// 1-based column index
    column: u32,
}

impl SeatLabel {
    pub fn new(row: u32, column: u32) -> Self {
        debug_assert!(row < 26);
        debug_assert!(column >= 1);
        Self { row, column }
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn row_letter(&self) -> char {
        (b'A' + self.row as u8) as char
    }

    /// Row-major cell index within a grid of `seats_per_row` columns.
    pub fn cell_index(&self, seats_per_row: u32) -> usize {
        (self.row * seats_per_row + (self.column - 1)) as usize
    }

    /// Inverse of [`cell_index`](Self::cell_index).
    pub fn from_cell_index(index: usize, seats_per_row: u32) -> Self {
        let index = index as u32;
        Self {
            row: index / seats_per_row,
            column: index % seats_per_row + 1,
        }
    }

    /// Whether this label falls inside a `rows` x `seats_per_row` grid.
    pub fn fits(&self, rows: u32, seats_per_row: u32) -> bool {
        self.row < rows && self.column >= 1 && self.column <= seats_per_row
    }
}

impl std::str::FromStr for SeatLabel {
    type Err = SeatLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let row_char = chars.next().ok_or(SeatLabelError::Empty)?;
        if !row_char.is_ascii_uppercase() {
            return Err(SeatLabelError::InvalidRow(s.to_string()));
        }
        let rest = chars.as_str();
        let column: u32 = rest
            .parse()
            .map_err(|_| SeatLabelError::InvalidColumn(s.to_string()))?;
        if column == 0 {
            return Err(SeatLabelError::InvalidColumn(s.to_string()));
        }
        Ok(SeatLabel {
            row: (row_char as u8 - b'A') as u32,
            column,
        })
    }
}

impl std::fmt::Display for SeatLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.row_letter(), self.column)
    }
}

impl Serialize for SeatLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SeatLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
