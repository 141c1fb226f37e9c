use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::CoordError;

/// Cell coordinate (0-indexed internally)
///
/// Serialized in A1 notation. Ordering is column-major (column, then row), which
/// is the tie-break order used for recalculation.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellCoord {
    pub row: u32,
    pub col: u32,
}

impl CellCoord {
    /// Number of addressable rows (1..=99)
    pub const MAX_ROWS: u32 = 99;
    /// Number of addressable columns (A..=Z)
    pub const MAX_COLS: u32 = 26;

    pub const fn new(row: u32, col: u32) -> Self {
        CellCoord { row, col }
    }

    /// Create from A1 notation (e.g., "A1" -> (0, 0), "b2" -> (1, 1))
    ///
    /// Returns `None` for malformed or out-of-range identifiers.
    pub fn from_a1(notation: &str) -> Option<Self> {
        notation.parse().ok()
    }

    /// Convert to A1 notation (e.g., (0, 0) -> "A1")
    pub fn to_a1(&self) -> String {
        format!("{}{}", col_to_label(self.col), self.row + 1)
    }

    /// Check if this coord is inside the addressable grid
    pub fn is_valid(&self) -> bool {
        self.row < Self::MAX_ROWS && self.col < Self::MAX_COLS
    }
}

impl Ord for CellCoord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.col.cmp(&other.col).then(self.row.cmp(&other.row))
    }
}

impl PartialOrd for CellCoord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for CellCoord {
    type Err = CoordError;

    fn from_str(notation: &str) -> Result<Self, Self::Err> {
        let split = notation
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(notation.len());
        let (letters, digits) = notation.split_at(split);

        if letters.is_empty()
            || digits.is_empty()
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(CoordError::Malformed(notation.to_string()));
        }

        let col = col_from_label(letters).ok_or_else(|| CoordError::Malformed(notation.to_string()))?;
        let row: u32 = digits
            .parse()
            .map_err(|_| CoordError::OutOfRange(notation.to_string()))?;

        if row == 0 {
            return Err(CoordError::OutOfRange(notation.to_string()));
        }

        let coord = CellCoord { row: row - 1, col };
        if coord.is_valid() {
            Ok(coord)
        } else {
            Err(CoordError::OutOfRange(notation.to_string()))
        }
    }
}

impl TryFrom<String> for CellCoord {
    type Error = CoordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellCoord> for String {
    fn from(coord: CellCoord) -> Self {
        coord.to_a1()
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_a1())
    }
}

/// Convert column index (0-indexed) to label (A, B, ..., Z, AA, AB, ...)
pub fn col_to_label(col: u32) -> String {
    let mut label = String::new();
    let mut n = col + 1; // 1-indexed for calculation

    while n > 0 {
        n -= 1;
        label.insert(0, char::from(b'A' + (n % 26) as u8));
        n /= 26;
    }

    label
}

/// Convert column label (A, B, ..., Z, AA, AB, ...) to index (0-indexed)
///
/// Labels are case-insensitive. Returns `None` for empty or non-alphabetic labels
/// and for labels too long to fit a `u32`.
pub fn col_from_label(label: &str) -> Option<u32> {
    let mut col: u32 = 0;

    for c in label.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col
            .checked_mul(26)?
            .checked_add(c.to_ascii_uppercase() as u32 - 'A' as u32 + 1)?;
    }

    if col == 0 {
        None
    } else {
        Some(col - 1) // Convert to 0-indexed
    }
}
