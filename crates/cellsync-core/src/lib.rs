pub mod cell;
pub mod coord;
pub mod error;

pub use cell::{Cell, CellChange, CellValue};
pub use coord::{col_from_label, col_to_label, CellCoord};
pub use error::{CellError, CoordError};

/// Leading character that marks cell contents as a formula
pub const FORMULA_MARKER: char = '=';
