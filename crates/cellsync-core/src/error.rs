use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Evaluation errors stored as a cell's value
///
/// These are values, not failures: they flow through the dependency graph like any
/// other value and every formula referencing an errored cell inherits the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellError {
    /// #DIV/0! - Division by zero
    DivisionByZero,
    /// #VALUE! - Text used where a number is required
    InvalidValue,
    /// #NUM! - Result is not a finite number
    NumError,
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellError::DivisionByZero => write!(f, "#DIV/0!"),
            CellError::InvalidValue => write!(f, "#VALUE!"),
            CellError::NumError => write!(f, "#NUM!"),
        }
    }
}

/// Failure to interpret a cell identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("malformed cell identifier '{0}'")]
    Malformed(String),

    #[error("cell identifier '{0}' is outside the sheet")]
    OutOfRange(String),
}
