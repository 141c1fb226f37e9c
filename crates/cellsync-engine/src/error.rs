use cellsync_core::CellCoord;
use cellsync_formula::{CycleError, ParseError};
use thiserror::Error;

/// Why an edit, undo or load was not applied
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    #[error("syntax error in {cell}: {source}")]
    Syntax {
        cell: CellCoord,
        #[source]
        source: ParseError,
    },

    #[error("circular reference: {cell} would depend on itself")]
    CircularReference { cell: CellCoord },

    #[error("cell {cell} is outside the sheet")]
    OutOfRange { cell: CellCoord },

    #[error("nothing to undo")]
    NothingToUndo,

    /// The dependency graph no longer matches the cells. The document can no
    /// longer be trusted.
    #[error("internal dependency fault: {0}")]
    Internal(#[from] CycleError),
}

impl EditError {
    /// Rejections leave the spreadsheet untouched; internal faults do not
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EditError::Internal(_))
    }
}

/// Failure to save or load a spreadsheet file
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot replay saved cell {cell}: {source}")]
    Replay {
        cell: CellCoord,
        #[source]
        source: EditError,
    },
}
