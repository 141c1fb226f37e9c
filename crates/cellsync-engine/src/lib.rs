//! Dependency-tracked spreadsheet engine.
//!
//! [`Spreadsheet`] owns the authoritative cells of one document, the dependency
//! graph between them and the undo log. Every mutation goes through
//! [`Spreadsheet::apply_edit`], [`Spreadsheet::undo`] or [`Spreadsheet::clear`].

pub mod error;
pub mod persistence;
pub mod spreadsheet;

pub use error::{EditError, PersistError};
pub use persistence::{load, save, CellRecord, SpreadsheetFile};
pub use spreadsheet::Spreadsheet;

pub use cellsync_core::{Cell, CellChange, CellCoord, CellError, CellValue};
pub use cellsync_history::DEFAULT_UNDO_LIMIT;
