pub mod entry;
pub mod stack;

pub use entry::UndoEntry;
pub use stack::{UndoLog, DEFAULT_UNDO_LIMIT};
