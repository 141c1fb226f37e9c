use cellsync_core::CellCoord;

/// One committed edit: a cell's contents before and after
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub coord: CellCoord,
    pub before: String,
    pub after: String,
}

impl UndoEntry {
    pub fn new(coord: CellCoord, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            coord,
            before: before.into(),
            after: after.into(),
        }
    }

    /// Get a description of this entry (for logs and UI display)
    pub fn description(&self) -> String {
        if self.after.is_empty() {
            format!("Clear {}", self.coord)
        } else {
            format!("Set {}", self.coord)
        }
    }
}
