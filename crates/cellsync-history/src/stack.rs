use std::collections::VecDeque;

use crate::entry::UndoEntry;
use cellsync_core::CellCoord;

/// Default maximum number of undo levels
pub const DEFAULT_UNDO_LIMIT: usize = 1000;

/// Ordered, append-only history of committed edits for one spreadsheet
///
/// Undo is global: the most recent entry is popped regardless of which session
/// made it. There is no redo; an undo consumes exactly one entry.
pub struct UndoLog {
    /// Oldest entry at the front, most recent at the back
    entries: VecDeque<UndoEntry>,
    /// Maximum number of undo levels
    max_size: usize,
}

impl UndoLog {
    /// Create a new undo log with the specified max undo levels
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
        }
    }

    /// Append a committed edit
    ///
    /// When the log is full the oldest entry is discarded.
    pub fn record_edit(&mut self, coord: CellCoord, before: impl Into<String>, after: impl Into<String>) {
        if self.max_size == 0 {
            return;
        }

        self.entries.push_back(UndoEntry::new(coord, before, after));

        // Limit stack size
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    /// Remove and return the most recent entry
    pub fn pop(&mut self) -> Option<UndoEntry> {
        self.entries.pop_back()
    }

    /// Put an entry back on top, used when reverting it failed
    pub fn restore(&mut self, entry: UndoEntry) {
        self.entries.push_back(entry);
    }

    /// Peek at the entry that would be undone next
    pub fn last(&self) -> Option<&UndoEntry> {
        self.entries.back()
    }

    /// Check if undo is available
    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Get the number of entries in the log
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries.iter()
    }

    /// Clear all history
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_LIMIT)
    }
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLog")
            .field("undo_count", &self.entries.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_pop() {
        let mut log = UndoLog::new(100);
        let a1 = CellCoord::new(0, 0);
        let b1 = CellCoord::new(0, 1);

        log.record_edit(a1, "", "1");
        log.record_edit(b1, "", "=A1");
        log.record_edit(a1, "1", "2");

        assert_eq!(log.len(), 3);
        assert!(log.can_undo());
        assert_eq!(log.pop(), Some(UndoEntry::new(a1, "1", "2")));
        assert_eq!(log.pop(), Some(UndoEntry::new(b1, "", "=A1")));
        assert_eq!(log.pop(), Some(UndoEntry::new(a1, "", "1")));
        assert_eq!(log.pop(), None);
        assert!(!log.can_undo());
    }

    #[test]
    fn test_max_size() {
        let mut log = UndoLog::new(3);

        // Record 5 edits
        for i in 0..5 {
            log.record_edit(CellCoord::new(i, 0), "", i.to_string());
        }

        // Should only keep the 3 most recent
        assert_eq!(log.len(), 3);
        let kept: Vec<_> = log.iter().map(|e| e.after.clone()).collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut log = UndoLog::new(0);
        log.record_edit(CellCoord::new(0, 0), "", "1");
        assert!(log.is_empty());
    }

    #[test]
    fn test_restore_and_clear() {
        let mut log = UndoLog::default();
        log.record_edit(CellCoord::new(0, 0), "", "1");

        let entry = log.pop().unwrap();
        log.restore(entry.clone());
        assert_eq!(log.last(), Some(&entry));

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.max_size(), DEFAULT_UNDO_LIMIT);
    }
}
