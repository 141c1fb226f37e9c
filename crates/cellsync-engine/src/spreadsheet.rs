use std::collections::{BTreeMap, HashMap, HashSet};

use cellsync_core::{Cell, CellChange, CellCoord, CellValue};
use cellsync_formula::{parse_content, DependencyGraph, ParsedContent};
use cellsync_history::{UndoEntry, UndoLog, DEFAULT_UNDO_LIMIT};
use tracing::debug;

use crate::error::EditError;

static EMPTY: CellValue = CellValue::Empty;

/// A cell as stored by the engine: what the user typed, its current value and
/// the parsed form used for recalculation
#[derive(Debug, Clone)]
struct StoredCell {
    cell: Cell,
    parsed: ParsedContent,
}

/// The authoritative state of one named spreadsheet
///
/// Only non-empty cells are stored. Every stored value is the result of
/// evaluating the cell's contents against the current values of the cells it
/// references, and the dependency graph holds exactly the references of the
/// stored formulas.
pub struct Spreadsheet {
    name: String,
    cells: BTreeMap<CellCoord, StoredCell>,
    dep_graph: DependencyGraph,
    history: UndoLog,
}

impl Spreadsheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_undo_limit(name, DEFAULT_UNDO_LIMIT)
    }

    pub fn with_undo_limit(name: impl Into<String>, undo_limit: usize) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            dep_graph: DependencyGraph::new(),
            history: UndoLog::new(undo_limit),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the contents of a cell and recalculate everything that depends on it
    ///
    /// Either the whole edit is committed or nothing changes. Returns the cells
    /// whose value changed, in evaluation order.
    pub fn apply_edit(&mut self, coord: CellCoord, contents: &str) -> Result<Vec<CellChange>, EditError> {
        let before = self.contents(coord).to_string();
        let changes = self.set_contents(coord, contents)?;

        if before != contents {
            self.history.record_edit(coord, before, contents);
        }

        debug!(
            sheet = %self.name,
            cell = %coord,
            changed = changes.len(),
            "applied edit"
        );
        Ok(changes)
    }

    /// Revert the most recent committed edit
    ///
    /// The revert is not itself recorded, so repeated undo walks back through
    /// history one entry at a time.
    pub fn undo(&mut self) -> Result<Vec<CellChange>, EditError> {
        let entry = self.history.pop().ok_or(EditError::NothingToUndo)?;

        match self.set_contents(entry.coord, &entry.before) {
            Ok(changes) => {
                debug!(sheet = %self.name, entry = %entry.description(), "undone");
                Ok(changes)
            }
            Err(e) => {
                self.history.restore(entry);
                Err(e)
            }
        }
    }

    /// Reset to an empty sheet, dropping the dependency graph and undo history
    pub fn clear(&mut self) {
        self.cells.clear();
        self.dep_graph.clear();
        self.history.clear();
        debug!(sheet = %self.name, "cleared");
    }

    /// Set contents without touching the undo log
    pub(crate) fn set_contents(&mut self, coord: CellCoord, contents: &str) -> Result<Vec<CellChange>, EditError> {
        if !coord.is_valid() {
            return Err(EditError::OutOfRange { cell: coord });
        }

        let parsed = parse_content(contents).map_err(|source| EditError::Syntax { cell: coord, source })?;

        let references: Vec<CellCoord> = parsed.references().collect();
        if self.dep_graph.would_create_cycle(coord, &references) {
            return Err(EditError::CircularReference { cell: coord });
        }

        let previous = self.value(coord).clone();
        self.commit(coord, contents, parsed, references);
        self.recalculate_from(coord, previous)
    }

    fn commit(&mut self, coord: CellCoord, contents: &str, parsed: ParsedContent, references: Vec<CellCoord>) {
        self.dep_graph.set_dependencies(coord, references);

        if matches!(parsed, ParsedContent::Empty) {
            self.cells.remove(&coord);
        } else {
            let value = self.value(coord).clone();
            self.cells.insert(
                coord,
                StoredCell {
                    cell: Cell::new(contents, value),
                    parsed,
                },
            );
        }
    }

    /// Re-evaluate `changed` and its transitive dependents in dependency order
    fn recalculate_from(&mut self, changed: CellCoord, previous: CellValue) -> Result<Vec<CellChange>, EditError> {
        let order = self.dep_graph.recalc_order(changed)?;
        let mut changes = Vec::new();

        for coord in order {
            let old = if coord == changed {
                previous.clone()
            } else {
                self.value(coord).clone()
            };

            let new = match self.cells.get(&coord) {
                Some(stored) => stored.parsed.evaluate(|r| self.value(r).clone()),
                None => CellValue::Empty,
            };

            if let Some(stored) = self.cells.get_mut(&coord) {
                stored.cell.value = new.clone();
            }

            if new != old {
                changes.push(CellChange::new(coord, new));
            }
        }

        Ok(changes)
    }

    /// Raw contents of a cell, `""` when empty
    pub fn contents(&self, coord: CellCoord) -> &str {
        self.cells
            .get(&coord)
            .map(|stored| stored.cell.contents.as_str())
            .unwrap_or("")
    }

    /// Current value of a cell, `Empty` when empty
    pub fn value(&self, coord: CellCoord) -> &CellValue {
        self.cells
            .get(&coord)
            .map(|stored| &stored.cell.value)
            .unwrap_or(&EMPTY)
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&Cell> {
        self.cells.get(&coord).map(|stored| &stored.cell)
    }

    /// Non-empty cells in identifier order (column, then row)
    pub fn cells(&self) -> impl Iterator<Item = (CellCoord, &Cell)> + '_ {
        self.cells.iter().map(|(coord, stored)| (*coord, &stored.cell))
    }

    /// Every non-empty cell with its value, in identifier order
    pub fn snapshot(&self) -> Vec<CellChange> {
        self.cells()
            .map(|(coord, cell)| CellChange::new(coord, cell.value.clone()))
            .collect()
    }

    /// Number of non-empty cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of edits that can currently be undone
    pub fn undo_count(&self) -> usize {
        self.history.len()
    }

    /// The edit the next undo would revert
    pub fn last_edit(&self) -> Option<&UndoEntry> {
        self.history.last()
    }

    pub(crate) fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Cells whose stored value or dependency edges disagree with a full
    /// recalculation from contents
    ///
    /// Empty for a healthy sheet.
    pub fn inconsistent_cells(&self) -> Vec<CellCoord> {
        let mut bad: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(coord, stored)| {
                let expected: HashSet<CellCoord> = stored.parsed.references().collect();
                let actual = self.dep_graph.direct_dependencies(**coord).cloned().unwrap_or_default();
                expected != actual
            })
            .map(|(coord, _)| *coord)
            .collect();

        // Edges hanging off cells that no longer exist
        bad.extend(self.dep_graph.cells_with_formulas().filter(|c| !self.cells.contains_key(c)));

        let all: HashSet<CellCoord> = self.cells.keys().copied().collect();
        let order = match self.dep_graph.topological_order(&all) {
            Ok(order) => order,
            Err(cycle) => {
                bad.push(cycle.0);
                return bad;
            }
        };

        let mut fresh: HashMap<CellCoord, CellValue> = HashMap::new();
        for coord in order {
            if let Some(stored) = self.cells.get(&coord) {
                let value = stored
                    .parsed
                    .evaluate(|r| fresh.get(&r).cloned().unwrap_or_default());
                if value != stored.cell.value {
                    bad.push(coord);
                }
                fresh.insert(coord, value);
            }
        }

        bad.sort();
        bad.dedup();
        bad
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistent_cells().is_empty()
    }
}

impl std::fmt::Debug for Spreadsheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spreadsheet")
            .field("name", &self.name)
            .field("cells", &self.cells.len())
            .field("edges", &self.dep_graph.edge_count())
            .field("undo", &self.history.len())
            .finish()
    }
}
