use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cellsync_core::CellCoord;
use thiserror::Error;

/// The graph contains a cycle through the given cell
///
/// Only reachable if edges were committed without a prior cycle check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circular reference through {0}")]
pub struct CycleError(pub CellCoord);

/// Tracks dependencies between cells for efficient recalculation
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Maps a cell to the cells it depends on (formula inputs)
    /// e.g., if A1 = B1 + C1, then dependencies[A1] = {B1, C1}
    dependencies: HashMap<CellCoord, HashSet<CellCoord>>,

    /// Maps a cell to the cells that depend on it (reverse lookup)
    /// e.g., if A1 = B1 + C1, then dependents[B1] contains A1
    dependents: HashMap<CellCoord, HashSet<CellCoord>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every outgoing edge of a cell
    pub fn set_dependencies<I>(&mut self, cell: CellCoord, deps: I)
    where
        I: IntoIterator<Item = CellCoord>,
    {
        let deps: HashSet<CellCoord> = deps.into_iter().collect();

        // Remove old reverse dependencies
        if let Some(old_deps) = self.dependencies.remove(&cell) {
            for dep in old_deps {
                if let Some(dependents) = self.dependents.get_mut(&dep) {
                    dependents.remove(&cell);
                    if dependents.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }

        // Add new reverse dependencies
        for dep in &deps {
            self.dependents.entry(*dep).or_default().insert(cell);
        }

        if !deps.is_empty() {
            self.dependencies.insert(cell, deps);
        }
    }

    /// Get cells that directly depend on the given cell
    pub fn direct_dependents(&self, cell: CellCoord) -> Option<&HashSet<CellCoord>> {
        self.dependents.get(&cell)
    }

    /// Get cells that the given cell directly depends on
    pub fn direct_dependencies(&self, cell: CellCoord) -> Option<&HashSet<CellCoord>> {
        self.dependencies.get(&cell)
    }

    /// Check whether giving `cell` the dependencies `new_deps` would close a cycle
    ///
    /// Runs a depth-first search from each proposed dependency along existing
    /// edges looking for `cell`. The graph is not modified.
    pub fn would_create_cycle<'a, I>(&self, cell: CellCoord, new_deps: I) -> bool
    where
        I: IntoIterator<Item = &'a CellCoord>,
    {
        let mut visited = HashSet::new();
        let mut stack: Vec<CellCoord> = new_deps.into_iter().copied().collect();

        while let Some(current) = stack.pop() {
            if current == cell {
                return true;
            }

            if !visited.insert(current) {
                continue;
            }

            if let Some(deps) = self.direct_dependencies(current) {
                stack.extend(deps.iter().copied());
            }
        }

        false
    }

    /// The changed cell plus every cell that transitively depends on it
    pub fn dependent_closure(&self, changed: CellCoord) -> HashSet<CellCoord> {
        let mut affected = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(changed);

        while let Some(cell) = queue.pop_front() {
            if !affected.insert(cell) {
                continue;
            }

            if let Some(dependents) = self.direct_dependents(cell) {
                queue.extend(dependents.iter().copied());
            }
        }

        affected
    }

    /// Order a set of cells so every cell follows the cells it depends on
    ///
    /// Kahn's algorithm restricted to `cells`: repeatedly emit the smallest cell
    /// (column, then row) with no unprocessed dependency inside the set.
    pub fn topological_order(&self, cells: &HashSet<CellCoord>) -> Result<Vec<CellCoord>, CycleError> {
        let mut indegree: HashMap<CellCoord, usize> = cells
            .iter()
            .map(|&cell| {
                let count = self
                    .direct_dependencies(cell)
                    .map(|deps| deps.iter().filter(|d| cells.contains(d)).count())
                    .unwrap_or(0);
                (cell, count)
            })
            .collect();

        let mut ready: BTreeSet<CellCoord> = indegree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&cell, _)| cell)
            .collect();

        let mut order = Vec::with_capacity(cells.len());
        while let Some(cell) = ready.pop_first() {
            order.push(cell);

            if let Some(dependents) = self.direct_dependents(cell) {
                for dependent in dependents {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(*dependent);
                        }
                    }
                }
            }
        }

        if order.len() == cells.len() {
            Ok(order)
        } else {
            let stuck = indegree
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(cell, _)| cell)
                .min()
                .unwrap_or_else(|| CellCoord::new(0, 0));
            Err(CycleError(stuck))
        }
    }

    /// Get all cells that need recalculation when a cell changes
    /// Returns cells in topological order (dependencies before dependents)
    pub fn recalc_order(&self, changed: CellCoord) -> Result<Vec<CellCoord>, CycleError> {
        self.topological_order(&self.dependent_closure(changed))
    }

    /// Get all cells that have formulas (have dependencies)
    pub fn cells_with_formulas(&self) -> impl Iterator<Item = CellCoord> + '_ {
        self.dependencies.keys().copied()
    }

    /// Number of edges in the graph
    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(HashSet::len).sum()
    }

    /// Check if the graph has no edges
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Clear all dependencies
    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
    }
}
