//! JSON file format for saved spreadsheets.
//!
//! Only contents are stored. Values are rebuilt on load by replaying every cell
//! through the edit path, which also rebuilds the dependency graph.

use std::fs;
use std::path::{Path, PathBuf};

use cellsync_core::CellCoord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PersistError;
use crate::spreadsheet::Spreadsheet;

/// One saved cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub cell: CellCoord,
    pub contents: String,
}

/// On-disk form of a spreadsheet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpreadsheetFile {
    pub name: String,
    #[serde(default)]
    pub cells: Vec<CellRecord>,
}

impl SpreadsheetFile {
    /// Capture the contents of every non-empty cell, in identifier order
    pub fn from_spreadsheet(sheet: &Spreadsheet) -> Self {
        Self {
            name: sheet.name().to_string(),
            cells: sheet
                .cells()
                .map(|(cell, c)| CellRecord {
                    cell,
                    contents: c.contents.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a spreadsheet with an empty undo history
    pub fn into_spreadsheet(self, undo_limit: usize) -> Result<Spreadsheet, PersistError> {
        let mut sheet = Spreadsheet::with_undo_limit(self.name, undo_limit);

        for record in self.cells {
            sheet
                .set_contents(record.cell, &record.contents)
                .map_err(|source| PersistError::Replay {
                    cell: record.cell,
                    source,
                })?;
        }

        sheet.clear_history();
        Ok(sheet)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to `<dir>/<name>.json`, creating `dir` if needed
    ///
    /// The file is written next to its destination and renamed into place, so a
    /// crash mid-save leaves the previous file intact.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, PersistError> {
        fs::create_dir_all(dir)?;

        let path = file_path(dir, &self.name);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, self.to_json()?)?;
        fs::rename(&tmp, &path)?;

        info!(sheet = %self.name, cells = self.cells.len(), path = %path.display(), "saved spreadsheet");
        Ok(path)
    }
}

/// Path of the file a spreadsheet named `name` is saved to
pub fn file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Write a spreadsheet to `<dir>/<name>.json`, creating `dir` if needed
pub fn save(dir: &Path, sheet: &Spreadsheet) -> Result<PathBuf, PersistError> {
    SpreadsheetFile::from_spreadsheet(sheet).save(dir)
}

/// Load `<dir>/<name>.json`, or `None` if no such file exists
pub fn load(dir: &Path, name: &str, undo_limit: usize) -> Result<Option<Spreadsheet>, PersistError> {
    let path = file_path(dir, name);
    let json = match fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut file = SpreadsheetFile::from_json(&json)?;
    // The file name is authoritative
    file.name = name.to_string();

    let sheet = file.into_spreadsheet(undo_limit)?;
    info!(sheet = %name, cells = sheet.len(), "loaded spreadsheet");
    Ok(Some(sheet))
}
