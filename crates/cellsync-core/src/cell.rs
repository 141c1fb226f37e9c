use serde::{Deserialize, Serialize};

use crate::error::CellError;

/// The evaluated value of a cell
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Error(CellError),
}

impl CellValue {
    /// Check if the value is empty
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Check if the value is an evaluation error
    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Numeric view of the value for arithmetic
    ///
    /// Empty cells count as zero. Text is never coerced.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Empty => Some(0.0),
            _ => None,
        }
    }

    /// Display string shown in the grid and sent to clients
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Error(e) => e.to_string(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        // Avoid "-0"
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A single cell: what the user typed and what it evaluates to
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Raw contents exactly as submitted ("5", "hello", "=A1+1")
    pub contents: String,
    /// Last computed value
    pub value: CellValue,
}

impl Cell {
    pub fn new(contents: impl Into<String>, value: CellValue) -> Self {
        Cell {
            contents: contents.into(),
            value,
        }
    }

    /// Check if the cell has no contents
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Check if the contents are a formula
    pub fn is_formula(&self) -> bool {
        self.contents.starts_with(crate::FORMULA_MARKER)
    }

    /// Get the display value as a string
    pub fn display_value(&self) -> String {
        self.value.as_text()
    }
}

/// A cell whose value changed during a recompute pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub coord: crate::CellCoord,
    pub value: CellValue,
}

impl CellChange {
    pub fn new(coord: crate::CellCoord, value: CellValue) -> Self {
        Self { coord, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_value_as_number() {
        assert_eq!(CellValue::Number(42.0).as_number(), Some(42.0));
        assert_eq!(CellValue::Empty.as_number(), Some(0.0));
        assert_eq!(CellValue::Text("123".to_string()).as_number(), None);
        assert_eq!(CellValue::Error(CellError::DivisionByZero).as_number(), None);
    }

    #[test]
    fn test_cell_value_as_text() {
        assert_eq!(CellValue::Number(42.0).as_text(), "42");
        assert_eq!(CellValue::Number(42.5).as_text(), "42.5");
        assert_eq!(CellValue::Number(-0.0).as_text(), "0");
        assert_eq!(CellValue::Number(1e20).as_text(), "100000000000000000000");
        assert_eq!(CellValue::Empty.as_text(), "");
        assert_eq!(CellValue::Text("hello".to_string()).as_text(), "hello");
        assert_eq!(CellValue::Error(CellError::DivisionByZero).as_text(), "#DIV/0!");
    }

    #[test]
    fn test_cell_creation() {
        let cell = Cell::new("=A1+B1", CellValue::Number(3.0));
        assert!(cell.is_formula());
        assert!(!cell.is_empty());
        assert_eq!(cell.display_value(), "3");

        assert!(Cell::default().is_empty());
        assert_eq!(Cell::default().display_value(), "");
    }
}
