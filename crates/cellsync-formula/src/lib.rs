pub mod ast;
pub mod dependency;
pub mod evaluator;
pub mod parser;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use dependency::{CycleError, DependencyGraph};
pub use evaluator::Evaluator;
pub use parser::{parse_formula, ParseError};

use std::collections::BTreeSet;

use cellsync_core::{CellCoord, CellValue, FORMULA_MARKER};

/// Cell contents classified by what they mean
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedContent {
    /// No contents; the cell does not exist for dependency purposes
    Empty,
    Number(f64),
    Text(String),
    Formula {
        expr: Expr,
        /// Every cell the formula reads, deduplicated
        references: BTreeSet<CellCoord>,
    },
}

impl ParsedContent {
    /// Cells this content depends on
    pub fn references(&self) -> impl Iterator<Item = CellCoord> + '_ {
        let refs = match self {
            ParsedContent::Formula { references, .. } => Some(references.iter().copied()),
            _ => None,
        };
        refs.into_iter().flatten()
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, ParsedContent::Formula { .. })
    }

    /// Evaluate the content, resolving references through `get_cell_value`
    pub fn evaluate(&self, get_cell_value: impl Fn(CellCoord) -> CellValue) -> CellValue {
        match self {
            ParsedContent::Empty => CellValue::Empty,
            ParsedContent::Number(n) => CellValue::Number(*n),
            ParsedContent::Text(s) => CellValue::Text(s.clone()),
            ParsedContent::Formula { expr, .. } => Evaluator::new(get_cell_value).evaluate(expr),
        }
    }
}

/// Classify raw cell contents
///
/// `""` is empty, a leading `=` marks a formula, anything that reads as a finite
/// number is a number, and everything else is text kept verbatim.
pub fn parse_content(raw: &str) -> Result<ParsedContent, ParseError> {
    if raw.is_empty() {
        return Ok(ParsedContent::Empty);
    }

    if let Some(body) = raw.strip_prefix(FORMULA_MARKER) {
        let expr = parse_formula(body).map_err(|e| e.offset(FORMULA_MARKER.len_utf8()))?;
        let references = collect_references(&expr);
        return Ok(ParsedContent::Formula { expr, references });
    }

    match raw.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(ParsedContent::Number(n)),
        _ => Ok(ParsedContent::Text(raw.to_string())),
    }
}

/// Collect the distinct cell references of an AST
pub fn collect_references(expr: &Expr) -> BTreeSet<CellCoord> {
    let mut refs = BTreeSet::new();
    expr.for_each_reference(&mut |coord| {
        refs.insert(coord);
    });
    refs
}
