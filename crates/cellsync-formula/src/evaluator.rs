use crate::ast::{BinaryOp, Expr, UnaryOp};
use cellsync_core::{CellCoord, CellError, CellValue};

/// Evaluator for formula AST
///
/// Cell references are resolved through the lookup closure, which must return the
/// referenced cell's current value. Formula results are always a number or an
/// evaluation error.
pub struct Evaluator<F>
where
    F: Fn(CellCoord) -> CellValue,
{
    get_cell_value: F,
}

impl<F> Evaluator<F>
where
    F: Fn(CellCoord) -> CellValue,
{
    pub fn new(get_cell_value: F) -> Self {
        Self { get_cell_value }
    }

    /// Evaluate an expression AST to a value
    pub fn evaluate(&self, expr: &Expr) -> CellValue {
        match self.evaluate_number(expr) {
            Ok(n) => CellValue::Number(n),
            Err(e) => CellValue::Error(e),
        }
    }

    fn evaluate_number(&self, expr: &Expr) -> Result<f64, CellError> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::CellRef(coord) => match (self.get_cell_value)(*coord) {
                // Errors in referenced cells propagate unchanged
                CellValue::Error(e) => Err(e),
                value => value.as_number().ok_or(CellError::InvalidValue),
            },
            Expr::Binary { left, op, right } => self.evaluate_binary(left, *op, right),
            Expr::Unary { op, operand } => {
                let value = self.evaluate_number(operand)?;
                Ok(match op {
                    UnaryOp::Neg => -value,
                    UnaryOp::Pos => value,
                })
            }
            Expr::Grouped(inner) => self.evaluate_number(inner),
        }
    }

    fn evaluate_binary(&self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<f64, CellError> {
        let a = self.evaluate_number(left)?;
        let b = self.evaluate_number(right)?;

        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    return Err(CellError::DivisionByZero);
                }
                a / b
            }
        };

        if result.is_finite() {
            Ok(result)
        } else {
            Err(CellError::NumError)
        }
    }
}
