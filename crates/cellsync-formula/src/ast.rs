use cellsync_core::CellCoord;

/// Abstract Syntax Tree for formula expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    // Literal
    Number(f64),

    // Cell reference (e.g., A1, b12), normalized to a coordinate
    CellRef(CellCoord),

    // Binary operation
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    // Unary operation
    Unary { op: UnaryOp, operand: Box<Expr> },

    // Parenthesized expression
    Grouped(Box<Expr>),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg, // -
    Pos, // +
}

impl Expr {
    /// Create a number expression
    pub fn number(n: f64) -> Self {
        Expr::Number(n)
    }

    /// Create a cell reference expression
    pub fn cell_ref(coord: CellCoord) -> Self {
        Expr::CellRef(coord)
    }

    /// Create a binary expression
    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Create a unary expression
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Create a parenthesized expression
    pub fn grouped(inner: Expr) -> Self {
        Expr::Grouped(Box::new(inner))
    }

    /// Visit every cell reference in the tree, left to right
    pub fn for_each_reference(&self, f: &mut impl FnMut(CellCoord)) {
        match self {
            Expr::Number(_) => {}
            Expr::CellRef(coord) => f(*coord),
            Expr::Binary { left, right, .. } => {
                left.for_each_reference(f);
                right.for_each_reference(f);
            }
            Expr::Unary { operand, .. } => operand.for_each_reference(f),
            Expr::Grouped(inner) => inner.for_each_reference(f),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Number(n) => {
                // Format numbers without unnecessary decimals
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Expr::CellRef(coord) => write!(f, "{}", coord),
            Expr::Binary { left, op, right } => write!(f, "{}{}{}", left, op, right),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "-{}", operand),
                UnaryOp::Pos => write!(f, "+{}", operand),
            },
            Expr::Grouped(inner) => write!(f, "({})", inner),
        }
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
        }
    }
}
