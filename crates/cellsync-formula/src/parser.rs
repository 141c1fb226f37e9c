//! Nom-based formula parser.
//!
//! Parses the body of a formula (everything after the leading `=`) directly from
//! the string to an AST. The grammar is deliberately small:
//!
//! ```text
//! expression     := additive
//! additive       := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/") unary)*
//! unary          := ("-" | "+") unary | primary
//! primary        := "(" expression ")" | number | cell_ref
//! ```
//!
//! Trees taller than [`MAX_NESTING`] are rejected while parsing.
//!
//! Cell references are case-insensitive and must name a cell inside the sheet.

use nom::{
    branch::alt,
    character::complete::{alpha1, char, digit0, digit1, multispace0, one_of},
    combinator::{cut, map, opt, recognize},
    error::{Error, ErrorKind},
    sequence::{delimited, pair, terminated, tuple},
    IResult,
};
use thiserror::Error as ThisError;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use cellsync_core::CellCoord;

// =============================================================================
// Error Type
// =============================================================================

/// A formula that could not be parsed
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("{message} at position {position}")]
pub struct ParseError {
    pub message: String,
    /// Byte offset into the parsed text
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// Shift the position, used when the parsed text was a suffix of the input
    pub fn offset(mut self, by: usize) -> Self {
        self.position += by;
        self
    }
}

// =============================================================================
// Helper Combinators
// =============================================================================

/// Skip whitespace
fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// Parse a decimal number (integer, decimal, optional exponent)
fn parse_number(input: &str) -> IResult<&str, Expr> {
    let (rest, num_str) = recognize(tuple((
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;

    match num_str.parse::<f64>() {
        Ok(num) if num.is_finite() => Ok((rest, Expr::Number(num))),
        _ => Err(nom::Err::Failure(Error::new(input, ErrorKind::Float))),
    }
}

/// Parse a cell reference (e.g., A1, b12)
fn parse_cell_ref(input: &str) -> IResult<&str, Expr> {
    let (rest, label) = recognize(pair(alpha1, digit1))(input)?;

    match label.parse::<CellCoord>() {
        Ok(coord) => Ok((rest, Expr::CellRef(coord))),
        // Well-formed but outside the sheet: no other branch can match either
        Err(_) => Err(nom::Err::Failure(Error::new(input, ErrorKind::Verify))),
    }
}

// =============================================================================
// Operator Parsers
// =============================================================================

fn parse_additive_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        map(char('+'), |_| BinaryOp::Add),
        map(char('-'), |_| BinaryOp::Sub),
    ))(input)
}

fn parse_multiplicative_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        map(char('*'), |_| BinaryOp::Mul),
        map(char('/'), |_| BinaryOp::Div),
    ))(input)
}

// =============================================================================
// Expression Parsers (Precedence Climbing)
// =============================================================================

/// Tallest expression tree a formula may produce
///
/// Parentheses, prefix signs and every operator in a chain each add a level.
/// Evaluation and drop recurse once per level, so this bounds stack use.
pub const MAX_NESTING: usize = 128;

/// A parsed expression and the height of its tree
type Node = (Expr, usize);

fn too_deep(input: &str) -> nom::Err<Error<&str>> {
    nom::Err::Failure(Error::new(input, ErrorKind::TooLarge))
}

fn check_depth(input: &str, depth: usize) -> Result<(), nom::Err<Error<&str>>> {
    if depth > MAX_NESTING {
        Err(too_deep(input))
    } else {
        Ok(())
    }
}

/// Height of a node whose tallest child has height `height`
fn grow(input: &str, height: usize) -> Result<usize, nom::Err<Error<&str>>> {
    if height >= MAX_NESTING {
        Err(too_deep(input))
    } else {
        Ok(height + 1)
    }
}

fn leaf(expr: Expr) -> Node {
    (expr, 1)
}

/// Parse a primary expression (number, cell reference, parentheses)
fn parse_primary(input: &str, depth: usize) -> IResult<&str, Node> {
    let (input, _) = multispace0(input)?;

    if let Ok((rest, _)) = char::<&str, Error<&str>>('(')(input) {
        let (rest, (inner, height)) =
            cut(terminated(|i| parse_expression(i, depth + 1), ws(char(')'))))(rest)?;
        return Ok((rest, (Expr::grouped(inner), grow(input, height)?)));
    }

    alt((map(parse_number, leaf), map(parse_cell_ref, leaf)))(input)
}

/// Parse a unary expression (prefix - or +)
fn parse_unary(input: &str, depth: usize) -> IResult<&str, Node> {
    let (input, _) = multispace0(input)?;
    check_depth(input, depth)?;

    let (rest, sign) = opt(alt((
        map(char('-'), |_| UnaryOp::Neg),
        map(char('+'), |_| UnaryOp::Pos),
    )))(input)?;

    match sign {
        Some(op) => {
            let (rest, (operand, height)) = parse_unary(rest, depth + 1)?;
            Ok((rest, (Expr::unary(op, operand), grow(input, height)?)))
        }
        None => parse_primary(rest, depth),
    }
}

/// Left-associative chain of `operand (operator operand)*`
fn parse_chain(
    input: &str,
    depth: usize,
    operand: fn(&str, usize) -> IResult<&str, Node>,
    operator: fn(&str) -> IResult<&str, BinaryOp>,
) -> IResult<&str, Node> {
    let (mut input, (mut acc, mut height)) = operand(input, depth)?;

    loop {
        match ws(operator)(input) {
            Ok((rest, op)) => {
                let (rest, (rhs, rhs_height)) = cut(|i| operand(i, depth))(rest)?;
                height = grow(input, height.max(rhs_height))?;
                acc = Expr::binary(acc, op, rhs);
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, (acc, height))),
            Err(e) => return Err(e),
        }
    }
}

/// Parse multiplicative expressions (*, /)
fn parse_multiplicative(input: &str, depth: usize) -> IResult<&str, Node> {
    parse_chain(input, depth, parse_unary, parse_multiplicative_op)
}

/// Parse additive expressions (+, -)
fn parse_additive(input: &str, depth: usize) -> IResult<&str, Node> {
    parse_chain(input, depth, parse_multiplicative, parse_additive_op)
}

/// Parse a complete expression at nesting level `depth`
fn parse_expression(input: &str, depth: usize) -> IResult<&str, Node> {
    let (input, _) = multispace0(input)?;
    parse_additive(input, depth)
}

// =============================================================================
// Public API
// =============================================================================

/// Parse a formula body (without the leading `=`) into an AST
///
/// The whole input must be consumed; trailing garbage is an error.
pub fn parse_formula(input: &str) -> Result<Expr, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::new("empty formula", 0));
    }

    match parse_expression(input, 1) {
        Ok((remaining, (expr, _))) => {
            let remaining = remaining.trim_start();
            if remaining.is_empty() {
                Ok(expr)
            } else {
                Err(ParseError::new(
                    format!("unexpected input '{}'", remaining.trim_end()),
                    input.len() - remaining.len(),
                ))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(describe(input, e)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::new("incomplete formula", input.len())),
    }
}

fn describe(input: &str, e: Error<&str>) -> ParseError {
    let position = input.len() - e.input.len();
    let rest = e.input.trim();

    let message = match e.code {
        ErrorKind::Verify => {
            let label: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            format!("reference '{}' is outside the sheet", label)
        }
        ErrorKind::Float => "number out of range".to_string(),
        ErrorKind::TooLarge => "formula nested too deeply".to_string(),
        _ if rest.is_empty() => "unexpected end of formula".to_string(),
        _ => format!("unexpected input '{}'", rest),
    };

    ParseError::new(message, position)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Expr, ParseError> {
        parse_formula(input)
    }

    fn cell(a1: &str) -> Expr {
        Expr::CellRef(CellCoord::from_a1(a1).unwrap())
    }

    #[test]
    fn test_number() {
        assert_eq!(parse("123"), Ok(Expr::Number(123.0)));
        assert_eq!(parse("2.75"), Ok(Expr::Number(2.75)));
        assert_eq!(parse(".5"), Ok(Expr::Number(0.5)));
        assert_eq!(parse("2."), Ok(Expr::Number(2.0)));
        assert_eq!(parse("1e10"), Ok(Expr::Number(1e10)));
        assert_eq!(parse("1.5E-3"), Ok(Expr::Number(1.5e-3)));
        assert_eq!(
            parse("-5"),
            Ok(Expr::unary(UnaryOp::Neg, Expr::Number(5.0)))
        );
    }

    #[test]
    fn test_cell_reference_case_insensitive() {
        assert_eq!(parse("A1"), Ok(cell("A1")));
        assert_eq!(parse("b12"), Ok(cell("B12")));
        assert_eq!(parse("  z99  "), Ok(cell("Z99")));
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 = 1 + (2 * 3)
        assert_eq!(
            parse("1 + 2 * 3"),
            Ok(Expr::binary(
                Expr::Number(1.0),
                BinaryOp::Add,
                Expr::binary(Expr::Number(2.0), BinaryOp::Mul, Expr::Number(3.0)),
            ))
        );
    }

    #[test]
    fn test_left_associative() {
        // 8 - 2 - 1 = (8 - 2) - 1
        assert_eq!(
            parse("8-2-1"),
            Ok(Expr::binary(
                Expr::binary(Expr::Number(8.0), BinaryOp::Sub, Expr::Number(2.0)),
                BinaryOp::Sub,
                Expr::Number(1.0),
            ))
        );
        // 8 / 2 / 2 = (8 / 2) / 2
        assert_eq!(
            parse("8/2/2"),
            Ok(Expr::binary(
                Expr::binary(Expr::Number(8.0), BinaryOp::Div, Expr::Number(2.0)),
                BinaryOp::Div,
                Expr::Number(2.0),
            ))
        );
    }

    #[test]
    fn test_parentheses() {
        assert_eq!(
            parse("(A1 + 2) * b3"),
            Ok(Expr::binary(
                Expr::grouped(Expr::binary(cell("A1"), BinaryOp::Add, Expr::Number(2.0))),
                BinaryOp::Mul,
                cell("B3"),
            ))
        );
        assert!(parse("((((1))))").is_ok());
    }

    #[test]
    fn test_division_by_zero_is_not_a_parse_error() {
        assert!(parse("1/0").is_ok());
        assert!(parse("A1/(B1-B1)").is_ok());
    }

    #[test]
    fn test_unbalanced_parentheses() {
        let err = parse("(1 + 2").unwrap_err();
        assert_eq!(err.message, "unexpected end of formula");

        let err = parse("1 + 2)").unwrap_err();
        assert_eq!(err.message, "unexpected input ')'");
        assert_eq!(err.position, 5);
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(parse("1 & 2").is_err());
        assert!(parse("SUM(A1)").is_err());
        assert!(parse("$A$1").is_err());
        assert!(parse("A1:B2").is_err());
        assert!(parse("\"text\"").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("* 2").is_err());
    }

    #[test]
    fn test_trailing_garbage() {
        let err = parse("A1 B1").unwrap_err();
        assert_eq!(err.message, "unexpected input 'B1'");
        assert_eq!(err.position, 3);

        assert!(parse("1A1").is_err());
        assert!(parse("A1B").is_err());
        assert!(parse("2e").is_err());
    }

    #[test]
    fn test_out_of_range_reference() {
        let err = parse("A1 + A100").unwrap_err();
        assert_eq!(err.message, "reference 'A100' is outside the sheet");
        assert_eq!(err.position, 5);

        assert!(parse("AA1").is_err());
        assert!(parse("A0").is_err());
    }

    #[test]
    fn test_empty_formula() {
        assert_eq!(parse("").unwrap_err().message, "empty formula");
        assert_eq!(parse("   ").unwrap_err().message, "empty formula");
    }

    #[test]
    fn test_nesting_limit_parentheses() {
        let depth = MAX_NESTING - 1;
        let ok = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse(&ok).is_ok());

        let depth = MAX_NESTING;
        let err = parse(&format!("{}1{}", "(".repeat(depth), ")".repeat(depth))).unwrap_err();
        assert_eq!(err.message, "formula nested too deeply");
        assert_eq!(err.position, MAX_NESTING);
    }

    #[test]
    fn test_nesting_limit_signs() {
        assert!(parse(&format!("{}1", "-".repeat(MAX_NESTING - 1))).is_ok());

        let err = parse(&format!("{}1", "-+".repeat(MAX_NESTING))).unwrap_err();
        assert_eq!(err.message, "formula nested too deeply");
    }

    #[test]
    fn test_nesting_limit_operator_chain() {
        let terms = vec!["A1"; MAX_NESTING];
        assert!(parse(&terms.join("+")).is_ok());

        let terms = vec!["A1"; MAX_NESTING + 1];
        let err = parse(&terms.join("*")).unwrap_err();
        assert_eq!(err.message, "formula nested too deeply");
    }

    #[test]
    fn test_very_deep_input_is_rejected_without_overflow() {
        let depth = 100_000;
        let nested = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse(&nested).unwrap_err().message, "formula nested too deeply");

        let signs = format!("{}1", "-".repeat(depth));
        assert_eq!(parse(&signs).unwrap_err().message, "formula nested too deeply");

        let chain = vec!["1"; depth].join("+");
        assert_eq!(parse(&chain).unwrap_err().message, "formula nested too deeply");
    }

    #[test]
    fn test_number_overflow() {
        assert_eq!(parse("1e999").unwrap_err().message, "number out of range");
    }
}
