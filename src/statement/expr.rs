//! Scalar expressions used by projections, predicates and join conditions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};
use crate::exec::Row;
use crate::value::{Value, ValueType};

/// Possibly qualified column reference (`alias.column` or `column`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ColumnRef {
    /// Source alias the column belongs to, when written.
    pub qualifier: Option<String>,
    /// Column name.
    pub name: String,
}

impl ColumnRef {
    /// Parses `alias.column` or `column`.
    pub fn parse(text: &str) -> Self {
        match text.split_once('.') {
            Some((qualifier, name)) if !qualifier.is_empty() && !name.is_empty() => Self {
                qualifier: Some(qualifier.to_owned()),
                name: name.to_owned(),
            },
            _ => Self::unqualified(text),
        }
    }

    /// Column reference without a source qualifier.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    /// Column reference bound to `qualifier`.
    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }

    /// Whether this reference can name a column of the source `qualifier`.
    pub fn may_belong_to(&self, qualifier: &str) -> bool {
        self.qualifier.as_deref().map_or(true, |q| q == qualifier)
    }
}

impl From<String> for ColumnRef {
    fn from(value: String) -> Self {
        ColumnRef::parse(&value)
    }
}

impl From<ColumnRef> for String {
    fn from(value: ColumnRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl BinaryOp {
    /// SQL spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Column of the current row.
    Column(ColumnRef),
    /// Session variable (`@@name`).
    Variable(String),
    /// Constant.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical negation.
    Not(Box<Expr>),
    /// `IS NULL` / `IS NOT NULL`.
    IsNull {
        /// Tested expression.
        expr: Box<Expr>,
        /// True for `IS NOT NULL`.
        #[serde(default)]
        negated: bool,
    },
    /// Explicit conversion.
    Cast {
        /// Converted expression.
        expr: Box<Expr>,
        /// Target type.
        to: ValueType,
    },
}

/// Column reference expression parsed from `alias.column` or `column`.
pub fn col(text: &str) -> Expr {
    Expr::Column(ColumnRef::parse(text))
}

/// Literal expression.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

/// Session variable expression; a leading `@@` is optional.
pub fn var(name: &str) -> Expr {
    Expr::Variable(name.trim_start_matches("@@").to_owned())
}

impl Expr {
    fn binary(self, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    /// `self = rhs`
    pub fn eq(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Eq, rhs)
    }

    /// `self != rhs`
    pub fn ne(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Ne, rhs)
    }

    /// `self < rhs`
    pub fn lt(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Lt, rhs)
    }

    /// `self <= rhs`
    pub fn le(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Le, rhs)
    }

    /// `self > rhs`
    pub fn gt(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Gt, rhs)
    }

    /// `self >= rhs`
    pub fn ge(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Ge, rhs)
    }

    /// `self AND rhs`
    pub fn and(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::And, rhs)
    }

    /// `self OR rhs`
    pub fn or(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Or, rhs)
    }

    /// `self + rhs`
    pub fn add(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Add, rhs)
    }

    /// `self - rhs`
    pub fn sub(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Sub, rhs)
    }

    /// `self * rhs`
    pub fn mul(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// `self / rhs`
    pub fn div(self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Div, rhs)
    }

    /// `NOT self`
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// `self IS NOT NULL`
    pub fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// `CAST(self AS ty)`
    pub fn cast(self, to: ValueType) -> Expr {
        Expr::Cast {
            expr: Box::new(self),
            to,
        }
    }

    /// Visits every column reference in the tree, left to right.
    pub fn walk_columns<'a>(&'a self, visit: &mut dyn FnMut(&'a ColumnRef)) {
        match self {
            Expr::Column(col) => visit(col),
            Expr::Variable(_) | Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.walk_columns(visit);
                right.walk_columns(visit);
            }
            Expr::Not(inner) => inner.walk_columns(visit),
            Expr::IsNull { expr, .. } | Expr::Cast { expr, .. } => expr.walk_columns(visit),
        }
    }

    /// Whether the tree contains a constant.
    pub fn has_literal(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Column(_) | Expr::Variable(_) => false,
            Expr::Binary { left, right, .. } => left.has_literal() || right.has_literal(),
            Expr::Not(inner) => inner.has_literal(),
            Expr::IsNull { expr, .. } | Expr::Cast { expr, .. } => expr.has_literal(),
        }
    }

    /// Column references in the tree, left to right.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.walk_columns(&mut |c| out.push(c));
        out
    }

    /// Whether any column reference is qualified with `qualifier`.
    pub fn references(&self, qualifier: &str) -> bool {
        self.columns()
            .iter()
            .any(|c| c.qualifier.as_deref() == Some(qualifier))
    }

    /// Whether every column is qualified with `qualifier` and at least one
    /// column is present.
    pub fn only_references(&self, qualifier: &str) -> bool {
        let cols = self.columns();
        !cols.is_empty()
            && cols
                .iter()
                .all(|c| c.qualifier.as_deref() == Some(qualifier))
    }

    /// Splits a conjunction into its terms.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut terms = left.conjuncts();
                terms.extend(right.conjuncts());
                terms
            }
            other => vec![other],
        }
    }

    /// Joins terms with `AND`; `None` for an empty list.
    pub fn conjunction(terms: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        terms.into_iter().reduce(|acc, term| acc.and(term))
    }

    /// Returns both columns of a `column = column` comparison.
    pub fn as_column_equality(&self) -> Option<(&ColumnRef, &ColumnRef)> {
        match self {
            Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(l), Expr::Column(r)) => Some((l, r)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evaluates the expression against `row` with SQL NULL semantics.
    pub fn eval(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::Column(col) => row.get(col).cloned(),
            Expr::Variable(name) => row
                .get(&ColumnRef::unqualified(format!(
                    "@@{}",
                    name.to_ascii_lowercase()
                )))
                .cloned(),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = truth(left.eval(row)?, "AND")?;
                    if l == Some(false) {
                        return Ok(Value::Bool(false));
                    }
                    let r = truth(right.eval(row)?, "AND")?;
                    Ok(match (l, r) {
                        (_, Some(false)) => Value::Bool(false),
                        (Some(true), Some(true)) => Value::Bool(true),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Or => {
                    let l = truth(left.eval(row)?, "OR")?;
                    if l == Some(true) {
                        return Ok(Value::Bool(true));
                    }
                    let r = truth(right.eval(row)?, "OR")?;
                    Ok(match (l, r) {
                        (_, Some(true)) => Value::Bool(true),
                        (Some(false), Some(false)) => Value::Bool(false),
                        _ => Value::Null,
                    })
                }
                _ => apply_binary(*op, left.eval(row)?, right.eval(row)?),
            },
            Expr::Not(inner) => match truth(inner.eval(row)?, "NOT")? {
                Some(v) => Ok(Value::Bool(!v)),
                None => Ok(Value::Null),
            },
            Expr::IsNull { expr, negated } => {
                let is_null = expr.eval(row)?.is_null();
                Ok(Value::Bool(is_null != *negated))
            }
            Expr::Cast { expr, to } => expr.eval(row)?.cast(*to),
        }
    }
}

fn truth(value: Value, op: &'static str) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(v) => Ok(Some(v)),
        other => Err(QuarryError::TypeMismatch {
            op,
            left: other.type_name(),
            right: "bool",
        }),
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || QuarryError::TypeMismatch {
        op: op.symbol(),
        left: left.type_name(),
        right: right.type_name(),
    };
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = left.sql_cmp(&right).ok_or_else(mismatch)?;
            let hit = match op {
                BinaryOp::Eq => ord.is_eq(),
                BinaryOp::Ne => ord.is_ne(),
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(hit))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => Ok(int_arith(op, *a, *b)),
                (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                    let a = as_f64(&left);
                    let b = as_f64(&right);
                    Ok(match op {
                        BinaryOp::Add => Value::Float(a + b),
                        BinaryOp::Sub => Value::Float(a - b),
                        BinaryOp::Mul => Value::Float(a * b),
                        _ if b == 0.0 => Value::Null,
                        _ => Value::Float(a / b),
                    })
                }
                _ => Err(mismatch()),
            }
        }
        BinaryOp::And | BinaryOp::Or => Err(mismatch()),
    }
}

// Overflow and division by zero yield NULL rather than aborting the row.
fn int_arith(op: BinaryOp, a: i64, b: i64) -> Value {
    let out = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        _ => a.checked_div(b),
    };
    out.map_or(Value::Null, Value::Int)
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(v) => *v as f64,
        Value::Float(v) => *v,
        _ => f64::NAN,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
            if matches!(expr, Expr::Binary { .. }) {
                write!(f, "({expr})")
            } else {
                write!(f, "{expr}")
            }
        }
        match self {
            Expr::Column(col) => write!(f, "{col}"),
            Expr::Variable(name) => write!(f, "@@{name}"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Binary { op, left, right } => {
                operand(f, left)?;
                write!(f, " {} ", op.symbol())?;
                operand(f, right)
            }
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                operand(f, inner)
            }
            Expr::IsNull { expr, negated } => {
                operand(f, expr)?;
                f.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::Cast { expr, to } => write!(f, "CAST({expr} AS {to})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        let mut row = Row::new();
        row.push("t1.a", Value::Int(7));
        row.push("t1.b", Value::Null);
        row.push("t2.a", Value::Int(3));
        row.push("t2.name", Value::from("x"));
        row
    }

    #[test]
    fn parses_qualified_columns() {
        assert_eq!(ColumnRef::parse("t1.a"), ColumnRef::qualified("t1", "a"));
        assert_eq!(ColumnRef::parse("a"), ColumnRef::unqualified("a"));
        assert_eq!(ColumnRef::parse(".a"), ColumnRef::unqualified(".a"));
    }

    #[test]
    fn comparisons_follow_null_semantics() {
        let row = row();
        assert_eq!(col("t1.a").gt(lit(5)).eval(&row).unwrap(), Value::Bool(true));
        assert_eq!(col("t1.b").gt(lit(5)).eval(&row).unwrap(), Value::Null);
        assert_eq!(
            col("t1.b").gt(lit(5)).or(lit(true)).eval(&row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            col("t1.b").gt(lit(5)).and(lit(false)).eval(&row).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(col("t1.b").is_null().eval(&row).unwrap(), Value::Bool(true));
    }

    #[test]
    fn unqualified_lookup_detects_ambiguity() {
        let row = row();
        assert_eq!(col("name").eval(&row).unwrap(), Value::from("x"));
        let err = col("a").eval(&row).unwrap_err();
        assert_eq!(err.code(), "AmbiguousColumn");
        let err = col("t3.a").eval(&row).unwrap_err();
        assert_eq!(err.code(), "UnresolvedColumn");
    }

    #[test]
    fn variables_match_case_insensitively() {
        let mut row = Row::new();
        row.push("system.@@max_allowed_packet", Value::Int(4_194_304));
        assert_eq!(
            var("@@MAX_ALLOWED_PACKET").eval(&row).unwrap(),
            Value::Int(4_194_304)
        );
        assert_eq!(var("Max_Allowed_Packet").to_string(), "@@Max_Allowed_Packet");
    }

    #[test]
    fn arithmetic_and_type_errors() {
        let row = row();
        assert_eq!(col("t1.a").add(col("t2.a")).eval(&row).unwrap(), Value::Int(10));
        assert_eq!(col("t1.a").div(lit(0)).eval(&row).unwrap(), Value::Null);
        assert_eq!(
            col("t1.a").mul(lit(0.5)).eval(&row).unwrap(),
            Value::Float(3.5)
        );
        let err = col("t2.name").gt(lit(1)).eval(&row).unwrap_err();
        assert_eq!(err.code(), "TypeMismatch");
    }

    #[test]
    fn conjunct_splitting_and_equalities() {
        let expr = col("t1.k").eq(col("t2.k")).and(col("t1.a").gt(lit(1)));
        let terms = expr.conjuncts();
        assert_eq!(terms.len(), 2);
        let (l, r) = terms[0].as_column_equality().expect("equality");
        assert_eq!(l.to_string(), "t1.k");
        assert_eq!(r.to_string(), "t2.k");
        assert!(terms[1].as_column_equality().is_none());
        assert!(terms[1].only_references("t1"));
        assert!(!terms[0].only_references("t1"));
        assert_eq!(expr.to_string(), "(t1.k = t2.k) AND (t1.a > 1)");
    }

    #[test]
    fn json_shape() {
        let expr: Expr =
            serde_json::from_str(r#"{"binary":{"op":"gt","left":{"column":"t1.a"},"right":{"literal":5}}}"#)
                .unwrap();
        assert_eq!(expr, col("t1.a").gt(lit(5)));
    }
}
