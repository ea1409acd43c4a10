//! Canonical scalar value representation shared by statements, sources and
//! runtime stages.
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};

/// Scalar value flowing through sources, predicates and projections.
///
/// Serialized untagged so JSON literals map directly onto variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
}

/// Target types accepted by casts and reported by column schemas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Boolean column.
    Bool,
    /// Integer column.
    Int,
    /// Floating point column.
    Float,
    /// Text column.
    String,
}

impl ValueType {
    /// Lower-case type name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    /// Lower-case type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
        }
    }

    /// Returns true for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Predicate truthiness: only `TRUE` passes a filter.
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    /// SQL comparison; `None` when either side is NULL or the types are not
    /// comparable.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used to sort join keys: NULL first, then booleans,
    /// numbers, and strings.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(value: &Value) -> u8 {
            match value {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) => 2,
                Value::String(_) => 3,
            }
        }
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            _ => self
                .sql_cmp(other)
                .unwrap_or_else(|| rank(self).cmp(&rank(other))),
        }
    }

    /// Converts the value to `ty`; NULL casts to NULL.
    pub fn cast(&self, ty: ValueType) -> Result<Value> {
        let invalid = || QuarryError::InvalidCast {
            from: self.type_name(),
            to: ty.name(),
        };
        let out = match (self, ty) {
            (Value::Null, _) => Value::Null,
            (Value::Bool(v), ValueType::Bool) => Value::Bool(*v),
            (Value::Bool(v), ValueType::Int) => Value::Int(i64::from(*v)),
            (Value::Bool(v), ValueType::String) => Value::String(v.to_string()),
            (Value::Int(v), ValueType::Bool) => Value::Bool(*v != 0),
            (Value::Int(v), ValueType::Int) => Value::Int(*v),
            (Value::Int(v), ValueType::Float) => Value::Float(*v as f64),
            (Value::Int(v), ValueType::String) => Value::String(v.to_string()),
            (Value::Float(v), ValueType::Int) if v.is_finite() => Value::Int(v.trunc() as i64),
            (Value::Float(v), ValueType::Float) => Value::Float(*v),
            (Value::Float(v), ValueType::String) => Value::String(v.to_string()),
            (Value::String(s), ValueType::String) => Value::String(s.clone()),
            (Value::String(s), ValueType::Int) => {
                Value::Int(s.trim().parse::<i64>().map_err(|_| invalid())?)
            }
            (Value::String(s), ValueType::Float) => {
                Value::Float(s.trim().parse::<f64>().map_err(|_| invalid())?)
            }
            (Value::String(s), ValueType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        };
        Ok(out)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}
