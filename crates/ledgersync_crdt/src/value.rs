//! Cell values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag for [`Value::Null`] on the wire.
pub const TAG_NULL: u8 = 0;
/// Type tag for [`Value::Number`] on the wire.
pub const TAG_NUMBER: u8 = 1;
/// Type tag for [`Value::String`] on the wire.
pub const TAG_STRING: u8 = 2;

/// A scalar stored in a cell.
///
/// Numbers compare by bit pattern, so equality is total and `-0.0` differs
/// from `0.0`. NaN is never produced by the codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null (a cleared cell, or a tombstone flag set to null).
    Null,
    /// A number. Amounts are stored as integer cents but travel as `f64`.
    Number(f64),
    /// UTF-8 text.
    String(String),
}

impl Value {
    /// Wire tag for this variant.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Number(_) => TAG_NUMBER,
            Value::String(_) => TAG_STRING,
        }
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the number, if this is one.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
