//! Field values and their text encoding.
//!
//! Values travel and are logged as tagged strings:
//!
//! | value            | encoded    |
//! |------------------|------------|
//! | `Null`           | `0:`       |
//! | `Number(-500.0)` | `N:-500`   |
//! | `String("rent")` | `S:rent`   |

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors from decoding an encoded value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// The prefix before `:` is not a known type tag.
    #[error("unknown value type in {0:?}")]
    UnknownTag(String),
    /// An `N:` value whose payload is not a number.
    #[error("invalid number in {0:?}")]
    InvalidNumber(String),
}

/// A scalar stored in one field of one row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Any number; integers are represented exactly up to 2^53.
    Number(f64),
    /// Text.
    String(String),
}

impl Value {
    /// Encode as a tagged string.
    pub fn encode(&self) -> String {
        match self {
            Value::Null => "0:".to_string(),
            Value::Number(n) => format!("N:{n}"),
            Value::String(s) => format!("S:{s}"),
        }
    }

    /// Decode a tagged string produced by [`encode`](Value::encode).
    pub fn decode(encoded: &str) -> Result<Self, EncodingError> {
        let (tag, payload) = encoded
            .split_once(':')
            .ok_or_else(|| EncodingError::UnknownTag(encoded.to_string()))?;

        match tag {
            "0" => Ok(Value::Null),
            "N" => payload
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| EncodingError::InvalidNumber(encoded.to_string())),
            "S" => Ok(Value::String(payload.to_string())),
            _ => Err(EncodingError::UnknownTag(encoded.to_string())),
        }
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The text, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Number(if b { 1.0 } else { 0.0 })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
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
