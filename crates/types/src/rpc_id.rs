//! JSON-RPC message identifiers.
//!
//! JSON-RPC 2.0 allows a message id to be null, a number, or a string.
//! [`RpcMsgId`] is the closed sum of those three shapes, with a total order
//! (`Null < Integer < Text`, then the natural order within a variant) and
//! hashing defined across variants so ids can key response-correlation maps.

use serde_json::Value;
use std::fmt;

use crate::{Error, Result};

/// A JSON-RPC message id.
///
/// Variant order is significant: the derived `Ord` yields
/// `Null < Integer(_) < Text(_)`, with numeric order inside `Integer` and
/// lexicographic order inside `Text`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RpcMsgId {
    /// The JSON `null` id.
    #[default]
    Null,
    /// An integral numeric id.
    Integer(i64),
    /// A string id.
    Text(String),
}

impl RpcMsgId {
    /// Whether this id is the null id.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts a generic JSON value into an id.
    ///
    /// Fails with [`Error::BadArgs`] unless the value is null, a number with
    /// no fractional part, or a string.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        Ok(Self::Integer(f as i64))
                    } else {
                        Err(Error::BadArgs(format!(
                            "json-rpc id must be an integral number, got {f}"
                        )))
                    }
                } else {
                    Err(Error::BadArgs("json-rpc id number out of range".into()))
                }
            }
            Value::String(s) => Ok(Self::Text(s.clone())),
            other => Err(Error::BadArgs(format!(
                "json-rpc id must be null, a number or a string, got {other}"
            ))),
        }
    }

    /// Renders the id back into a generic JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.clone()),
        }
    }

    /// The integer value of this id.
    ///
    /// Returns the value for `Integer`, attempts a parse for `Text`, and
    /// falls back to 0 for `Null` or an unparseable string.
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Null => 0,
            Self::Integer(i) => *i,
            Self::Text(s) => s.parse().unwrap_or(0),
        }
    }
}

impl From<i64> for RpcMsgId {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<u64> for RpcMsgId {
    fn from(i: u64) -> Self {
        Self::Integer(i as i64)
    }
}

// A string input is a string id. (Do not be tempted to "helpfully" parse
// numeric strings into Integer: `"1"` and `1` are distinct JSON-RPC ids.)
impl From<String> for RpcMsgId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for RpcMsgId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl fmt::Display for RpcMsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}
