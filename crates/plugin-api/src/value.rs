//! Values returned by plugins and the results delivered to requesters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A value gathered by a metric plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Unsigned(u64),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:.6}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Unsigned(u64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Unsigned(v as u64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Outcome of one execution for one item, routed back to the requester
/// that owns the item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    /// Requester-assigned item identifier (0 for one-shot checks).
    pub item_id: u64,
    /// Gathered value, absent on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error message, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl ItemResult {
    /// Create a successful result.
    pub fn value(item_id: u64, value: Option<Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            item_id,
            value,
            error: None,
            timestamp,
        }
    }

    /// Create an error result.
    pub fn error(item_id: u64, error: impl ToString, timestamp: DateTime<Utc>) -> Self {
        Self {
            item_id,
            value: None,
            error: Some(error.to_string()),
            timestamp,
        }
    }

    /// Check if this result carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
