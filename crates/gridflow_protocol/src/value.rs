//! Heterogeneous point values and quality codes.
//!
//! Every decoder and the script bridge go through this tagged union; nothing
//! else in the system pattern-matches on raw protocol payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar value as carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Declared scalar type of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Text,
}

impl Value {
    /// Numeric view. Bools map to 0/1, strings parse or fail.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(*f as i64),
            Value::Float(_) => None,
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Truthiness: false/0/""/"false" are false, everything else is true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0",
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
        }
    }

    /// Coerce into the declared type of a point. Returns `None` when the
    /// value cannot represent the target type (e.g. "abc" as float).
    pub fn coerce(&self, target: ValueType) -> Option<Value> {
        match target {
            ValueType::Bool => Some(Value::Bool(self.as_bool())),
            ValueType::Int => self.as_i64().map(Value::Int),
            ValueType::Float => self.as_f64().map(Value::Float),
            ValueType::Text => Some(Value::Text(self.to_string())),
        }
    }

    /// Apply linear scaling `raw * factor + offset` to numeric values.
    /// Non-numeric values pass through untouched.
    pub fn scaled(&self, factor: f64, offset: f64) -> Value {
        if factor == 1.0 && offset == 0.0 {
            return self.clone();
        }
        match self.as_f64() {
            Some(v) => Value::Float(v * factor + offset),
            None => self.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Why a value is marked bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadReason {
    /// Transport-level failure while acquiring the value.
    CommFailure,
    /// The raw payload could not be decoded into the declared type.
    Decode,
    /// The decoded value fell outside the configured min/max.
    OutOfRange,
    /// A virtual point's formula failed to evaluate.
    ScriptError,
    /// The value is older than its staleness budget.
    Stale,
    /// The owning worker is not connected.
    NotConnected,
}

/// Quality of a point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "q", content = "reason")]
pub enum Quality {
    Good,
    Uncertain,
    Bad(BadReason),
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, Quality::Bad(_))
    }

    /// Short wire tag used in published events.
    pub fn tag(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad(BadReason::CommFailure) => "bad/comm_failure",
            Quality::Bad(BadReason::Decode) => "bad/decode",
            Quality::Bad(BadReason::OutOfRange) => "bad/out_of_range",
            Quality::Bad(BadReason::ScriptError) => "bad/script_error",
            Quality::Bad(BadReason::Stale) => "bad/stale",
            Quality::Bad(BadReason::NotConnected) => "bad/not_connected",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}
