//! Message envelope exchanged between endpoints and protocol handlers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Envelope classification, orthogonal to the envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Normal,
    Discovery,
}

/// Value type that can be carried as an envelope argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Outcome signal for handlers that only need to report success or failure.
///
/// Unlike a full [`Envelope`] it carries no payload, and it compares by
/// value so it survives serialization and process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Build the `<kind>_success` / `<kind>_failed` reply envelope
    pub fn reply(&self, kind: &str) -> Envelope {
        match self {
            Outcome::Success => Envelope::success(kind),
            Outcome::Failed => Envelope::failed(kind),
        }
    }
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Success
        } else {
            Outcome::Failed
        }
    }
}

/// Typed, self-describing unit of data.
///
/// The kind is always stored lower-cased so dispatch on it is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    category: Category,
    #[serde(default)]
    args: Vec<Value>,
}

impl Envelope {
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self::with_args(kind, Vec::new())
    }

    pub fn with_args(kind: impl AsRef<str>, args: Vec<Value>) -> Self {
        Self {
            kind: kind.as_ref().to_lowercase(),
            category: Category::Normal,
            args,
        }
    }

    /// Envelope with no arguments
    pub fn simple(kind: impl AsRef<str>) -> Self {
        Self::new(kind)
    }

    /// `<kind>_success`
    pub fn success(kind: impl AsRef<str>) -> Self {
        Self::new(format!("{}_success", kind.as_ref()))
    }

    /// `<kind>_failed`
    pub fn failed(kind: impl AsRef<str>) -> Self {
        Self::new(format!("{}_failed", kind.as_ref()))
    }

    /// Builder-style argument append
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Builder-style category
    pub fn in_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Case-insensitive kind comparison
    pub fn is(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    pub fn set_kind(&mut self, kind: impl AsRef<str>) {
        self.kind = kind.as_ref().to_lowercase();
    }

    pub fn set_args(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    pub fn set_category(&mut self, category: Category) {
        self.category = category;
    }

    pub(crate) fn normalize(mut self) -> Self {
        self.kind = self.kind.to_lowercase();
        self
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new("q")
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q [{}::{:?}]", self.kind, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_decoded_kind() {
        let env = Envelope {
            kind: "MiXeD".to_string(),
            category: Category::Normal,
            args: vec![],
        }
        .normalize();
        assert_eq!(env.kind(), "mixed");
    }

    #[test]
    fn test_display() {
        let env = Envelope::new("Ping").arg(1);
        assert_eq!(env.to_string(), "Q [ping::[Int(1)]]");
    }
}
