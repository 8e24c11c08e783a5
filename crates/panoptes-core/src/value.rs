//! Dynamic value carried in a [`crate::DataStore`] slot.

use std::collections::BTreeMap;

use serde::Serialize;

/// A decoded telemetry value.
///
/// Provider frames carry typed unions; drivers decode each arm into this
/// variant once and everything downstream (demux, sinks) works with it
/// without re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string slice if this is a `String` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as `u64` if it is an unsigned integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the nested map if this is a `Map` value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Builds a `Map` value out of string-to-string labels.
    pub fn labels(labels: impl IntoIterator<Item = (String, String)>) -> Self {
        Value::Map(
            labels
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        )
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

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::String(String::new()),
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Value::Uint(u)
                } else if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_numbers_keep_their_sign() {
        let v: Value = serde_json::json!(42u64).into();
        assert_eq!(v, Value::Uint(42));

        let v: Value = serde_json::json!(-7).into();
        assert_eq!(v, Value::Int(-7));

        let v: Value = serde_json::json!(1.5).into();
        assert_eq!(v, Value::Float(1.5));
    }

    #[test]
    fn json_nesting_decodes_elementwise() {
        let v: Value = serde_json::json!({"counters": {"in": 1, "out": 2}, "up": true}).into();
        let map = v.as_map().unwrap();
        assert_eq!(map["up"], Value::Bool(true));
        let counters = map["counters"].as_map().unwrap();
        assert_eq!(counters["in"], Value::Uint(1));
    }

    #[test]
    fn labels_builder() {
        let v = Value::labels([("name".to_owned(), "lo0".to_owned())]);
        assert_eq!(v.as_map().unwrap()["name"], Value::String("lo0".into()));
    }

    #[test]
    fn untagged_serialisation() {
        let v = Value::List(vec![Value::Uint(1), Value::String("a".into())]);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"[1,"a"]"#);
    }
}
