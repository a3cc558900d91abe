//! Dynamically typed attribute values used by the condition evaluator.
//!
//! Values cross three boundaries: request attributes arrive as JSON, policy
//! conditions compute over them, and decision outputs are serialized back to
//! JSON. Equality is numeric-aware across `Int`/`Float` and strict across
//! disjoint sorts; ordering is only defined within a comparable sort.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, TimeDelta};

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Timestamp(DateTime<FixedOffset>),
    Duration(TimeDelta),
}

impl Value {
    /// The sort name used in type-mismatch diagnostics.
    pub fn sort(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Timestamp(_) => "timestamp",
            Value::Duration(_) => "duration",
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Serialize back to JSON. Timestamps render as RFC 3339 strings and
    /// durations as integral seconds with an `s` suffix, matching the wire
    /// representation of the corresponding literals.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Duration(d) => {
                let secs = d.num_seconds();
                let millis = d.num_milliseconds() - secs * 1000;
                if millis == 0 {
                    serde_json::Value::String(format!("{secs}s"))
                } else {
                    serde_json::Value::String(format!("{}ms", d.num_milliseconds()))
                }
            }
        }
    }

    /// Member lookup on maps. Any other sort has no members.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Map(fields) => fields.get(name),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Ordering within a comparable sort: numbers (int and double mix),
    /// strings, timestamps, durations. `None` for everything else.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_round_trip() {
        let src = json!({
            "name": "sally",
            "age": 34,
            "score": 0.5,
            "tags": ["a", "b"],
            "active": true,
            "missing": null,
        });
        let v = Value::from_json(&src);
        assert_eq!(v.to_json(), src);
    }

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_eq!(Value::Float(3.0), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Float(3.5));
    }

    #[test]
    fn test_disjoint_sorts_not_equal() {
        assert_ne!(Value::Int(1), Value::String("1".into()));
        assert_ne!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Null, Value::Bool(false));
    }

    #[test]
    fn test_compare_numeric() {
        assert_eq!(Value::Int(2).compare(&Value::Int(3)), Some(Ordering::Less));
        assert_eq!(
            Value::Int(2).compare(&Value::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int(1).compare(&Value::String("x".into())), None);
    }

    #[test]
    fn test_compare_strings_and_timestamps() {
        assert_eq!(
            Value::String("a".into()).compare(&Value::String("b".into())),
            Some(Ordering::Less)
        );
        let a = DateTime::parse_from_rfc3339("2021-02-10T09:00:00Z").unwrap();
        let b = DateTime::parse_from_rfc3339("2021-02-10T10:00:00Z").unwrap();
        assert_eq!(
            Value::Timestamp(a).compare(&Value::Timestamp(b)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_member_lookup() {
        let v = Value::from_json(&json!({"a": {"b": 1}}));
        let inner = v.member("a").unwrap();
        assert_eq!(inner.member("b"), Some(&Value::Int(1)));
        assert_eq!(inner.member("c"), None);
        assert_eq!(Value::Int(1).member("a"), None);
    }
}
