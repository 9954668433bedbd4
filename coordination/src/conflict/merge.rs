//! Automatic merge of concurrent values
//!
//! Arrays become their deduplicated union, strings are joined with
//! [`STRING_DELIMITER`], objects are merged recursively. Anything else is
//! incompatible and yields `None`.

use serde_json::{Map, Value};

pub const STRING_DELIMITER: &str = "\n";

/// Merge `incoming` into `base`. Object keys present in both keep the
/// incoming scalar.
pub fn merge_values(base: &Value, incoming: &Value) -> Option<Value> {
    match (base, incoming) {
        (Value::Null, other) | (other, Value::Null) => Some(other.clone()),
        (Value::Array(a), Value::Array(b)) => Some(Value::Array(union(a, b))),
        (Value::String(a), Value::String(b)) => {
            if a == b || b.is_empty() {
                Some(Value::String(a.clone()))
            } else if a.is_empty() {
                Some(Value::String(b.clone()))
            } else {
                Some(Value::String(format!("{a}{STRING_DELIMITER}{b}")))
            }
        }
        (Value::Object(a), Value::Object(b)) => Some(Value::Object(deep_merge(a, b))),
        (a, b) if a == b => Some(a.clone()),
        _ => None,
    }
}

/// Fold a sequence of values, oldest first
pub fn merge_all<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Value> {
    let mut iter = values.into_iter();
    let first = iter.next()?.clone();
    iter.try_fold(first, |acc, next| merge_values(&acc, next))
}

fn union(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut out = a.to_vec();
    for item in b {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn deep_merge(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut out = a.clone();
    for (key, incoming) in b {
        let merged = match (out.get(key), incoming) {
            (Some(Value::Object(x)), Value::Object(y)) => Value::Object(deep_merge(x, y)),
            (Some(Value::Array(x)), Value::Array(y)) => Value::Array(union(x, y)),
            _ => incoming.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}
