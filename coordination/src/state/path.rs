//! Dot-separated path addressing into a JSON document
//!
//! `plan.phases.0.status` walks objects by key and arrays by index. Writes
//! never touch the input document: [`with_value`] returns a new document and
//! leaves every earlier snapshot intact.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Empty segment in path {0}")]
    EmptySegment(String),

    #[error("Index {index} out of bounds at {path}")]
    IndexOutOfBounds { path: String, index: usize },
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// First segment of a path
pub fn root(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Whether `a` and `b` address the same node or one contains the other
pub fn overlaps(a: &str, b: &str) -> bool {
    is_within(a, b) || is_within(b, a)
}

/// Whether `path` equals `ancestor` or lies beneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'.')
}

pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    segments(path).try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Copy of `doc` with `value` written at `path`, creating intermediate
/// objects. A scalar in the way is replaced by an object.
pub fn with_value(doc: &Value, path: &str, value: Value) -> Result<Value, PathError> {
    validate(path)?;
    let mut next = doc.clone();
    write(&mut next, path, value)?;
    Ok(next)
}

fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if segments(path).any(str::is_empty) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(())
}

fn write(doc: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts.split_last().ok_or(PathError::Empty)?;

    let mut node = doc;
    for (depth, segment) in parents.iter().enumerate() {
        node = child_mut(node, segment, &parts[..=depth])?;
    }

    match node {
        Value::Array(items) => {
            let index = parse_index(last, items.len(), path)?;
            items[index] = value;
        }
        other => {
            ensure_object(other).insert((*last).to_string(), value);
        }
    }
    Ok(())
}

fn child_mut<'a>(node: &'a mut Value, segment: &str, walked: &[&str]) -> Result<&'a mut Value, PathError> {
    if let Value::Array(items) = node {
        let index = parse_index(segment, items.len(), &walked.join("."))?;
        return Ok(&mut items[index]);
    }
    let map = ensure_object(node);
    let child = map
        .entry(segment.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !matches!(child, Value::Object(_) | Value::Array(_)) {
        *child = Value::Object(Map::new());
    }
    Ok(child)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn parse_index(segment: &str, len: usize, path: &str) -> Result<usize, PathError> {
    match segment.parse::<usize>() {
        Ok(index) if index < len => Ok(index),
        Ok(index) => Err(PathError::IndexOutOfBounds {
            path: path.to_string(),
            index,
        }),
        Err(_) => Err(PathError::IndexOutOfBounds {
            path: path.to_string(),
            index: len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_walks_objects_and_arrays() {
        let doc = json!({"plan": {"phases": [{"id": "p1", "status": "pending"}]}});
        assert_eq!(get(&doc, "plan.phases.0.id"), Some(&json!("p1")));
        assert_eq!(get(&doc, "plan.phases.1"), None);
        assert_eq!(get(&doc, "plan.missing.deeper"), None);
        assert_eq!(get(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_write_creates_intermediates() {
        let doc = json!({});
        let next = with_value(&doc, "context.memory.topic", json!("rust")).unwrap();
        assert_eq!(next, json!({"context": {"memory": {"topic": "rust"}}}));
    }

    #[test]
    fn test_write_leaves_snapshot_untouched() {
        let doc = json!({"a": {"b": 1}});
        let next = with_value(&doc, "a.b", json!(2)).unwrap();
        assert_eq!(doc["a"]["b"], 1);
        assert_eq!(next["a"]["b"], 2);
    }

    #[test]
    fn test_write_replaces_scalar_in_the_way() {
        let doc = json!({"a": 5});
        let next = with_value(&doc, "a.b", json!(true)).unwrap();
        assert_eq!(next, json!({"a": {"b": true}}));
    }

    #[test]
    fn test_write_into_array() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}]});
        let next = with_value(&doc, "items.1.id", json!(3)).unwrap();
        assert_eq!(next["items"][1]["id"], 3);

        let err = with_value(&doc, "items.5", json!(0)).unwrap_err();
        assert!(matches!(err, PathError::IndexOutOfBounds { index: 5, .. }));
    }

    #[test]
    fn test_invalid_paths() {
        assert_eq!(with_value(&json!({}), "", json!(1)), Err(PathError::Empty));
        assert!(matches!(
            with_value(&json!({}), "a..b", json!(1)),
            Err(PathError::EmptySegment(_))
        ));
    }

    #[test]
    fn test_overlap() {
        assert!(overlaps("plan", "plan.phases"));
        assert!(overlaps("plan.phases", "plan"));
        assert!(overlaps("status", "status"));
        assert!(!overlaps("plan", "planner"));
        assert!(!overlaps("context.facts", "context.decisions"));
        assert_eq!(root("agents.a1.status"), "agents");
    }
}
