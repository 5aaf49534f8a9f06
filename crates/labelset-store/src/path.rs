//! Dotted field paths over JSON documents.
//!
//! Reads traverse arrays the way the query engine expects: a path segment
//! applied to an array is applied to each element and the results collected.

use serde_json::{Map, Value};

use labelset_core::{Error, Result};

/// Resolve `path` against `doc`. `None` means the path is missing.
pub fn get_path(doc: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    let parts: Vec<&str> = path.split('.').collect();
    get_parts(doc, &parts)
}

fn get_parts(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map.get(*head).and_then(|v| get_parts(v, rest)),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return items.get(index).and_then(|v| get_parts(v, rest));
            }
            let collected: Vec<Value> = items.iter().filter_map(|v| get_parts(v, parts)).collect();
            Some(Value::Array(collected))
        }
        _ => None,
    }
}

/// Set `path` on `doc`, creating intermediate objects as needed.
///
/// A segment that lands on an array is applied per element: a list value
/// with one entry per element is zipped against the array, any other value
/// is written to every element.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    // Only strict assignment can fail
    let _ = assign(doc, &parts, value, false);
}

/// Like [`set_path`], but a path that crosses an array must be given one
/// value per element (or null, which clears every element).
pub fn try_set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    assign(doc, &parts, value, true)
        .map_err(|msg| Error::Schema(format!("cannot set '{}': {}", path, msg)))
}

fn assign(
    target: &mut Value,
    parts: &[&str],
    value: Value,
    strict: bool,
) -> std::result::Result<(), String> {
    let Some((head, rest)) = parts.split_first() else {
        *target = value;
        return Ok(());
    };
    if let Value::Array(items) = target {
        if let Ok(index) = head.parse::<usize>() {
            let len = items.len();
            return match items.get_mut(index) {
                Some(item) => assign(item, rest, value, strict),
                None => Err(format!("index {} out of range for {} elements", index, len)),
            };
        }
        return match value {
            Value::Array(values) if values.len() == items.len() => {
                for (item, v) in items.iter_mut().zip(values) {
                    assign(item, parts, v, strict)?;
                }
                Ok(())
            }
            other if !strict || other.is_null() => {
                for item in items.iter_mut() {
                    assign(item, parts, other.clone(), strict)?;
                }
                Ok(())
            }
            other => Err(format!(
                "expected a list of {} values, got {}",
                items.len(),
                other
            )),
        };
    }
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    match target {
        Value::Object(map) => {
            let entry = map.entry(head.to_string()).or_insert(Value::Null);
            assign(entry, rest, value, strict)
        }
        _ => Ok(()),
    }
}

/// Remove `path` from `doc`. Returns the removed value, if any.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut().and_then(|m| m.remove(path)),
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.remove(leaf)
        }
    }
}

/// Copy the sub-document addressed by `path` from `src` into `dst`,
/// preserving the nesting. Arrays along the path are projected per element.
pub fn include_path(src: &Value, dst: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    if let Some(projected) = project_parts(src, &parts) {
        deep_merge(dst, projected);
    }
}

fn project_parts(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => {
            let inner = map.get(*head).and_then(|v| project_parts(v, rest))?;
            let mut out = Map::new();
            out.insert(head.to_string(), inner);
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|v| project_parts(v, parts)).collect(),
        )),
        _ => None,
    }
}

/// Recursively merge `src` into `dst`; objects merge key-wise, everything
/// else overwrites.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(dst_items), Value::Array(src_items))
            if dst_items.len() == src_items.len() =>
        {
            for (d, s) in dst_items.iter_mut().zip(src_items) {
                deep_merge(d, s);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Flatten one level of arrays, the way `values(..., unwind)` reports
/// list-of-list results.
pub fn unwind_values(values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(unwind_values(items)),
            Value::Null => {}
            other => out.push(other),
        }
    }
    out
}
