//! Walkers over the values tree.
//!
//! Values, manifests, and diffs all share one representation: a
//! `serde_json::Value` tree. YAML documents are transcoded into it on decode
//! so that a single set of walkers (merge, diff, chained get) serves both
//! chart values and manifest items.

use crate::error::{EngineError, Result};
use serde_json::{Map, Value};

/// Deep-merges `overlay` into `base` and returns the result.
///
/// Maps merge key-by-key recursively; any other value (scalar, list, null)
/// in the overlay replaces the base value outright. `base` is returned
/// unchanged when the overlay is null.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                match out.get(k) {
                    Some(existing) => {
                        let merged = merge(existing, v);
                        out.insert(k.clone(), merged);
                    }
                    None => {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
        (b, Value::Null) => b.clone(),
        (_, o) => o.clone(),
    }
}

/// Computes the structural delta between two value trees.
///
/// The result is a map mirroring the shape of the change set:
/// - a key present in both sides with differing non-map values records the
///   new value;
/// - nested maps recurse, and the sub-map is included only when non-empty;
/// - a key missing from the new side records `null`;
/// - a key missing from the old side records the new value.
///
/// An empty result map means the trees are structurally equal.
pub fn diff(old: &Value, new: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let empty = Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    for (k, ov) in old_map {
        match new_map.get(k) {
            None => {
                out.insert(k.clone(), Value::Null);
            }
            Some(nv) => {
                if ov.is_object() && nv.is_object() {
                    let sub = diff(ov, nv);
                    if !sub.is_empty() {
                        out.insert(k.clone(), Value::Object(sub));
                    }
                } else if ov != nv {
                    out.insert(k.clone(), nv.clone());
                }
            }
        }
    }
    for (k, nv) in new_map {
        if !old_map.contains_key(k) {
            out.insert(k.clone(), nv.clone());
        }
    }
    out
}

/// Walks `path` through nested maps and returns the value at the leaf.
pub fn chain_get<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for key in path {
        cur = cur.as_object()?.get(*key)?;
    }
    Some(cur)
}

/// Like [`chain_get`] but requires the leaf to be a string.
pub fn chain_get_str<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str> {
    chain_get(value, path)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::MissingGlobal(path.join(".")))
}

/// Transcodes a YAML document into the JSON value tree.
///
/// Non-string map keys are stringified on the way through, matching what
/// the Kubernetes API server would hand back for the same document.
pub fn yaml_to_value(text: &str) -> Result<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    Ok(serde_json::to_value(yaml)?)
}
