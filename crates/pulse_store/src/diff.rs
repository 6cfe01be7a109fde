//! Minimal structural diff between two JSON-like trees.
//!
//! Used to diff environment snapshots against the current environment and to
//! diff add-on inventories. `None` means "identical" and callers must treat
//! it that way, never as an empty object.

use serde_json::{Map, Value};

/// Marker emitted for keys removed relative to the baseline.
pub const TOMBSTONE: Value = Value::Null;

/// Compute the minimal difference of `to` relative to `from`.
///
/// - Keys only in `to` appear with `to`'s value.
/// - Keys in both recurse when both sides are objects; the recursive result
///   is included only if non-empty.
/// - Unequal scalars/arrays appear with `to`'s value; equal values are
///   omitted.
/// - With `include_tombstones`, keys only in `from` map to [`TOMBSTONE`].
/// - A missing baseline returns `to` unchanged (no needless copy of a
///   recomputed diff for the common "no prior state" case).
pub fn tree_diff(from: Option<&Value>, to: &Value, include_tombstones: bool) -> Option<Value> {
    let Some(from) = from else {
        return Some(to.clone());
    };
    diff_value(from, to, include_tombstones)
}

fn diff_value(from: &Value, to: &Value, include_tombstones: bool) -> Option<Value> {
    match (from.as_object(), to.as_object()) {
        (Some(from_map), Some(to_map)) => {
            let mut out = Map::new();
            for (key, to_val) in to_map {
                match from_map.get(key) {
                    None => {
                        out.insert(key.clone(), to_val.clone());
                    }
                    Some(from_val) => {
                        if from_val.is_object() && to_val.is_object() {
                            if let Some(nested) = diff_value(from_val, to_val, include_tombstones)
                            {
                                out.insert(key.clone(), nested);
                            }
                        } else if from_val != to_val {
                            out.insert(key.clone(), to_val.clone());
                        }
                    }
                }
            }
            if include_tombstones {
                for key in from_map.keys() {
                    if !to_map.contains_key(key) {
                        out.insert(key.clone(), TOMBSTONE);
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => {
            if from == to {
                None
            } else {
                Some(to.clone())
            }
        }
    }
}
