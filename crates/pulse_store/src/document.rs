//! Differential document generation.
//!
//! One streaming pass over the ordered event window builds the
//! day -> environment -> measurement -> field tree; the environments map
//! renders the current snapshot in full and every other registered snapshot
//! as a per-group diff against it. The generator either returns a complete
//! document or fails with `NoDocument`; partial or unknown data is
//! represented as omission, never as fabricated zeros.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::diff::tree_diff;
use crate::environment::{render_groups, Environment, VERSION_TAG};
use crate::error::{Result, StoreError};
use crate::events::EventRow;
use crate::ids::EnvId;
use crate::storage::PulseStore;
use crate::time::{date_string, day_of_millis, EARLIEST_PING_MILLIS};
use crate::values::{AccumKind, FieldInfo, FieldValue, ValueType};

/// Document format version.
pub const DOCUMENT_VERSION: u32 = 3;

/// Inputs for one document generation run.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    /// Start of the event window, milliseconds since the epoch.
    pub since_millis: i64,
    /// Time of the previous successful upload, if any. Values older than
    /// the plausibility floor are dropped rather than emitted.
    pub last_ping_millis: Option<i64>,
    /// Time of this report.
    pub this_ping_millis: i64,
    /// The environment the device is in right now.
    pub current: Environment,
}

/// Generate the differential report document.
///
/// A zero-event window still yields a valid document with an empty `days`
/// object and a fully populated `environments.current`.
pub fn generate(store: &PulseStore, req: &DocumentRequest) -> Result<Value> {
    let current_hash = req
        .current
        .content_hash()
        .map_err(|e| StoreError::NoDocument(e.to_string()))?;

    let all = store.all_environments()?;
    let mut hash_by_id: HashMap<EnvId, String> = HashMap::with_capacity(all.len());

    let current_groups = render_groups(&req.current);
    let mut environments = Map::new();
    environments.insert(
        "current".to_string(),
        Value::Object(current_groups.clone()),
    );

    for (id, hash, env) in &all {
        hash_by_id.insert(*id, hash.clone());
        if *hash == current_hash {
            // This row *is* current; already rendered in full.
            continue;
        }
        let rendered = if env.version != req.current.version {
            // Cross-version comparison is not meaningful: the two sides do
            // not understand the same field set. Include fully, do not diff.
            Value::Object(render_groups(env))
        } else {
            diff_environment(&current_groups, &render_groups(env))
        };
        environments.insert(hash.clone(), rendered);
    }

    let events = store.events_since(req.since_millis)?;
    let fields = store.all_fields()?;
    let days = partition_days(&events, &fields, &hash_by_id);
    debug!(
        events = events.len(),
        days = days.len(),
        environments = environments.len(),
        "document generated"
    );

    let mut doc = Map::new();
    if let Some(last_ping) = req.last_ping_millis {
        if last_ping >= EARLIEST_PING_MILLIS {
            doc.insert(
                "lastPingDate".to_string(),
                json!(date_string(day_of_millis(last_ping))),
            );
        }
    }
    doc.insert(
        "thisPingDate".to_string(),
        json!(date_string(day_of_millis(req.this_ping_millis))),
    );
    doc.insert("version".to_string(), json!(DOCUMENT_VERSION));
    doc.insert("environments".to_string(), Value::Object(environments));
    doc.insert(
        "data".to_string(),
        json!({ "days": Value::Object(days), "last": {} }),
    );
    Ok(Value::Object(doc))
}

/// Per-group diff of an environment against current. A group with zero
/// differing fields is omitted entirely; an included group keeps its schema
/// tag even when the tag itself matches current's.
fn diff_environment(current: &Map<String, Value>, other: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (group, other_val) in other {
        match current.get(group) {
            None => {
                out.insert(group.clone(), other_val.clone());
            }
            Some(current_val) => {
                if let Some(mut d) = tree_diff(Some(current_val), other_val, false) {
                    if let (Some(diff_map), Some(other_map)) =
                        (d.as_object_mut(), other_val.as_object())
                    {
                        if !diff_map.contains_key(VERSION_TAG) {
                            if let Some(tag) = other_map.get(VERSION_TAG) {
                                diff_map.insert(VERSION_TAG.to_string(), tag.clone());
                            }
                        }
                    }
                    out.insert(group.clone(), d);
                }
            }
        }
    }
    Value::Object(out)
}

/// Walking partition over the (day, env, field)-ordered event stream.
///
/// Rows arrive sorted, so a single "current (day, env)" pair suffices:
/// whenever it changes, the accumulated per-environment object is flushed
/// into the day object, and on a day change the day object is flushed into
/// `days`. Rows referencing an unknown environment (pruned after being
/// referenced) or an unknown field are logged and skipped, never fatal.
fn partition_days(
    events: &[EventRow],
    fields: &HashMap<crate::ids::FieldId, FieldInfo>,
    hash_by_id: &HashMap<EnvId, String>,
) -> Map<String, Value> {
    let mut days = Map::new();
    let mut day_obj = Map::new();
    let mut env_obj = Map::new();
    let mut cursor: Option<(i64, EnvId)> = None;

    for row in events {
        if !hash_by_id.contains_key(&row.env) {
            warn!(env = %row.env, day = row.day, "event references unknown environment, skipped");
            continue;
        }
        let Some(field) = fields.get(&row.field) else {
            warn!(field = %row.field, day = row.day, "event references unknown field, skipped");
            continue;
        };

        match cursor {
            Some((day, env)) if day == row.day && env == row.env => {}
            Some((day, env)) => {
                flush_env(&mut day_obj, hash_by_id, env, &mut env_obj);
                if day != row.day {
                    days.insert(
                        date_string(day),
                        Value::Object(std::mem::take(&mut day_obj)),
                    );
                }
                cursor = Some((row.day, row.env));
            }
            None => {
                cursor = Some((row.day, row.env));
            }
        }

        accumulate(&mut env_obj, field, &row.value);
    }

    if let Some((day, env)) = cursor {
        flush_env(&mut day_obj, hash_by_id, env, &mut env_obj);
        days.insert(date_string(day), Value::Object(day_obj));
    }
    days
}

fn flush_env(
    day_obj: &mut Map<String, Value>,
    hash_by_id: &HashMap<EnvId, String>,
    env: EnvId,
    env_obj: &mut Map<String, Value>,
) {
    if env_obj.is_empty() {
        return;
    }
    if let Some(hash) = hash_by_id.get(&env) {
        day_obj.insert(hash.clone(), Value::Object(std::mem::take(env_obj)));
    } else {
        env_obj.clear();
    }
}

/// Route one row into its measurement object, creating the object (with its
/// schema tag) on first use within the (day, env) group.
fn accumulate(env_obj: &mut Map<String, Value>, field: &FieldInfo, value: &FieldValue) {
    let measurement = env_obj
        .entry(field.measurement_name.clone())
        .or_insert_with(|| json!({ VERSION_TAG: field.measurement_version }));
    let Some(measurement) = measurement.as_object_mut() else {
        return;
    };

    match field.kind {
        AccumKind::Last | AccumKind::Counter => {
            measurement.insert(field.name.clone(), value_json(field, value));
        }
        AccumKind::DiscreteAppend => {
            let entry = measurement
                .entry(field.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(value_json(field, value));
            }
        }
        AccumKind::DiscreteCounted => {
            let bucket_key = match value {
                FieldValue::Text(s) => s.clone(),
                FieldValue::Int(n) => n.to_string(),
                FieldValue::Json(v) => v.to_string(),
            };
            let bucket = measurement
                .entry(field.name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(counts) = bucket {
                let next = counts.get(&bucket_key).and_then(Value::as_i64).unwrap_or(0) + 1;
                counts.insert(bucket_key, json!(next));
            }
        }
    }
}

/// Render one stored value in the document. Textual rows of JSON-typed
/// fields are parsed back into a tree; if parsing fails the raw string is
/// kept rather than dropping the datum.
fn value_json(field: &FieldInfo, value: &FieldValue) -> Value {
    match value {
        FieldValue::Int(n) => json!(n),
        FieldValue::Json(v) => v.clone(),
        FieldValue::Text(s) => {
            if field.value_type == ValueType::Json {
                match serde_json::from_str(s) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(field = %field.name, "stored JSON value unparseable, keeping raw text");
                        json!(s)
                    }
                }
            } else {
                json!(s)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FieldId;
    use crate::ids::MeasurementId;

    fn info(name: &str, value_type: ValueType, kind: AccumKind) -> FieldInfo {
        FieldInfo {
            id: FieldId(1),
            measurement_id: MeasurementId(1),
            measurement_name: "m".to_string(),
            measurement_version: 2,
            name: name.to_string(),
            value_type,
            kind,
        }
    }

    #[test]
    fn accumulate_creates_measurement_with_version_tag() {
        let mut env_obj = Map::new();
        let f = info("clicks", ValueType::Int, AccumKind::Counter);
        accumulate(&mut env_obj, &f, &FieldValue::Int(3));
        assert_eq!(env_obj["m"], json!({"_v": 2, "clicks": 3}));
    }

    #[test]
    fn accumulate_appends_discrete_values() {
        let mut env_obj = Map::new();
        let f = info("terms", ValueType::Text, AccumKind::DiscreteAppend);
        accumulate(&mut env_obj, &f, &FieldValue::Text("a".to_string()));
        accumulate(&mut env_obj, &f, &FieldValue::Text("b".to_string()));
        assert_eq!(env_obj["m"]["terms"], json!(["a", "b"]));
    }

    #[test]
    fn accumulate_tallies_counted_values() {
        let mut env_obj = Map::new();
        let f = info("engine", ValueType::Text, AccumKind::DiscreteCounted);
        for v in ["foo", "bar", "foo"] {
            accumulate(&mut env_obj, &f, &FieldValue::Text(v.to_string()));
        }
        assert_eq!(env_obj["m"]["engine"], json!({"foo": 2, "bar": 1}));
    }

    #[test]
    fn json_field_text_rows_are_parsed() {
        let f = info("blob", ValueType::Json, AccumKind::Last);
        let v = value_json(&f, &FieldValue::Text(r#"{"k": 1}"#.to_string()));
        assert_eq!(v, json!({"k": 1}));
        // Unparseable text degrades to the raw string.
        let v = value_json(&f, &FieldValue::Text("not json".to_string()));
        assert_eq!(v, json!("not json"));
    }

    #[test]
    fn partition_flushes_on_day_and_env_changes() {
        let f = info("clicks", ValueType::Int, AccumKind::Counter);
        let fields = HashMap::from([(f.id, f.clone())]);
        let hashes = HashMap::from([
            (EnvId(1), "h1".to_string()),
            (EnvId(2), "h2".to_string()),
        ]);
        let rows = vec![
            EventRow { day: 100, env: EnvId(1), field: f.id, value: FieldValue::Int(1) },
            EventRow { day: 100, env: EnvId(2), field: f.id, value: FieldValue::Int(2) },
            EventRow { day: 101, env: EnvId(1), field: f.id, value: FieldValue::Int(3) },
        ];
        let days = partition_days(&rows, &fields, &hashes);
        assert_eq!(days.len(), 2);
        assert_eq!(days["1970-04-11"]["h1"]["m"]["clicks"], json!(1));
        assert_eq!(days["1970-04-11"]["h2"]["m"]["clicks"], json!(2));
        assert_eq!(days["1970-04-12"]["h1"]["m"]["clicks"], json!(3));
    }

    #[test]
    fn partition_skips_unknown_environments_and_fields() {
        let f = info("clicks", ValueType::Int, AccumKind::Counter);
        let fields = HashMap::from([(f.id, f.clone())]);
        let hashes = HashMap::from([(EnvId(1), "h1".to_string())]);
        let rows = vec![
            EventRow { day: 100, env: EnvId(9), field: f.id, value: FieldValue::Int(1) },
            EventRow { day: 100, env: EnvId(1), field: FieldId(42), value: FieldValue::Int(1) },
            EventRow { day: 100, env: EnvId(1), field: f.id, value: FieldValue::Int(5) },
        ];
        let days = partition_days(&rows, &fields, &hashes);
        assert_eq!(days.len(), 1);
        assert_eq!(days["1970-04-11"]["h1"]["m"]["clicks"], json!(5));
        assert!(days["1970-04-11"].get("h9").is_none());
    }

    #[test]
    fn diff_environment_keeps_version_tag_on_included_groups() {
        let current = render_groups(&Environment {
            app_name: "pulse".to_string(),
            app_version: "1.0".to_string(),
            cpu_count: 4,
            ..Environment::default()
        });
        let other = render_groups(&Environment {
            app_name: "pulse".to_string(),
            app_version: "1.0".to_string(),
            cpu_count: 8,
            ..Environment::default()
        });
        let d = diff_environment(&current, &other);
        assert_eq!(d["sysinfo"], json!({"cpuCount": 8, "_v": 1}));
        assert!(d.get("appinfo").is_none());
        assert!(d.get("age").is_none());
    }
}
