//! End-to-end document generation scenarios over a real on-disk store.

use pulse_store::environment::{
    GROUP_ACTIVE_ADDONS, GROUP_ADDON_COUNTS, GROUP_AGE, GROUP_APPINFO, GROUP_SYSINFO,
};
use pulse_store::time::{millis_of_day, EARLIEST_PING_MILLIS};
use pulse_store::{
    generate, AccumKind, DocumentRequest, Environment, FieldSpec, PulseStore, StoreError,
    ValueType, DOCUMENT_VERSION,
};
use serde_json::json;
use tempfile::TempDir;

fn snapshot(cpu_count: i64) -> Environment {
    Environment {
        app_name: "pulse".to_string(),
        app_version: "1.0".to_string(),
        cpu_count,
        memory_mb: 2048,
        ..Environment::default()
    }
}

fn open_store(dir: &TempDir) -> PulseStore {
    PulseStore::open_at(dir.path().join("pulse.db")).unwrap()
}

fn request(current: Environment) -> DocumentRequest {
    DocumentRequest {
        since_millis: 0,
        last_ping_millis: None,
        this_ping_millis: millis_of_day(200),
        current,
    }
}

#[test]
fn counter_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let h1 = current.content_hash().unwrap();
    let e1 = store.register_environment(&current).unwrap();
    store
        .ensure_measurement(
            "org.example.counts",
            1,
            &[FieldSpec::new("clicks", ValueType::Int, AccumKind::Counter)],
        )
        .unwrap();
    let clicks = store.field_for("org.example.counts", 1, "clicks").unwrap();
    for _ in 0..3 {
        store.increment_counter(e1, 100, &clicks, 1).unwrap();
    }

    let rows = store.events_since(0).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].day, 100);

    let doc = generate(&store, &request(current)).unwrap();
    assert_eq!(
        doc["data"]["days"]["1970-04-11"][&h1]["org.example.counts"],
        json!({"_v": 1, "clicks": 3})
    );
    // No other environment keys beside "current".
    let envs = doc["environments"].as_object().unwrap();
    assert_eq!(envs.len(), 1);
    assert!(envs.contains_key("current"));
}

#[test]
fn counted_discrete_field_tallies_buckets() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let h1 = current.content_hash().unwrap();
    let e1 = store.register_environment(&current).unwrap();
    store
        .ensure_measurement(
            "org.example.searches",
            1,
            &[FieldSpec::new(
                "engine",
                ValueType::Text,
                AccumKind::DiscreteCounted,
            )],
        )
        .unwrap();
    let engine = store
        .field_for("org.example.searches", 1, "engine")
        .unwrap();
    for v in ["foo", "bar", "foo"] {
        store
            .record_discrete(e1, 100, &engine, &pulse_store::FieldValue::Text(v.to_string()))
            .unwrap();
    }

    let doc = generate(&store, &request(current)).unwrap();
    assert_eq!(
        doc["data"]["days"]["1970-04-11"][&h1]["org.example.searches"]["engine"],
        json!({"foo": 2, "bar": 1})
    );
}

#[test]
fn other_environment_appears_as_diff_against_current() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let other = snapshot(8);
    let h2 = other.content_hash().unwrap();
    let e1 = store.register_environment(&current).unwrap();
    let e2 = store.register_environment(&other).unwrap();
    store
        .ensure_measurement(
            "org.example.counts",
            1,
            &[FieldSpec::new("clicks", ValueType::Int, AccumKind::Counter)],
        )
        .unwrap();
    let clicks = store.field_for("org.example.counts", 1, "clicks").unwrap();
    store.increment_counter(e1, 100, &clicks, 1).unwrap();
    store.increment_counter(e2, 100, &clicks, 1).unwrap();

    let doc = generate(&store, &request(current)).unwrap();
    assert_eq!(
        doc["environments"][&h2][GROUP_SYSINFO],
        json!({"cpuCount": 8, "_v": 1})
    );
    // Groups with zero differences are omitted from the diff entirely.
    assert!(doc["environments"][&h2].get(GROUP_APPINFO).is_none());
    assert!(doc["environments"][&h2].get(GROUP_AGE).is_none());
    // The baseline is always complete.
    let current_env = doc["environments"]["current"].as_object().unwrap();
    for group in [
        GROUP_AGE,
        GROUP_SYSINFO,
        GROUP_APPINFO,
        GROUP_ADDON_COUNTS,
        GROUP_ACTIVE_ADDONS,
    ] {
        assert!(current_env.contains_key(group), "missing {group}");
    }
    assert!(
        current_env[GROUP_SYSINFO].get("memoryMB").is_some(),
        "current sysinfo must carry every field"
    );
}

#[test]
fn version_mismatch_forces_full_inclusion_either_direction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let mut old_shape = snapshot(4);
    old_shape.version = 1;
    let h_old = old_shape.content_hash().unwrap();
    store.register_environment(&current).unwrap();
    store.register_environment(&old_shape).unwrap();

    // current (v2) vs registered v1: full inclusion, not a diff.
    let doc = generate(&store, &request(current)).unwrap();
    let rendered = doc["environments"][&h_old].as_object().unwrap();
    assert!(rendered.contains_key(GROUP_AGE));
    assert!(rendered.contains_key(GROUP_ADDON_COUNTS));
    assert_eq!(rendered[GROUP_APPINFO]["_v"], json!(1));

    // The rule holds even when current is the *older* side.
    let doc = generate(&store, &request(old_shape)).unwrap();
    let current_v2 = snapshot(4).content_hash().unwrap();
    let rendered = doc["environments"][&current_v2].as_object().unwrap();
    assert!(rendered.contains_key(GROUP_AGE));
    assert_eq!(rendered[GROUP_APPINFO]["_v"], json!(2));
}

#[test]
fn empty_window_still_yields_a_valid_document() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let doc = generate(&store, &request(current)).unwrap();
    assert_eq!(doc["version"], json!(DOCUMENT_VERSION));
    assert_eq!(doc["data"]["days"], json!({}));
    assert_eq!(doc["data"]["last"], json!({}));
    assert_eq!(doc["thisPingDate"], json!("1970-07-20"));
    let current_env = doc["environments"]["current"].as_object().unwrap();
    assert_eq!(current_env.len(), 5);
}

#[test]
fn implausibly_old_last_ping_is_dropped() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let current = snapshot(4);

    let mut req = request(current.clone());
    req.last_ping_millis = Some(1_000);
    let doc = generate(&store, &req).unwrap();
    assert!(doc.get("lastPingDate").is_none());

    req.last_ping_millis = Some(EARLIEST_PING_MILLIS);
    let doc = generate(&store, &req).unwrap();
    assert_eq!(doc["lastPingDate"], json!("2010-01-01"));
}

#[test]
fn uncomputable_current_hash_means_no_document() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut current = snapshot(4);
    current.app_name.clear();

    let err = generate(&store, &request(current)).unwrap_err();
    assert!(matches!(err, StoreError::NoDocument(_)));
}

#[test]
fn multi_day_multi_environment_tree() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let other = snapshot(8);
    let h1 = current.content_hash().unwrap();
    let h2 = other.content_hash().unwrap();
    let e1 = store.register_environment(&current).unwrap();
    let e2 = store.register_environment(&other).unwrap();
    store
        .ensure_measurement(
            "org.example.counts",
            1,
            &[
                FieldSpec::new("clicks", ValueType::Int, AccumKind::Counter),
                FieldSpec::new("terms", ValueType::Text, AccumKind::DiscreteAppend),
            ],
        )
        .unwrap();
    let clicks = store.field_for("org.example.counts", 1, "clicks").unwrap();
    let terms = store.field_for("org.example.counts", 1, "terms").unwrap();

    store.increment_counter(e1, 100, &clicks, 2).unwrap();
    store
        .record_discrete(e1, 100, &terms, &pulse_store::FieldValue::Text("a".to_string()))
        .unwrap();
    store.increment_counter(e2, 100, &clicks, 5).unwrap();
    store.increment_counter(e1, 101, &clicks, 9).unwrap();

    let doc = generate(&store, &request(current)).unwrap();
    let days = doc["data"]["days"].as_object().unwrap();
    assert_eq!(days.len(), 2);
    assert_eq!(
        days["1970-04-11"][&h1]["org.example.counts"],
        json!({"_v": 1, "clicks": 2, "terms": ["a"]})
    );
    assert_eq!(
        days["1970-04-11"][&h2]["org.example.counts"],
        json!({"_v": 1, "clicks": 5})
    );
    assert_eq!(
        days["1970-04-12"][&h1]["org.example.counts"],
        json!({"_v": 1, "clicks": 9})
    );
}

#[test]
fn window_excludes_events_before_since() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let current = snapshot(4);
    let e1 = store.register_environment(&current).unwrap();
    store
        .ensure_measurement(
            "org.example.counts",
            1,
            &[FieldSpec::new("clicks", ValueType::Int, AccumKind::Counter)],
        )
        .unwrap();
    let clicks = store.field_for("org.example.counts", 1, "clicks").unwrap();
    store.increment_counter(e1, 50, &clicks, 1).unwrap();
    store.increment_counter(e1, 100, &clicks, 1).unwrap();

    let mut req = request(current);
    req.since_millis = millis_of_day(60);
    let doc = generate(&store, &req).unwrap();
    let days = doc["data"]["days"].as_object().unwrap();
    assert_eq!(days.len(), 1);
    assert!(days.contains_key("1970-04-11"));
}
