//! Document lifecycle and property tests
//!
//! Covers:
//! - New document defaults
//! - Typed accessors surviving save and reopen
//! - Removing properties, including inside subdocuments
//! - Revert semantics
//! - Subdocument identity across reads and saves
//! - Delete and purge

use chrono::Utc;
use revodb::{Database, DatabaseOptions, Value};
use std::collections::HashMap;
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir) {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(tmp.path(), "db", DatabaseOptions::default())
        .expect("Failed to open database");
    (db, tmp)
}

fn reopen(db: Database, tmp: &TempDir) -> Database {
    db.close();
    drop(db);
    Database::open(tmp.path(), "db", DatabaseOptions::default()).expect("Failed to reopen")
}

#[test]
fn test_new_document() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    assert!(!doc.exists());
    assert!(!doc.is_deleted());
    assert!(doc.properties().is_none());
    assert_eq!(doc.sequence(), 0);
    assert!(doc.revision_id().is_none());

    assert!(!doc.get_bool("any"));
    assert_eq!(doc.get_i64("any"), 0);
    assert_eq!(doc.get_f64("any"), 0.0);
    assert_eq!(doc.get_f32("any"), 0.0);
    assert!(doc.get_string("any").is_none());
    assert!(doc.get_date("any").is_none());
    assert!(doc.get_blob("any").is_none());
    assert!(doc.get_array("any").is_none());
    assert!(doc.get_subdocument("any").is_none());

    doc.save().unwrap();

    assert!(doc.exists());
    assert!(!doc.is_deleted());
    assert!(doc.properties().is_none());
    assert_eq!(doc.sequence(), 1);
    assert!(doc.revision_id().unwrap().starts_with("1-"));
}

#[test]
fn test_property_accessors() {
    let (db, tmp) = create_test_db();
    let now = Utc::now().fixed_offset();
    let doc_id;
    {
        let doc = db.create_document().unwrap();
        doc_id = doc.id().to_string();
        doc.set("bool", true).unwrap();
        doc.set("double", 1.1f64).unwrap();
        doc.set("float", 1.2f32).unwrap();
        doc.set("integer", 2i64).unwrap();
        doc.set("string", "str").unwrap();
        doc.set(
            "array",
            Value::Array(vec![Value::from("1"), Value::from("2")]),
        )
        .unwrap();
        doc.set("date", now).unwrap();

        assert!(doc.has_changes());
        doc.save().unwrap();
        assert!(!doc.has_changes());

        // Values read back unchanged before reopen.
        assert!(doc.get_bool("bool"));
        assert_eq!(doc.get_f64("double"), 1.1);
        assert_eq!(doc.get_f32("float"), 1.2);
        assert_eq!(doc.get_i64("integer"), 2);
    }

    let db = reopen(db, &tmp);
    let doc = db.get_document(&doc_id).unwrap();

    assert!(doc.get_bool("bool"));
    assert_eq!(doc.get_f64("double"), 1.1);
    assert_eq!(doc.get_f32("float"), 1.2);
    assert_eq!(doc.get_i64("integer"), 2);
    assert_eq!(doc.get_string("string").as_deref(), Some("str"));
    assert_eq!(doc.get_date("date"), Some(now));
    assert_eq!(
        doc.get_array("array"),
        Some(vec![Value::from("1"), Value::from("2")])
    );
}

#[test]
fn test_remove_properties() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let mut address = HashMap::new();
    address.insert("street".to_string(), Value::from("1 milky way."));
    address.insert("city".to_string(), Value::from("galaxy city"));
    address.insert("zip".to_string(), Value::Int(12345));

    doc.set("type", "profile").unwrap();
    doc.set("name", "Jason").unwrap();
    doc.set("weight", 130.5f64).unwrap();
    doc.set("age", 30i64).unwrap();
    doc.set("active", true).unwrap();
    doc.set("address", Value::Map(address)).unwrap();
    doc.save().unwrap();

    doc.remove("name").unwrap();
    doc.remove("weight").unwrap();
    doc.remove("age").unwrap();
    doc.remove("active").unwrap();
    let address = doc.get_subdocument("address").unwrap();
    address.remove("city").unwrap();

    assert!(doc.get_string("name").is_none());
    assert_eq!(doc.get_f64("weight"), 0.0);
    assert_eq!(doc.get_i64("age"), 0);
    assert!(!doc.get_bool("active"));
    assert!(!doc.contains("name"));
    assert!(address.get_string("city").is_none());

    let props = doc.properties().expect("some properties remain");
    assert_eq!(props.len(), 2, "only type and address survive: {:?}", props);
    assert_eq!(props.get("type"), Some(&Value::from("profile")));

    let mut expected_address = HashMap::new();
    expected_address.insert("street".to_string(), Value::from("1 milky way."));
    expected_address.insert("zip".to_string(), Value::Int(12345));
    assert_eq!(props.get("address"), Some(&Value::Map(expected_address)));
}

#[test]
fn test_set_then_get_before_save() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    doc.set("k", 42i64).unwrap();
    assert_eq!(doc.get_i64("k"), 42);
    assert!(doc.has_changes());

    doc.save().unwrap();
    assert!(!doc.has_changes());
    assert_eq!(doc.get_i64("k"), 42);
}

#[test]
fn test_revert_restores_persisted_values() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    doc.set("name", "first").unwrap();
    doc.save().unwrap();

    doc.set("name", "second").unwrap();
    doc.set("extra", 1i64).unwrap();
    assert!(doc.has_changes());

    doc.revert();
    assert!(!doc.has_changes());
    assert_eq!(doc.get_string("name").as_deref(), Some("first"));
    assert!(doc.get_string("extra").is_none());
}

#[test]
fn test_revert_keeps_persisted_subdocument_mounted() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let mut address = HashMap::new();
    address.insert("city".to_string(), Value::from("sf"));
    doc.set("address", Value::Map(address)).unwrap();
    doc.save().unwrap();

    let sub = doc.get_subdocument("address").unwrap();
    sub.set("city", "oakland").unwrap();
    assert!(doc.has_changes());

    doc.revert();
    assert!(!doc.has_changes());
    let after = doc.get_subdocument("address").unwrap();
    assert!(after.same_instance(&sub), "reverted subdocument stays mounted");
    assert_eq!(after.get_string("city").as_deref(), Some("sf"));
}

#[test]
fn test_subdocument_identity() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let mut m = HashMap::new();
    m.insert("street".to_string(), Value::from("x"));
    doc.set("address", Value::Map(m)).unwrap();

    let a = doc.get_subdocument("address").unwrap();
    let b = doc.get_subdocument("address").unwrap();
    assert!(a.same_instance(&b));
    assert!(!a.exists(), "not yet saved");
    assert!(a.document().is_some());

    doc.save().unwrap();
    let c = doc.get_subdocument("address").unwrap();
    assert!(a.same_instance(&c), "identity survives save");
    assert!(a.exists(), "saved subdocument has a persisted root");

    // Overwriting the key invalidates the instance.
    doc.set("address", "just a string").unwrap();
    assert!(!a.exists());
    assert!(a.document().is_none());
    assert!(a.properties().is_none());
}

#[test]
fn test_nested_subdocument_mutation_bubbles() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let mut inner = HashMap::new();
    inner.insert("deep".to_string(), Value::from("v"));
    let mut outer = HashMap::new();
    outer.insert("inner".to_string(), Value::Map(inner));
    doc.set("outer", Value::Map(outer)).unwrap();
    doc.save().unwrap();
    assert!(!doc.has_changes());

    let inner = doc
        .get_subdocument("outer")
        .unwrap()
        .get_subdocument("inner")
        .unwrap();
    inner.set("deep", "changed").unwrap();

    assert!(doc.has_changes(), "nested mutation bubbles to the document");
    doc.save().unwrap();
    assert_eq!(
        doc.get_subdocument("outer")
            .unwrap()
            .get_subdocument("inner")
            .unwrap()
            .get_string("deep")
            .as_deref(),
        Some("changed")
    );
}

#[test]
fn test_mutation_listener_fires() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count_clone = count.clone();
    let token = doc.add_mutation_listener(move |_| {
        count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    doc.set("a", 1i64).unwrap();
    doc.set("a", 1i64).unwrap(); // no-op, equal value
    doc.set("b", 2i64).unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);

    doc.remove_listener(token);
    doc.set("c", 3i64).unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn test_delete_document() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    doc.set("name", "to be deleted").unwrap();
    doc.save().unwrap();

    doc.delete().unwrap();
    assert!(doc.exists());
    assert!(doc.is_deleted());
    assert!(doc.properties().is_none());
    assert!(doc.get_string("name").is_none());
}

#[test]
fn test_delete_before_save_is_not_found() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();
    assert!(matches!(doc.delete(), Err(revodb::DbError::NotFound(_))));
}

#[test]
fn test_purge_document() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    doc.set("name", "ephemeral").unwrap();
    doc.save().unwrap();

    assert!(doc.purge().unwrap());
    assert!(!doc.exists());
    assert!(!doc.is_deleted());
    assert!(doc.properties().is_none());
    assert!(!doc.purge().unwrap(), "second purge has nothing to do");
}

#[test]
fn test_replace_properties_roundtrip() {
    let (db, tmp) = create_test_db();
    let doc_id;
    {
        let doc = db.create_document().unwrap();
        doc_id = doc.id().to_string();

        let mut nested = HashMap::new();
        nested.insert("zip".to_string(), Value::Int(94110));
        let mut map = HashMap::new();
        map.insert("type".to_string(), Value::from("profile"));
        map.insert("count".to_string(), Value::Int(3));
        map.insert("score".to_string(), Value::Double(9.5));
        map.insert("address".to_string(), Value::Map(nested));
        map.insert(
            "tags".to_string(),
            Value::Array(vec![Value::from("a"), Value::from("b")]),
        );

        doc.replace_properties(Some(map)).unwrap();
        doc.save().unwrap();
    }

    let db = reopen(db, &tmp);
    let doc = db.get_document(&doc_id).unwrap();

    assert_eq!(doc.get_string("type").as_deref(), Some("profile"));
    assert_eq!(doc.get_i64("count"), 3);
    assert_eq!(doc.get_f64("score"), 9.5);
    assert_eq!(
        doc.get_subdocument("address").unwrap().get_i64("zip"),
        94110
    );
    assert_eq!(
        doc.get_array("tags"),
        Some(vec![Value::from("a"), Value::from("b")])
    );
}

#[test]
fn test_properties_as_json() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    doc.set_properties_as_json(r#"{"name":"json","n":7,"nested":{"x":true}}"#)
        .unwrap();
    assert_eq!(doc.get_string("name").as_deref(), Some("json"));
    assert_eq!(doc.get_i64("n"), 7);
    assert!(doc.get_subdocument("nested").unwrap().get_bool("x"));

    doc.save().unwrap();
    let json: serde_json::Value = serde_json::from_str(&doc.properties_as_json()).unwrap();
    assert_eq!(json["name"], "json");
    assert_eq!(json["nested"]["x"], true);

    assert!(doc.set_properties_as_json("[1,2,3]").is_err());
}

#[test]
fn test_saved_listener() {
    let (db, _tmp) = create_test_db();
    let doc = db.create_document().unwrap();

    let events = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let _token = doc.add_saved_listener(move |_, external| {
        events_clone.lock().push(external);
    });

    doc.set("a", 1i64).unwrap();
    doc.save().unwrap();
    doc.set("a", 2i64).unwrap();
    doc.save().unwrap();

    assert_eq!(*events.lock(), vec![false, false]);
}
