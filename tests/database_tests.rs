//! Database-level tests
//!
//! Covers:
//! - Change notification batching across an `in_batch`
//! - External change events between two handles on one directory
//! - Transaction rollback
//! - Document counting and index forwarding

use parking_lot::Mutex;
use revodb::{Database, DatabaseChange, DatabaseOptions, DbError, IndexType};
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir) {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(tmp.path(), "db", DatabaseOptions::default())
        .expect("Failed to open database");
    (db, tmp)
}

fn collect_changes(db: &Database) -> Arc<Mutex<Vec<DatabaseChange>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let _token = db.add_change_listener(move |change| {
        events_clone.lock().push(change.clone());
    });
    events
}

#[test]
fn test_batch_emits_one_notification() {
    let (db, _tmp) = create_test_db();
    let events = collect_changes(&db);

    db.in_batch(|| {
        for _ in 0..10 {
            let doc = db.create_document()?;
            doc.set("type", "batched")?;
            doc.save()?;
        }
        Ok(())
    })
    .unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 1, "one event per committed batch");
    assert_eq!(events[0].doc_ids.len(), 10);
    assert!(!events[0].external);
    assert_eq!(events[0].last_sequence, 10);
}

#[test]
fn test_each_save_outside_batch_notifies() {
    let (db, _tmp) = create_test_db();
    let events = collect_changes(&db);

    for _ in 0..3 {
        let doc = db.create_document().unwrap();
        doc.set("n", 1i64).unwrap();
        doc.save().unwrap();
    }

    let events = events.lock();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.doc_ids.len() == 1 && !e.external));
}

#[test]
fn test_external_changes_are_flagged() {
    let (db, tmp) = create_test_db();
    let events = collect_changes(&db);

    let db2 = Database::open(tmp.path(), "db", DatabaseOptions::default()).unwrap();
    let doc = db2.create_document().unwrap();
    doc.set("source", "other handle").unwrap();
    doc.save().unwrap();

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert!(events[0].external);
    assert_eq!(events[0].doc_ids, vec![doc.id().to_string()]);
}

#[test]
fn test_removed_listener_stops_firing() {
    let (db, _tmp) = create_test_db();

    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count_clone = count.clone();
    let token = db.add_change_listener(move |_| {
        count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let doc = db.create_document().unwrap();
    doc.set("a", 1i64).unwrap();
    doc.save().unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

    db.remove_change_listener(token);
    doc.set("a", 2i64).unwrap();
    doc.save().unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_rollback_discards_writes_and_notifications() {
    let (db, tmp) = create_test_db();
    let events = collect_changes(&db);

    let result: Result<(), DbError> = db.in_batch(|| {
        let doc = db.create_document()?;
        doc.set("doomed", true)?;
        doc.save()?;
        Err(DbError::Storage("forced failure".to_string()))
    });
    assert!(result.is_err());
    assert!(events.lock().is_empty(), "rolled-back writes never notify");

    db.close();
    drop(db);
    let db = Database::open(tmp.path(), "db", DatabaseOptions::default()).unwrap();
    assert_eq!(db.document_count(), 0, "nothing was committed");
}

#[test]
fn test_document_count_skips_deleted() {
    let (db, _tmp) = create_test_db();

    let keep = db.create_document().unwrap();
    keep.set("n", 1i64).unwrap();
    keep.save().unwrap();

    let gone = db.create_document().unwrap();
    gone.set("n", 2i64).unwrap();
    gone.save().unwrap();

    assert_eq!(db.document_count(), 2);
    gone.delete().unwrap();
    assert_eq!(db.document_count(), 1);
}

#[test]
fn test_index_create_and_delete() {
    let (db, _tmp) = create_test_db();

    let doc = db.create_document().unwrap();
    doc.set("name", "indexed").unwrap();
    doc.set("bio", "a short text about nothing").unwrap();
    doc.save().unwrap();

    db.create_index("by_name", IndexType::Value, vec!["name".to_string()])
        .unwrap();
    db.create_index("by_bio", IndexType::FullText, vec!["bio".to_string()])
        .unwrap();

    let names: Vec<String> = db.indexes().into_iter().map(|d| d.name).collect();
    assert!(names.contains(&"by_name".to_string()));
    assert!(names.contains(&"by_bio".to_string()));

    db.delete_index("by_name").unwrap();
    let names: Vec<String> = db.indexes().into_iter().map(|d| d.name).collect();
    assert!(!names.contains(&"by_name".to_string()));

    // Writes keep maintaining the surviving index.
    doc.set("bio", "a different text").unwrap();
    doc.save().unwrap();
}

#[test]
fn test_get_existing_document() {
    let (db, _tmp) = create_test_db();

    assert!(db.get_existing_document("missing").unwrap().is_none());

    let doc = db.get_document("present").unwrap();
    doc.set("x", 1i64).unwrap();
    doc.save().unwrap();

    let found = db.get_existing_document("present").unwrap().unwrap();
    assert_eq!(found.get_i64("x"), 1);
}

#[test]
fn test_read_only_handle_rejects_writes() {
    let tmp = TempDir::new().unwrap();
    {
        let db = Database::open(tmp.path(), "db", DatabaseOptions::default()).unwrap();
        let doc = db.get_document("seed").unwrap();
        doc.set("x", 1i64).unwrap();
        doc.save().unwrap();
        db.close();
    }

    let db = Database::open(
        tmp.path(),
        "db",
        DatabaseOptions {
            create: false,
            read_only: true,
            ..Default::default()
        },
    )
    .unwrap();

    let doc = db.get_document("seed").unwrap();
    assert_eq!(doc.get_i64("x"), 1);
    doc.set("x", 2i64).unwrap();
    assert!(matches!(doc.save(), Err(DbError::InvalidState(_))));
}
