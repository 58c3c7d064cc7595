use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::document::{ConflictResolver, Document, DocumentInner};
use crate::error::{DbError, DbResult};
use crate::storage::{self, BlobStore, IndexDefinition, IndexType, ObserverToken, Store};

/// How document versions are tracked. Revision trees are the only
/// supported mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentVersioning {
    #[default]
    RevisionTrees,
}

/// Options for opening a database.
pub struct DatabaseOptions {
    /// Create the files if they do not exist.
    pub create: bool,
    /// Reject writes through this handle.
    pub read_only: bool,
    pub versioning: DocumentVersioning,
    /// Hook for encryption at rest. Not implemented; a key is rejected.
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create: true,
            read_only: false,
            versioning: DocumentVersioning::RevisionTrees,
            encryption_key: None,
        }
    }
}

/// One batch of committed changes, delivered to database change listeners.
/// `external` is true when the writes came from another database handle on
/// the same directory.
#[derive(Debug, Clone)]
pub struct DatabaseChange {
    pub doc_ids: Vec<String>,
    pub last_sequence: u64,
    pub external: bool,
}

/// Handle for removing a database change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeListenerToken(u64);

pub(crate) struct DatabaseShared {
    name: String,
    store: Store,
    blob_store: BlobStore,
    instance_id: u64,
    state: Mutex<DbState>,
    listeners: Mutex<HashMap<u64, Box<dyn Fn(&DatabaseChange) + Send>>>,
    observer: Mutex<Option<ObserverToken>>,
    default_resolver: Mutex<Option<Arc<dyn ConflictResolver>>>,
}

struct DbState {
    open: bool,
    /// Live documents by id; the same instance is handed out while one is
    /// alive, so identity and external-change reload work.
    docs: HashMap<String, Weak<DocumentInner>>,
    /// Ids of live documents with staged, unsaved changes.
    unsaved: HashSet<String>,
    next_listener: u64,
}

/// An open database: owns the store handle, the blob store, the shared-key
/// cache, the live-document registry and change-observer dispatch.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("path", &self.shared.store.path())
            .finish()
    }
}

impl Database {
    /// Open the database `name` under `directory`, creating it if allowed.
    pub fn open(directory: impl AsRef<Path>, name: &str, options: DatabaseOptions) -> DbResult<Database> {
        if options.encryption_key.is_some() {
            return Err(DbError::InvalidState(
                "encryption at rest is not implemented".to_string(),
            ));
        }
        let DocumentVersioning::RevisionTrees = options.versioning;

        let path = Self::db_path(directory.as_ref(), name);
        let store = Store::open(&path, options.create, options.read_only)?;
        let blob_store = BlobStore::new(store.clone());
        let instance_id = storage::next_instance_id();

        let shared = Arc::new(DatabaseShared {
            name: name.to_string(),
            store: store.clone(),
            blob_store,
            instance_id,
            state: Mutex::new(DbState {
                open: true,
                docs: HashMap::new(),
                unsaved: HashSet::new(),
                next_listener: 0,
            }),
            listeners: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            default_resolver: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let token = store.observe(
            instance_id,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Database { shared }.dispatch_changes();
                }
            }),
        );
        *shared.observer.lock() = Some(token);

        tracing::info!("opened database '{}' at {:?}", name, store.path());
        Ok(Database { shared })
    }

    fn db_path(directory: &Path, name: &str) -> PathBuf {
        directory.join(format!("{}.revodb", name))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> &Path {
        self.shared.store.path()
    }

    pub(crate) fn store(&self) -> &Store {
        &self.shared.store
    }

    pub(crate) fn blob_store(&self) -> &BlobStore {
        &self.shared.blob_store
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.shared.state.lock().open {
            Ok(())
        } else {
            Err(DbError::InvalidState("database is closed".to_string()))
        }
    }

    // ==================== Documents ====================

    /// The live document for `id`, loading it if needed. The document is
    /// created in memory when nothing is persisted yet.
    pub fn get_document(&self, id: &str) -> DbResult<Document> {
        self.ensure_open()?;
        {
            let state = self.shared.state.lock();
            if let Some(inner) = state.docs.get(id).and_then(Weak::upgrade) {
                return Ok(Document::from_inner(inner));
            }
        }
        let doc = Document::load(self.clone(), id.to_string())?;
        self.shared
            .state
            .lock()
            .docs
            .insert(id.to_string(), Arc::downgrade(doc.inner()));
        Ok(doc)
    }

    /// Like `get_document`, but `None` when nothing is persisted under the
    /// id.
    pub fn get_existing_document(&self, id: &str) -> DbResult<Option<Document>> {
        let doc = self.get_document(id)?;
        if doc.exists() {
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    /// A new document under a fresh random 128-bit id.
    pub fn create_document(&self) -> DbResult<Document> {
        let id = URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes());
        self.get_document(&id)
    }

    /// Number of live (non-deleted) documents on disk.
    pub fn document_count(&self) -> u64 {
        self.shared.store.record_count()
    }

    pub(crate) fn note_unsaved(&self, id: &str) {
        let mut state = self.shared.state.lock();
        if state.open {
            state.unsaved.insert(id.to_string());
        }
    }

    pub(crate) fn clear_unsaved(&self, id: &str) {
        self.shared.state.lock().unsaved.remove(id);
    }

    /// Ids of live documents with staged, unsaved changes.
    pub fn unsaved_documents(&self) -> Vec<String> {
        self.shared.state.lock().unsaved.iter().cloned().collect()
    }

    // ==================== Transactions ====================

    /// Run `f` inside one storage transaction: commit on success, roll back
    /// on error or panic. Change notifications accumulated by saves inside
    /// the batch are dispatched once, after commit. Nested calls join the
    /// outer transaction.
    pub fn in_batch<T>(&self, f: impl FnOnce() -> DbResult<T>) -> DbResult<T> {
        self.ensure_open()?;
        let store = &self.shared.store;
        store.begin_transaction()?;
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                store.end_transaction(true)?;
                Ok(value)
            }
            Ok(Err(e)) => {
                let _ = store.end_transaction(false);
                Err(e)
            }
            Err(panic) => {
                let _ = store.end_transaction(false);
                std::panic::resume_unwind(panic);
            }
        }
    }

    // ==================== Change observation ====================

    /// Register a callback for committed changes. Events carry batches of
    /// document ids; one event per externality flip, at most 1000 ids.
    pub fn add_change_listener(
        &self,
        listener: impl Fn(&DatabaseChange) + Send + 'static,
    ) -> ChangeListenerToken {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_listener += 1;
            state.next_listener
        };
        self.shared.listeners.lock().insert(id, Box::new(listener));
        ChangeListenerToken(id)
    }

    pub fn remove_change_listener(&self, token: ChangeListenerToken) {
        self.shared.listeners.lock().remove(&token.0);
    }

    /// Pull pending changes off the storage observer and emit listener
    /// events. Called by the store after every commit; a no-op while a
    /// transaction is still open.
    fn dispatch_changes(&self) {
        if self.shared.store.in_transaction() {
            return;
        }
        let observer = self.shared.observer.lock();
        let Some(token) = observer.as_ref() else {
            return;
        };

        let mut doc_ids: Vec<String> = Vec::new();
        let mut batch_external = false;
        let mut last_sequence = 0;
        loop {
            let (entries, external) = token.changes(100);
            if entries.is_empty() {
                break;
            }
            if !doc_ids.is_empty() && external != batch_external {
                self.emit_change(std::mem::take(&mut doc_ids), last_sequence, batch_external);
            }
            batch_external = external;
            for entry in entries {
                last_sequence = last_sequence.max(entry.sequence);
                doc_ids.push(entry.doc_id);
            }
            if doc_ids.len() >= 1000 {
                self.emit_change(std::mem::take(&mut doc_ids), last_sequence, batch_external);
            }
        }
        if !doc_ids.is_empty() {
            self.emit_change(doc_ids, last_sequence, batch_external);
        }
    }

    fn emit_change(&self, doc_ids: Vec<String>, last_sequence: u64, external: bool) {
        let change = DatabaseChange {
            doc_ids,
            last_sequence,
            external,
        };
        {
            let listeners = self.shared.listeners.lock();
            for listener in listeners.values() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&change))) {
                    tracing::error!("change listener panicked: {:?}", panic);
                }
            }
        }
        if change.external {
            // Clean live documents reload; dirty ones defer to their next
            // save's conflict handling.
            for id in &change.doc_ids {
                let doc = {
                    let state = self.shared.state.lock();
                    state.docs.get(id).and_then(Weak::upgrade)
                };
                if let Some(inner) = doc {
                    Document::from_inner(inner).changed_externally();
                }
            }
        }
    }

    // ==================== Conflict resolution ====================

    /// Fallback resolver for documents without their own.
    pub fn set_default_conflict_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        *self.shared.default_resolver.lock() = resolver;
    }

    pub(crate) fn default_resolver(&self) -> Option<Arc<dyn ConflictResolver>> {
        self.shared.default_resolver.lock().clone()
    }

    // ==================== Indexes ====================

    /// Create (or replace) an index over dot-separated key paths.
    pub fn create_index(
        &self,
        name: &str,
        index_type: IndexType,
        expressions: Vec<String>,
    ) -> DbResult<()> {
        self.ensure_open()?;
        self.shared.store.create_index(IndexDefinition {
            name: name.to_string(),
            index_type,
            expressions,
        })
    }

    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        self.ensure_open()?;
        self.shared.store.delete_index(name)
    }

    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.shared.store.indexes()
    }

    // ==================== Lifecycle ====================

    /// Close this handle. Unsaved documents are reported and their
    /// tracking cleared; the storage closes when the last handle on the
    /// path goes away.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            if !state.unsaved.is_empty() {
                tracing::warn!(
                    "closing database '{}' with {} unsaved documents",
                    self.shared.name,
                    state.unsaved.len()
                );
                state.unsaved.clear();
            }
            state.docs.clear();
        }
        *self.shared.observer.lock() = None;
        tracing::info!("closed database '{}'", self.shared.name);
    }

    /// Close and delete the files. Fails while other handles (or retained
    /// documents) keep the storage open.
    pub fn delete(self) -> DbResult<()> {
        let path = self.shared.store.path().to_path_buf();
        self.close();
        drop(self);
        Store::delete_at_path(&path)
    }

    /// Delete a database's files without opening it.
    pub fn delete_at_path(directory: impl AsRef<Path>, name: &str) -> DbResult<()> {
        Store::delete_at_path(&Self::db_path(directory.as_ref(), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (Database, TempDir) {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open(tmp.path(), "testdb", DatabaseOptions::default())
            .expect("Failed to open database");
        (db, tmp)
    }

    #[test]
    fn test_open_creates_directory() {
        let (db, tmp) = create_test_db();
        assert_eq!(db.name(), "testdb");
        assert!(tmp.path().join("testdb.revodb").exists());
    }

    #[test]
    fn test_encryption_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let options = DatabaseOptions {
            encryption_key: Some(vec![0u8; 32]),
            ..Default::default()
        };
        assert!(matches!(
            Database::open(tmp.path(), "enc", options),
            Err(DbError::InvalidState(_))
        ));
    }

    #[test]
    fn test_create_document_ids_are_fresh() {
        let (db, _tmp) = create_test_db();
        let a = db.create_document().unwrap();
        let b = db.create_document().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 22, "128 bits, base64 url-safe, no padding");
    }

    #[test]
    fn test_same_live_document_instance() {
        let (db, _tmp) = create_test_db();
        let a = db.get_document("doc1").unwrap();
        let b = db.get_document("doc1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_closed_database_rejects_operations() {
        let (db, _tmp) = create_test_db();
        db.close();
        assert!(matches!(
            db.get_document("x"),
            Err(DbError::InvalidState(_))
        ));
        assert!(db.in_batch(|| Ok(())).is_err());
    }

    #[test]
    fn test_unsaved_tracking() {
        let (db, _tmp) = create_test_db();
        let doc = db.create_document().unwrap();
        assert!(db.unsaved_documents().is_empty());

        doc.set("name", "x").unwrap();
        assert_eq!(db.unsaved_documents(), vec![doc.id().to_string()]);

        doc.save().unwrap();
        assert!(db.unsaved_documents().is_empty());

        doc.set("name", "y").unwrap();
        doc.revert();
        assert!(db.unsaved_documents().is_empty());
    }
}
