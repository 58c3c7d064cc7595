pub mod blob;
pub(crate) mod properties;
pub mod subdocument;

pub use blob::Blob;
pub use subdocument::Subdocument;

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::encoding::{encode_body, Body};
use crate::error::{DbError, DbResult};
use crate::storage::{flags, revid, PutRequest, RawRecord};
use crate::value::Value;

use properties::Container;

/// Resolves a save conflict: given the in-memory view (`mine`), the
/// currently-persisted view (`theirs`) and the common ancestor (`base`),
/// produce the merged map to save, or `None` to give up and surface the
/// conflict.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        mine: Option<&HashMap<String, Value>>,
        theirs: Option<&HashMap<String, Value>>,
        base: Option<&HashMap<String, Value>>,
    ) -> Option<HashMap<String, Value>>;
}

impl<F> ConflictResolver for F
where
    F: Fn(
            Option<&HashMap<String, Value>>,
            Option<&HashMap<String, Value>>,
            Option<&HashMap<String, Value>>,
        ) -> Option<HashMap<String, Value>>
        + Send
        + Sync,
{
    fn resolve(
        &self,
        mine: Option<&HashMap<String, Value>>,
        theirs: Option<&HashMap<String, Value>>,
        base: Option<&HashMap<String, Value>>,
    ) -> Option<HashMap<String, Value>> {
        self(mine, theirs, base)
    }
}

/// Handle for removing a registered document listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken {
    id: u64,
    kind: ListenerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Mutation,
    Saved,
}

pub(crate) struct DocumentInner {
    id: String,
    database: Database,
    container: Container,
    meta: Mutex<DocMeta>,
    listeners: Mutex<Listeners>,
}

struct DocMeta {
    record: Option<RawRecord>,
    /// Keeps the current revision body alive; the container's encoded root
    /// aliases it, so it must outlive every decoded view.
    body: Option<Body>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

#[derive(Default)]
struct Listeners {
    next: u64,
    mutation: HashMap<u64, Box<dyn Fn(&Document) + Send>>,
    saved: HashMap<u64, Box<dyn Fn(&Document, bool) + Send>>,
}

/// A document: a property container bound to a persistent record with a
/// stable id and revision tracking. Cloning the handle clones the
/// identity; the database hands out the same live instance per id.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("exists", &self.exists())
            .field("has_changes", &self.has_changes())
            .finish()
    }
}

impl Document {
    pub(crate) fn load(database: Database, id: String) -> DbResult<Document> {
        let record = database.store().get(&id)?;
        let blob_store = database.blob_store().clone();
        let inner = Arc::new_cyclic(|weak| {
            let container = properties::new_container();
            {
                let mut st = container.lock();
                st.owner = weak.clone();
                st.store = Some(blob_store.clone());
            }
            DocumentInner {
                id,
                database,
                container,
                meta: Mutex::new(DocMeta {
                    record: None,
                    body: None,
                    resolver: None,
                }),
                listeners: Mutex::new(Listeners::default()),
            }
        });
        let doc = Document { inner };
        if let Some(record) = record {
            doc.bind_record(record)?;
        }
        Ok(doc)
    }

    pub(crate) fn from_inner(inner: Arc<DocumentInner>) -> Document {
        Document { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<DocumentInner> {
        &self.inner
    }

    /// Bind a record as the document's current revision: parse its body,
    /// swap the encoded root in, and rebase the staged map onto it.
    fn bind_record(&self, record: RawRecord) -> DbResult<()> {
        let body = if record.body.is_empty() || record.is_deleted() {
            None
        } else {
            Some(Body::parse(
                record.body.clone(),
                self.inner.database.store().keys(),
            )?)
        };
        let root = body.as_ref().map(|b| b.root());
        {
            let mut meta = self.inner.meta.lock();
            meta.record = Some(record);
            meta.body = body;
        }
        properties::use_new_root(
            &self.inner.container,
            root,
            Some(self.inner.database.blob_store().clone()),
        );
        Ok(())
    }

    fn unbind_record(&self) {
        {
            let mut meta = self.inner.meta.lock();
            meta.record = None;
            meta.body = None;
        }
        properties::use_new_root(&self.inner.container, None, None);
    }

    // ==================== Identity & state ====================

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    /// Whether the document has ever been saved (a record exists, even a
    /// deleted one).
    pub fn exists(&self) -> bool {
        self.inner.meta.lock().record.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner
            .meta
            .lock()
            .record
            .as_ref()
            .map(|r| r.is_deleted())
            .unwrap_or(false)
    }

    pub fn sequence(&self) -> u64 {
        self.inner
            .meta
            .lock()
            .record
            .as_ref()
            .map(|r| r.sequence)
            .unwrap_or(0)
    }

    pub fn revision_id(&self) -> Option<String> {
        self.inner.meta.lock().record.as_ref().map(|r| r.rev.clone())
    }

    pub fn has_changes(&self) -> bool {
        properties::has_changes(&self.inner.container)
    }

    // ==================== Property access ====================

    pub fn get(&self, key: &str) -> Value {
        properties::get(&self.inner.container, key)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> DbResult<()> {
        properties::set(&self.inner.container, key, value.into())
    }

    pub fn remove(&self, key: &str) -> DbResult<()> {
        properties::remove(&self.inner.container, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        properties::contains(&self.inner.container, key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        properties::get_bool(&self.inner.container, key)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        properties::get_i64(&self.inner.container, key)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        properties::get_f64(&self.inner.container, key)
    }

    pub fn get_f32(&self, key: &str) -> f32 {
        properties::get_f32(&self.inner.container, key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        properties::get_string(&self.inner.container, key)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        properties::get_date(&self.inner.container, key)
    }

    pub fn get_blob(&self, key: &str) -> Option<Blob> {
        self.get(key).as_blob()
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        self.get(key).as_array()
    }

    pub fn get_subdocument(&self, key: &str) -> Option<Subdocument> {
        self.get(key).as_dict()
    }

    pub fn properties(&self) -> Option<HashMap<String, Value>> {
        properties::properties(&self.inner.container)
    }

    pub fn replace_properties(&self, props: Option<HashMap<String, Value>>) -> DbResult<()> {
        properties::replace_properties(&self.inner.container, props, true)
    }

    pub fn properties_as_json(&self) -> String {
        let map = properties::plain_properties(&self.inner.container).unwrap_or_default();
        Value::Map(map).to_json().to_string()
    }

    pub fn set_properties_as_json(&self, json: &str) -> DbResult<()> {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        match Value::from_json(&parsed) {
            Value::Map(map) => self.replace_properties(Some(map)),
            Value::Null => self.replace_properties(None),
            other => Err(DbError::InvalidValue(format!(
                "document properties must be a JSON object, got {}",
                other.type_name()
            ))),
        }
    }

    /// Discard staged changes, re-mounting subdocuments that still have a
    /// persisted root.
    pub fn revert(&self) {
        properties::revert(&self.inner.container);
        self.inner.database.clear_unsaved(&self.inner.id);
    }

    // ==================== Persistence ====================

    pub fn save(&self) -> DbResult<()> {
        self.save_internal(false)
    }

    /// Persist a deletion. The record remains (with its revision history);
    /// the properties view becomes empty. Deletion can still conflict and
    /// run the resolver.
    pub fn delete(&self) -> DbResult<()> {
        if !self.exists() {
            return Err(DbError::NotFound(self.inner.id.clone()));
        }
        self.save_internal(true)
    }

    fn save_internal(&self, deletion: bool) -> DbResult<()> {
        let db = self.inner.database.clone();
        db.ensure_open()?;

        if !self.has_changes() && !deletion && self.exists() {
            return Ok(());
        }

        let mut ended_early = false;
        db.in_batch(|| {
            let record = match self.try_put(deletion)? {
                Some(record) => record,
                None => {
                    tracing::debug!("save of '{}' conflicted, merging", self.inner.id);
                    self.merge(deletion)?;
                    if !self.has_changes() {
                        ended_early = true;
                        return Ok(());
                    }
                    match self.try_put(deletion)? {
                        Some(record) => record,
                        None => {
                            return Err(DbError::Conflict(format!(
                                "document '{}' could not be saved after one retry",
                                self.inner.id
                            )))
                        }
                    }
                }
            };
            self.bind_record(record)
        })?;

        if ended_early {
            return Ok(());
        }
        if deletion {
            properties::replace_properties(&self.inner.container, None, true)?;
        }
        properties::reset_changed(&self.inner.container);
        db.clear_unsaved(&self.inner.id);
        self.fire_saved(false);
        Ok(())
    }

    /// Serialize the staged view and submit it atop the revision we were
    /// loaded from. `None` means the store reported a conflict.
    fn try_put(&self, deletion: bool) -> DbResult<Option<RawRecord>> {
        let db = &self.inner.database;
        let store = db.store();

        let (view, has_blobs) = properties::save_view(&self.inner.container, db.blob_store())?;
        let mut rev_flags = 0;
        if deletion {
            rev_flags |= flags::DELETED;
        }
        if has_blobs {
            rev_flags |= flags::HAS_ATTACHMENTS;
        }

        let body = {
            let keys = store.keys();
            let mut keys = keys.write();
            encode_body(&view, &mut keys)?
        };
        let history = self
            .inner
            .meta
            .lock()
            .record
            .as_ref()
            .map(|r| vec![r.rev.clone()])
            .unwrap_or_default();

        store.put(PutRequest {
            id: self.inner.id.clone(),
            body,
            history,
            save: true,
            rev_flags,
            doc_type: None,
            source: db.instance_id(),
        })
    }

    /// Conflict resolution: fetch the persisted state, pick or build the
    /// winning map, rebind onto the persisted revision and stage the
    /// winner as a full replacement. When the winner equals the persisted
    /// state there is nothing left to write and the change set clears.
    fn merge(&self, deletion: bool) -> DbResult<()> {
        let db = &self.inner.database;
        let theirs_record = db.store().get(&self.inner.id)?;

        let theirs: Option<HashMap<String, Value>> = match &theirs_record {
            Some(rec) if !rec.is_deleted() && !rec.body.is_empty() => {
                let body = Body::parse(rec.body.clone(), db.store().keys())?;
                Some(body.root().to_plain())
            }
            _ => None,
        };
        let mine = properties::plain_properties(&self.inner.container);
        let (base, current_rev) = {
            let meta = self.inner.meta.lock();
            (
                meta.body.as_ref().map(|b| b.root().to_plain()),
                meta.record.as_ref().map(|r| r.rev.clone()),
            )
        };

        let resolved: Option<HashMap<String, Value>> = if deletion {
            theirs.clone()
        } else {
            let resolver = {
                let meta = self.inner.meta.lock();
                meta.resolver.clone().or_else(|| db.default_resolver())
            };
            match resolver {
                Some(resolver) => {
                    match resolver.resolve(mine.as_ref(), theirs.as_ref(), base.as_ref()) {
                        Some(merged) => Some(merged),
                        None => {
                            return Err(DbError::Conflict(format!(
                                "conflict resolver gave up on document '{}'",
                                self.inner.id
                            )))
                        }
                    }
                }
                None => {
                    // Mine is deeper wins; ties favor mine.
                    let my_generation =
                        current_rev.as_deref().map(revid::generation).unwrap_or(0) + 1;
                    let their_generation = theirs_record
                        .as_ref()
                        .map(|r| revid::generation(&r.rev))
                        .unwrap_or(0);
                    if my_generation >= their_generation {
                        mine
                    } else {
                        theirs.clone()
                    }
                }
            }
        };

        match theirs_record {
            Some(record) => self.bind_record(record)?,
            None => self.unbind_record(),
        }

        let unchanged = Value::Map(resolved.clone().unwrap_or_default())
            == Value::Map(theirs.unwrap_or_default());
        properties::replace_properties(&self.inner.container, resolved, true)?;
        if unchanged {
            properties::reset_changed(&self.inner.container);
            db.clear_unsaved(&self.inner.id);
        }
        Ok(())
    }

    /// Remove every trace of the document from storage. Purges are not
    /// tracked as revisions. Returns whether anything was purged.
    pub fn purge(&self) -> DbResult<bool> {
        let db = self.inner.database.clone();
        db.ensure_open()?;
        if !self.exists() {
            return Ok(false);
        }
        db.in_batch(|| db.store().purge(&self.inner.id))?;
        self.unbind_record();
        properties::clear(&self.inner.container);
        db.clear_unsaved(&self.inner.id);
        Ok(true)
    }

    /// React to a change persisted by another database handle. Documents
    /// with pending mutations ignore the notification; their conflict is
    /// handled at the next save.
    pub(crate) fn changed_externally(&self) {
        if self.has_changes() {
            return;
        }
        match self.inner.database.store().get(&self.inner.id) {
            Ok(Some(record)) => {
                if let Err(e) = self.bind_record(record) {
                    tracing::warn!("reload of '{}' failed: {}", self.inner.id, e);
                    return;
                }
            }
            Ok(None) => self.unbind_record(),
            Err(e) => {
                tracing::warn!("reload of '{}' failed: {}", self.inner.id, e);
                return;
            }
        }
        self.fire_saved(true);
    }

    // ==================== Conflict resolver & listeners ====================

    pub fn set_conflict_resolver(&self, resolver: Option<Arc<dyn ConflictResolver>>) {
        self.inner.meta.lock().resolver = resolver;
    }

    /// Fires on every key mutation anywhere in the document's tree.
    pub fn add_mutation_listener(
        &self,
        listener: impl Fn(&Document) + Send + 'static,
    ) -> ListenerToken {
        let mut listeners = self.inner.listeners.lock();
        listeners.next += 1;
        let id = listeners.next;
        listeners.mutation.insert(id, Box::new(listener));
        ListenerToken {
            id,
            kind: ListenerKind::Mutation,
        }
    }

    /// Fires after each successful save; the flag is true when the change
    /// came from another database handle.
    pub fn add_saved_listener(
        &self,
        listener: impl Fn(&Document, bool) + Send + 'static,
    ) -> ListenerToken {
        let mut listeners = self.inner.listeners.lock();
        listeners.next += 1;
        let id = listeners.next;
        listeners.saved.insert(id, Box::new(listener));
        ListenerToken {
            id,
            kind: ListenerKind::Saved,
        }
    }

    pub fn remove_listener(&self, token: ListenerToken) {
        let mut listeners = self.inner.listeners.lock();
        match token.kind {
            ListenerKind::Mutation => {
                listeners.mutation.remove(&token.id);
            }
            ListenerKind::Saved => {
                listeners.saved.remove(&token.id);
            }
        }
    }

    fn fire_saved(&self, external: bool) {
        let listeners = self.inner.listeners.lock();
        for listener in listeners.saved.values() {
            listener(self, external);
        }
    }
}

impl DocumentInner {
    /// Called (with no container lock held) after any mutation in the
    /// document's tree.
    pub(crate) fn note_mutated(inner: &Arc<DocumentInner>) {
        let doc = Document {
            inner: inner.clone(),
        };
        inner.database.note_unsaved(&inner.id);
        let listeners = inner.listeners.lock();
        for listener in listeners.mutation.values() {
            listener(&doc);
        }
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
