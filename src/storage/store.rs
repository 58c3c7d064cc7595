use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::index::{entries_for, IndexDefinition};
use super::observer::{ChangeEntry, ObserverInner, ObserverToken};
use super::record::{deserialize_record, revid, serialize_record, RawRecord};
use crate::encoding::{Body, SharedKeys};
use crate::error::{DbError, DbResult};

const DOCS_CF: &str = "docs";
const META_CF: &str = "meta";
const BLOBS_CF: &str = "blobs";
const INDEX_CF: &str = "index";

const SEQ_KEY: &[u8] = b"seq";
const SHARED_KEY_PREFIX: &str = "sk:";
const INDEX_META_PREFIX: &str = "idx:";

/// One record store per canonical path per process. A second `Database`
/// opened on the same directory shares the store, which is what makes its
/// writes *external* changes to the first handle's observers.
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<StoreShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static INSTANCE_IDS: AtomicU64 = AtomicU64::new(1);

/// Hand out an id identifying one database handle; change entries carry the
/// id of the handle that wrote them so observers can tell their own writes
/// from external ones.
pub fn next_instance_id() -> u64 {
    INSTANCE_IDS.fetch_add(1, Ordering::Relaxed)
}

/// A write submitted to the store. `history` carries the revision the write
/// is based on (empty for a brand-new document); a mismatch against the
/// currently-persisted revision is a conflict.
#[derive(Debug)]
pub struct PutRequest {
    pub id: String,
    pub body: Vec<u8>,
    pub history: Vec<String>,
    pub save: bool,
    pub rev_flags: u8,
    pub doc_type: Option<String>,
    pub source: u64,
}

/// RocksDB-backed record store: current revision per document, sequence
/// counter, nested transactions with a read-your-writes overlay committed
/// as a single WriteBatch, change observers, shared-key persistence and
/// naive index maintenance.
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Arc<StoreShared>,
}

pub(crate) struct StoreShared {
    path: PathBuf,
    pub(crate) db: DB,
    read_only: bool,
    keys: Arc<RwLock<SharedKeys>>,
    state: Mutex<StoreState>,
}

struct StoreState {
    sequence: u64,
    txn_depth: u32,
    rolled_back: bool,
    seq_at_begin: u64,
    /// id -> new record, or None for a purge.
    overlay: HashMap<String, Option<RawRecord>>,
    pending_changes: Vec<ChangeEntry>,
    observers: HashMap<u64, Arc<ObserverInner>>,
    next_observer_id: u64,
    indexes: HashMap<String, IndexDefinition>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.shared.path).finish()
    }
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.path);
        tracing::debug!("closed store at {:?}", self.path);
    }
}

/// Retry transient RocksDB failures with a bounded exponential backoff.
fn with_retry<T>(mut op: impl FnMut() -> Result<T, rocksdb::Error>) -> DbResult<T> {
    let mut delay = Duration::from_millis(10);
    for _ in 0..5 {
        match op() {
            Ok(v) => return Ok(v),
            Err(e)
                if matches!(
                    e.kind(),
                    rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain
                ) =>
            {
                tracing::warn!("storage busy, retrying in {:?}", delay);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    op().map_err(Into::into)
}

impl Store {
    /// Open (or share) the store at `path`. Handles on the same canonical
    /// path share one RocksDB environment.
    pub fn open(path: &Path, create: bool, read_only: bool) -> DbResult<Store> {
        if create {
            std::fs::create_dir_all(path)?;
        } else if !path.exists() {
            return Err(DbError::NotFound(format!("no database at {:?}", path)));
        }
        let canonical = path.canonicalize()?;

        let mut registry = REGISTRY.lock();
        if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
            return Ok(Store { shared: existing });
        }

        let mut opts = Options::default();
        opts.create_if_missing(create);
        opts.create_missing_column_families(true);
        opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = [DOCS_CF, META_CF, BLOBS_CF, INDEX_CF]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &canonical, cf_descriptors)
            .map_err(|e| DbError::Storage(format!("failed to open store: {}", e)))?;

        let shared = Arc::new(StoreShared {
            path: canonical.clone(),
            db,
            read_only,
            keys: Arc::new(RwLock::new(SharedKeys::new())),
            state: Mutex::new(StoreState {
                sequence: 0,
                txn_depth: 0,
                rolled_back: false,
                seq_at_begin: 0,
                overlay: HashMap::new(),
                pending_changes: Vec::new(),
                observers: HashMap::new(),
                next_observer_id: 1,
                indexes: HashMap::new(),
            }),
        });

        let store = Store { shared };
        store.load_meta()?;
        registry.insert(canonical, Arc::downgrade(&store.shared));
        tracing::info!("opened store at {:?}", store.shared.path);
        Ok(store)
    }

    /// Destroy the store files at `path`. Fails if a handle is still open.
    pub fn delete_at_path(path: &Path) -> DbResult<()> {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        if REGISTRY
            .lock()
            .get(&canonical)
            .map_or(false, |w| w.strong_count() > 0)
        {
            return Err(DbError::InvalidState(
                "cannot delete a database that is still open".to_string(),
            ));
        }
        DB::destroy(&Options::default(), &canonical)
            .map_err(|e| DbError::Storage(format!("failed to delete store: {}", e)))?;
        let _ = std::fs::remove_dir_all(&canonical);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn keys(&self) -> Arc<RwLock<SharedKeys>> {
        self.shared.keys.clone()
    }

    pub fn same_store(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.shared
            .db
            .cf_handle(name)
            .expect("column family should exist")
    }

    pub(crate) fn blobs_cf(&self) -> &rocksdb::ColumnFamily {
        self.cf(BLOBS_CF)
    }

    fn load_meta(&self) -> DbResult<()> {
        let db = &self.shared.db;
        let meta = self.cf(META_CF);

        let sequence = db
            .get_cf(meta, SEQ_KEY)?
            .and_then(|b| b.try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0);

        {
            let mut keys = self.shared.keys.write();
            let iter = db.prefix_iterator_cf(meta, SHARED_KEY_PREFIX.as_bytes());
            for (key, value) in iter.flatten() {
                let key_str = String::from_utf8_lossy(&key);
                let Some(id_str) = key_str.strip_prefix(SHARED_KEY_PREFIX) else {
                    break;
                };
                if let Ok(id) = id_str.parse::<u32>() {
                    keys.load_known(id, String::from_utf8_lossy(&value).into_owned());
                }
            }
        }

        let mut state = self.shared.state.lock();
        state.sequence = sequence;
        let iter = db.prefix_iterator_cf(meta, INDEX_META_PREFIX.as_bytes());
        for (key, value) in iter.flatten() {
            let key_str = String::from_utf8_lossy(&key);
            if !key_str.starts_with(INDEX_META_PREFIX) {
                break;
            }
            if let Ok(def) = serde_json::from_slice::<IndexDefinition>(&value) {
                state.indexes.insert(def.name.clone(), def);
            }
        }
        Ok(())
    }

    // ==================== Records ====================

    fn read_disk(&self, id: &str) -> DbResult<Option<RawRecord>> {
        match self.shared.db.get_cf(self.cf(DOCS_CF), id.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize_record(id, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Read a record, seeing writes pending in the current transaction.
    pub fn get(&self, id: &str) -> DbResult<Option<RawRecord>> {
        {
            let state = self.shared.state.lock();
            if state.txn_depth > 0 {
                if let Some(entry) = state.overlay.get(id) {
                    return Ok(entry.clone());
                }
            }
        }
        self.read_disk(id)
    }

    /// Submit a write. Returns the new record, or `None` when the expected
    /// parent revision has moved on (a conflict).
    pub fn put(&self, req: PutRequest) -> DbResult<Option<RawRecord>> {
        self.check_writable()?;
        self.begin_transaction()?;
        let result = self.put_inner(req);
        self.end_transaction(result.is_ok())?;
        result
    }

    fn put_inner(&self, req: PutRequest) -> DbResult<Option<RawRecord>> {
        let mut state = self.shared.state.lock();
        let current = match state.overlay.get(&req.id) {
            Some(entry) => entry.clone(),
            None => self.read_disk(&req.id)?,
        };
        let expected = req.history.first().map(String::as_str);

        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(cur), Some(exp)) => cur.rev == exp,
            _ => false,
        };
        if !matches {
            tracing::debug!(
                "put conflict on '{}': expected {:?}, current {:?}",
                req.id,
                expected,
                current.as_ref().map(|c| c.rev.as_str())
            );
            return Ok(None);
        }

        state.sequence += 1;
        let record = RawRecord {
            id: req.id.clone(),
            rev: revid::child_of(expected, req.rev_flags, &req.body),
            sequence: state.sequence,
            flags: req.rev_flags,
            body: req.body,
        };
        state.overlay.insert(req.id.clone(), Some(record.clone()));
        state.pending_changes.push(ChangeEntry {
            doc_id: req.id,
            sequence: record.sequence,
            source: req.source,
        });
        Ok(Some(record))
    }

    /// Remove every trace of a document. Returns whether anything existed.
    pub fn purge(&self, id: &str) -> DbResult<bool> {
        self.check_writable()?;
        self.begin_transaction()?;
        let result = (|| {
            let existed = self.get(id)?.is_some();
            if existed {
                self.shared.state.lock().overlay.insert(id.to_string(), None);
            }
            Ok(existed)
        })();
        self.end_transaction(result.is_ok())?;
        result
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.state.lock().sequence
    }

    pub fn record_count(&self) -> u64 {
        let mut count = 0;
        let iter = self
            .shared
            .db
            .iterator_cf(self.cf(DOCS_CF), rocksdb::IteratorMode::Start);
        for item in iter.flatten() {
            let (id, bytes) = item;
            if let Ok(record) = deserialize_record(&String::from_utf8_lossy(&id), &bytes) {
                if !record.is_deleted() {
                    count += 1;
                }
            }
        }
        count
    }

    fn check_writable(&self) -> DbResult<()> {
        if self.shared.read_only {
            return Err(DbError::InvalidState("database is read-only".to_string()));
        }
        Ok(())
    }

    // ==================== Transactions ====================

    pub fn begin_transaction(&self) -> DbResult<()> {
        let mut state = self.shared.state.lock();
        if state.txn_depth == 0 {
            state.seq_at_begin = state.sequence;
            state.rolled_back = false;
        }
        state.txn_depth += 1;
        Ok(())
    }

    pub fn end_transaction(&self, commit: bool) -> DbResult<()> {
        let notes = {
            let mut state = self.shared.state.lock();
            if state.txn_depth == 0 {
                return Err(DbError::InvalidState("no transaction open".to_string()));
            }
            if !commit {
                state.rolled_back = true;
            }
            state.txn_depth -= 1;
            if state.txn_depth > 0 {
                return Ok(());
            }

            if state.rolled_back {
                state.sequence = state.seq_at_begin;
                state.overlay.clear();
                state.pending_changes.clear();
                state.rolled_back = false;
                tracing::debug!("transaction rolled back");
                return Ok(());
            }

            self.commit_overlay(&mut state)?;
            std::mem::take(&mut state.pending_changes)
        };

        if !notes.is_empty() {
            self.notify_observers(notes);
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.shared.state.lock().txn_depth > 0
    }

    fn commit_overlay(&self, state: &mut StoreState) -> DbResult<()> {
        if state.overlay.is_empty() && state.sequence == state.seq_at_begin {
            let keys = self.shared.keys.read();
            if keys.unpersisted().count() == 0 {
                return Ok(());
            }
        }

        // Capture old index entries before the batch overwrites the records.
        let mut index_deletes: Vec<Vec<u8>> = Vec::new();
        let mut index_puts: Vec<Vec<u8>> = Vec::new();
        if !state.indexes.is_empty() {
            for (id, entry) in &state.overlay {
                if let Some(old) = self.read_disk(id)? {
                    self.collect_entries(state, &old, &mut index_deletes);
                }
                if let Some(new) = entry {
                    self.collect_entries(state, new, &mut index_puts);
                }
            }
        }

        let overlay = std::mem::take(&mut state.overlay);
        let sequence = state.sequence;
        let mut rows: Vec<(String, Option<Vec<u8>>)> = Vec::with_capacity(overlay.len());
        for (id, entry) in &overlay {
            match entry {
                Some(record) => rows.push((id.clone(), Some(serialize_record(record)?))),
                None => rows.push((id.clone(), None)),
            }
        }

        with_retry(|| {
            let mut batch = WriteBatch::default();
            let docs = self.cf(DOCS_CF);
            let meta = self.cf(META_CF);
            let index = self.cf(INDEX_CF);

            for (id, bytes) in &rows {
                match bytes {
                    Some(bytes) => batch.put_cf(docs, id.as_bytes(), bytes),
                    None => batch.delete_cf(docs, id.as_bytes()),
                }
            }
            for key in &index_deletes {
                batch.delete_cf(index, key);
            }
            for key in &index_puts {
                batch.put_cf(index, key, []);
            }
            batch.put_cf(meta, SEQ_KEY, sequence.to_le_bytes());
            {
                let keys = self.shared.keys.read();
                for (id, key) in keys.unpersisted() {
                    batch.put_cf(meta, shared_key_row(id), key.as_bytes());
                }
            }
            self.shared.db.write(batch)
        })?;

        self.shared.keys.write().mark_persisted();
        Ok(())
    }

    fn collect_entries(&self, state: &StoreState, record: &RawRecord, out: &mut Vec<Vec<u8>>) {
        if record.body.is_empty() {
            return;
        }
        let Ok(body) = Body::parse(record.body.clone(), self.shared.keys.clone()) else {
            return;
        };
        for def in state.indexes.values() {
            out.extend(entries_for(def, &body.root(), &record.id));
        }
    }

    // ==================== Observers ====================

    pub fn observe(&self, owner: u64, callback: Box<dyn Fn() + Send + Sync>) -> ObserverToken {
        let inner = Arc::new(ObserverInner {
            owner,
            queue: Mutex::new(VecDeque::new()),
            callback,
        });
        let mut state = self.shared.state.lock();
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers.insert(id, inner.clone());
        ObserverToken {
            store: self.clone(),
            id,
            inner,
        }
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        self.shared.state.lock().observers.remove(&id);
    }

    /// Deliver committed changes and wake observers. Called with the state
    /// lock released so callbacks are free to read the store.
    fn notify_observers(&self, notes: Vec<ChangeEntry>) {
        let observers: Vec<Arc<ObserverInner>> = {
            let state = self.shared.state.lock();
            state.observers.values().cloned().collect()
        };
        for obs in &observers {
            obs.queue.lock().extend(notes.iter().cloned());
        }
        for obs in &observers {
            (obs.callback)();
        }
    }

    // ==================== Indexes ====================

    pub fn create_index(&self, def: IndexDefinition) -> DbResult<()> {
        self.check_writable()?;
        self.delete_index(&def.name)?;

        let mut puts: Vec<Vec<u8>> = Vec::new();
        {
            let iter = self
                .shared
                .db
                .iterator_cf(self.cf(DOCS_CF), rocksdb::IteratorMode::Start);
            for item in iter.flatten() {
                let (id, bytes) = item;
                let id = String::from_utf8_lossy(&id).into_owned();
                let Ok(record) = deserialize_record(&id, &bytes) else {
                    continue;
                };
                if record.body.is_empty() || record.is_deleted() {
                    continue;
                }
                if let Ok(body) = Body::parse(record.body.clone(), self.shared.keys.clone()) {
                    puts.extend(entries_for(&def, &body.root(), &id));
                }
            }
        }

        let def_bytes = serde_json::to_vec(&def)?;
        with_retry(|| {
            let mut batch = WriteBatch::default();
            batch.put_cf(self.cf(META_CF), index_meta_row(&def.name), &def_bytes);
            for key in &puts {
                batch.put_cf(self.cf(INDEX_CF), key, []);
            }
            self.shared.db.write(batch)
        })?;

        tracing::info!("created {:?} index '{}'", def.index_type, def.name);
        self.shared.state.lock().indexes.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        self.check_writable()?;
        if self.shared.state.lock().indexes.remove(name).is_none() {
            return Ok(());
        }

        let prefix = format!("{}:", name);
        let mut stale: Vec<Box<[u8]>> = Vec::new();
        let iter = self
            .shared
            .db
            .prefix_iterator_cf(self.cf(INDEX_CF), prefix.as_bytes());
        for (key, _) in iter.flatten() {
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            stale.push(key);
        }
        with_retry(|| {
            let mut batch = WriteBatch::default();
            batch.delete_cf(self.cf(META_CF), index_meta_row(name));
            for key in &stale {
                batch.delete_cf(self.cf(INDEX_CF), key);
            }
            self.shared.db.write(batch)
        })?;
        tracing::info!("deleted index '{}'", name);
        Ok(())
    }

    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.shared.state.lock().indexes.values().cloned().collect()
    }
}

fn shared_key_row(id: u32) -> Vec<u8> {
    format!("{}{:08}", SHARED_KEY_PREFIX, id).into_bytes()
}

fn index_meta_row(name: &str) -> Vec<u8> {
    format!("{}{}", INDEX_META_PREFIX, name).into_bytes()
}
