use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::encoding::{Decoded, DictRef};
use crate::error::{DbError, DbResult};
use crate::storage::BlobStore;
use crate::value::Value;

use super::blob::Blob;
use super::subdocument::Subdocument;
use super::DocumentInner;

pub(crate) type Container = Arc<Mutex<PropertyState>>;
pub(crate) type WeakContainer = Weak<Mutex<PropertyState>>;

/// Link from a nested container to the container that holds it, carrying
/// the key it lives under. Weak, so child trees never keep parents alive.
#[derive(Clone)]
pub(crate) struct ParentLink {
    pub container: WeakContainer,
    pub key: String,
}

/// Shared state of one property container (a document root or a
/// subdocument). One non-reentrant mutex per instance; every public
/// operation goes through it.
pub(crate) struct PropertyState {
    /// Immutable view into the currently-persisted revision body.
    pub root: Option<DictRef>,
    /// Mutable overlay: values written, or memoized from the root.
    pub staged: Option<HashMap<String, Value>>,
    /// Staged keys that must be written on the next save.
    pub changed: HashSet<String>,
    /// Present on subdocuments that are mounted in a tree.
    pub parent: Option<ParentLink>,
    /// Present on a document's root container only.
    pub owner: Weak<DocumentInner>,
    /// Used to rehydrate installed blobs found in the root.
    pub store: Option<BlobStore>,
    /// Whether every root key has been backfilled into the staged map.
    pub fully_materialized: bool,
}

impl PropertyState {
    fn staged_mut(&mut self) -> &mut HashMap<String, Value> {
        self.staged.get_or_insert_with(HashMap::new)
    }

    fn staged_get(&self, key: &str) -> Option<&Value> {
        self.staged.as_ref().and_then(|s| s.get(key))
    }
}

pub(crate) fn new_container() -> Container {
    Arc::new(Mutex::new(PropertyState {
        root: None,
        staged: None,
        changed: HashSet::new(),
        parent: None,
        owner: Weak::new(),
        store: None,
        fully_materialized: false,
    }))
}

// ==================== Reads ====================

fn is_blob_dict(dict: &DictRef) -> bool {
    dict.get_string("_cbltype").as_deref() == Some("blob")
}

fn map_is_blob(map: &HashMap<String, Value>) -> bool {
    matches!(map.get("_cbltype"), Some(Value::String(s)) if s == "blob")
}

fn leaf_to_value(leaf: &Decoded) -> Value {
    match leaf {
        Decoded::Null => Value::Null,
        Decoded::Bool(b) => Value::Bool(*b),
        Decoded::Int(i) => Value::Int(*i),
        Decoded::Float(f) => Value::Float(*f),
        Decoded::Double(d) => Value::Double(*d),
        Decoded::String(s) => Value::String(s.clone()),
        Decoded::Dict(_) | Decoded::Array(_) => Value::Null,
    }
}

/// Turn a decoded root value into a live value: dicts mount as
/// subdocuments (or installed blobs), arrays recurse, scalars copy out.
fn mount_decoded(
    decoded: &Decoded,
    parent: &WeakContainer,
    key: &str,
    store: &Option<BlobStore>,
) -> Value {
    match decoded {
        Decoded::Dict(d) if is_blob_dict(d) => Value::Blob(Blob::from_dict(d, store.clone())),
        Decoded::Dict(d) => Value::Dict(Subdocument::from_root(
            d.clone(),
            ParentLink {
                container: parent.clone(),
                key: key.to_string(),
            },
            store.clone(),
        )),
        Decoded::Array(a) => Value::Array(
            (0..a.len())
                .map(|i| {
                    a.get(i)
                        .map(|elem| mount_decoded(&elem, parent, key, store))
                        .unwrap_or(Value::Null)
                })
                .collect(),
        ),
        leaf => leaf_to_value(leaf),
    }
}

/// Effective value of a key. Subdocuments and arrays read out of the root
/// are memoized so their identity is stable; scalars are re-decoded on
/// every read and stay out of the staged map.
pub(crate) fn get(container: &Container, key: &str) -> Value {
    let mut st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.clone();
    }
    let Some(root) = st.root.clone() else {
        return Value::Null;
    };
    let Some(decoded) = root.get(key) else {
        return Value::Null;
    };
    let value = mount_decoded(&decoded, &Arc::downgrade(container), key, &st.store);
    if matches!(value, Value::Dict(_) | Value::Array(_)) {
        st.staged_mut().insert(key.to_string(), value.clone());
    }
    value
}

pub(crate) fn contains(container: &Container, key: &str) -> bool {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return !v.is_null();
    }
    st.root.as_ref().map(|r| r.contains(key)).unwrap_or(false)
}

// Typed getters go straight through the encoded root when nothing is
// staged, so scalar reads never grow the staged map.

pub(crate) fn get_bool(container: &Container, key: &str) -> bool {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_bool();
    }
    st.root.as_ref().map(|r| r.get_bool(key)).unwrap_or(false)
}

pub(crate) fn get_i64(container: &Container, key: &str) -> i64 {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_i64();
    }
    st.root.as_ref().map(|r| r.get_i64(key)).unwrap_or(0)
}

pub(crate) fn get_f64(container: &Container, key: &str) -> f64 {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_f64();
    }
    st.root.as_ref().map(|r| r.get_f64(key)).unwrap_or(0.0)
}

pub(crate) fn get_f32(container: &Container, key: &str) -> f32 {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_f32();
    }
    st.root.as_ref().map(|r| r.get_f32(key)).unwrap_or(0.0)
}

pub(crate) fn get_string(container: &Container, key: &str) -> Option<String> {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_string();
    }
    st.root.as_ref().and_then(|r| r.get_string(key))
}

pub(crate) fn get_date(
    container: &Container,
    key: &str,
) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let st = container.lock();
    if let Some(v) = st.staged_get(key) {
        return v.as_date();
    }
    st.root
        .as_ref()
        .and_then(|r| r.get_string(key))
        .and_then(|s| crate::value::parse_date(&s))
}

// ==================== Writes ====================

/// Check a value is representable end to end. The enum keeps almost
/// everything well-formed by construction; the holes are non-finite floats,
/// which the JSON bridge cannot express.
pub(crate) fn validate(value: &Value) -> DbResult<()> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(DbError::InvalidValue(
            "non-finite float is not a valid property value".to_string(),
        )),
        Value::Double(d) if !d.is_finite() => Err(DbError::InvalidValue(
            "non-finite double is not a valid property value".to_string(),
        )),
        Value::Array(items) => items.iter().try_for_each(validate),
        Value::Map(map) => map.values().try_for_each(validate),
        _ => Ok(()),
    }
}

/// Invalidate any subdocuments displaced out of `old`, including ones
/// nested inside lists.
fn invalidate_displaced(old: Option<&Value>) {
    match old {
        Some(Value::Dict(sub)) => invalidate(sub.state()),
        Some(Value::Array(items)) => {
            for item in items {
                invalidate_displaced(Some(item));
            }
        }
        _ => {}
    }
}

/// Detach a container: parent link, root binding, staged map and change
/// set all go, recursively. The instance becomes an empty detached dict.
pub(crate) fn invalidate(container: &Container) {
    let children = {
        let mut st = container.lock();
        st.parent = None;
        st.root = None;
        st.owner = Weak::new();
        st.store = None;
        st.changed.clear();
        st.fully_materialized = false;
        let mut children = Vec::new();
        if let Some(staged) = st.staged.take() {
            for value in staged.values() {
                collect_subdocs(value, &mut children);
            }
        }
        children
    };
    for child in children {
        invalidate(child.state());
    }
}

fn collect_subdocs(value: &Value, out: &mut Vec<Subdocument>) {
    match value {
        Value::Dict(sub) => out.push(sub.clone()),
        Value::Array(items) => {
            for item in items {
                collect_subdocs(item, out);
            }
        }
        _ => {}
    }
}

fn adopt(sub: &Subdocument, parent: &WeakContainer, key: &str, store: &Option<BlobStore>) {
    let mut st = sub.state().lock();
    st.parent = Some(ParentLink {
        container: parent.clone(),
        key: key.to_string(),
    });
    if st.store.is_none() {
        st.store = store.clone();
    }
}

/// Convert an incoming value for storage at (parent, key), reusing or
/// displacing whatever live instance sits there now.
fn convert_value(
    parent: &WeakContainer,
    key: &str,
    new: Value,
    old: Option<&Value>,
    store: &Option<BlobStore>,
) -> DbResult<Value> {
    match new {
        Value::Dict(sub) => {
            let current_parent = sub.state().lock().parent.clone();
            match current_parent {
                // Already mounted at this very slot: a reorder, keep as-is.
                Some(link) if link.container.ptr_eq(parent) && link.key == key => {
                    Ok(Value::Dict(sub))
                }
                // Owned elsewhere: copy its contents instead of stealing it.
                Some(_) => {
                    let contents = sub.plain_map();
                    match old {
                        Some(Value::Dict(old_sub)) if !old_sub.same_instance(&sub) => {
                            replace_properties(old_sub.state(), contents, false)?;
                            Ok(Value::Dict(old_sub.clone()))
                        }
                        _ => {
                            invalidate_displaced(old);
                            let fresh = Subdocument::new();
                            adopt(&fresh, parent, key, store);
                            replace_properties(fresh.state(), contents, false)?;
                            Ok(Value::Dict(fresh))
                        }
                    }
                }
                // Unowned: adopt it here.
                None => {
                    match old {
                        Some(Value::Dict(old_sub)) if old_sub.same_instance(&sub) => {}
                        other => invalidate_displaced(other),
                    }
                    adopt(&sub, parent, key, store);
                    Ok(Value::Dict(sub))
                }
            }
        }
        Value::Map(map) => {
            if map_is_blob(&map) {
                invalidate_displaced(old);
                Ok(Value::Blob(Blob::from_map(&map, store.clone())?))
            } else {
                let target = match old {
                    Some(Value::Dict(old_sub)) => old_sub.clone(),
                    other => {
                        invalidate_displaced(other);
                        let fresh = Subdocument::new();
                        adopt(&fresh, parent, key, store);
                        fresh
                    }
                };
                replace_properties(target.state(), Some(map), false)?;
                Ok(Value::Dict(target))
            }
        }
        Value::Array(items) => {
            let empty: Vec<Value> = Vec::new();
            let old_items: &[Value] = match old {
                Some(Value::Array(v)) => v,
                other => {
                    invalidate_displaced(other);
                    &empty
                }
            };
            let new_len = items.len();
            let mut converted = Vec::with_capacity(new_len);
            for (i, item) in items.into_iter().enumerate() {
                converted.push(convert_value(parent, key, item, old_items.get(i), store)?);
            }
            for leftover in old_items.iter().skip(new_len) {
                invalidate_displaced(Some(leftover));
            }
            Ok(Value::Array(converted))
        }
        other => {
            invalidate_displaced(old);
            Ok(other)
        }
    }
}

fn effective_for_compare(st: &PropertyState, key: &str) -> Value {
    if let Some(v) = st.staged_get(key) {
        return v.clone();
    }
    st.root
        .as_ref()
        .and_then(|r| r.get(key))
        .map(|d| d.to_plain())
        .unwrap_or(Value::Null)
}

/// Stage a value at a key. A write equal to the current effective value is
/// a no-op; anything else stages the converted value, marks the key
/// changed, and bubbles the mutation to the owning document.
pub(crate) fn set(container: &Container, key: &str, value: Value) -> DbResult<()> {
    validate(&value)?;
    let mutated = {
        let mut st = container.lock();
        if effective_for_compare(&st, key) == value {
            false
        } else {
            let old = st.staged_get(key).cloned();
            let store = st.store.clone();
            let converted =
                convert_value(&Arc::downgrade(container), key, value, old.as_ref(), &store)?;
            st.staged_mut().insert(key.to_string(), converted);
            st.changed.insert(key.to_string());
            true
        }
    };
    if mutated {
        dispatch_mutation(container);
    }
    Ok(())
}

pub(crate) fn remove(container: &Container, key: &str) -> DbResult<()> {
    set(container, key, Value::Null)
}

pub(crate) fn has_changes(container: &Container) -> bool {
    !container.lock().changed.is_empty()
}

/// Drop staged changes. Subdocuments that still have a persisted root are
/// reverted in place and stay mounted so their identity survives; freshly
/// assigned ones are invalidated.
pub(crate) fn revert(container: &Container) {
    let mut to_invalidate = Vec::new();
    let mut to_revert = Vec::new();
    {
        let mut st = container.lock();
        let changed: Vec<String> = st.changed.drain().collect();
        let Some(staged) = st.staged.as_mut() else {
            return;
        };
        for key in changed {
            match staged.get(&key) {
                Some(Value::Dict(sub)) => {
                    let sub = sub.clone();
                    if sub.state().lock().root.is_some() {
                        to_revert.push(sub);
                    } else {
                        to_invalidate.push(sub);
                        staged.remove(&key);
                    }
                }
                Some(Value::Array(items)) => {
                    let mut subs = Vec::new();
                    for item in items {
                        collect_subdocs(item, &mut subs);
                    }
                    for sub in subs {
                        if sub.state().lock().root.is_some() {
                            to_revert.push(sub);
                        } else {
                            to_invalidate.push(sub);
                        }
                    }
                    staged.remove(&key);
                }
                _ => {
                    staged.remove(&key);
                }
            }
        }
        st.fully_materialized = false;
    }
    for sub in to_invalidate {
        invalidate(sub.state());
    }
    for sub in to_revert {
        revert(sub.state());
    }
}

/// Bulk replacement. Every new key is converted like a `set`; every prior
/// key absent from the new map is staged as a removal so the next save
/// writes a full replacement. Unlike `set`, a key whose value is unchanged
/// is still recorded as changed.
pub(crate) fn replace_properties(
    container: &Container,
    new: Option<HashMap<String, Value>>,
    dispatch: bool,
) -> DbResult<()> {
    if let Some(map) = &new {
        map.values().try_for_each(validate)?;
    }
    {
        let mut st = container.lock();
        let parent = Arc::downgrade(container);
        let store = st.store.clone();

        let mut old_keys: HashSet<String> = st
            .staged
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(root) = &st.root {
            old_keys.extend(root.keys());
        }

        let mut staged_new = HashMap::new();
        for (key, value) in new.unwrap_or_default() {
            let old = st.staged_get(&key).cloned();
            let converted = convert_value(&parent, &key, value, old.as_ref(), &store)?;
            st.changed.insert(key.clone());
            staged_new.insert(key, converted);
        }
        for key in old_keys {
            if staged_new.contains_key(&key) {
                continue;
            }
            invalidate_displaced(st.staged_get(&key));
            st.changed.insert(key.clone());
            staged_new.insert(key, Value::Null);
        }

        st.staged = Some(staged_new);
        st.fully_materialized = true;
    }
    if dispatch {
        dispatch_mutation(container);
    }
    Ok(())
}

// ==================== Snapshots ====================

/// Backfill every root key into the staged map so iteration is stable,
/// then snapshot the non-null view. An empty view reads as `None`.
pub(crate) fn properties(container: &Container) -> Option<HashMap<String, Value>> {
    let mut st = container.lock();
    materialize(&mut st, container);
    let snapshot: HashMap<String, Value> = st
        .staged
        .as_ref()?
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if snapshot.is_empty() {
        None
    } else {
        Some(snapshot)
    }
}

fn materialize(st: &mut PropertyState, container: &Container) {
    if st.fully_materialized {
        return;
    }
    if let Some(root) = st.root.clone() {
        let parent = Arc::downgrade(container);
        for key in root.keys() {
            if st.staged.as_ref().map_or(false, |s| s.contains_key(&key)) {
                continue;
            }
            if let Some(decoded) = root.get(&key) {
                let value = mount_decoded(&decoded, &parent, &key, &st.store);
                st.staged_mut().insert(key, value);
            }
        }
    }
    st.fully_materialized = true;
}

fn to_plain(value: &Value) -> Value {
    match value {
        Value::Dict(sub) => Value::Map(sub.plain_map().unwrap_or_default()),
        Value::Array(items) => Value::Array(items.iter().map(to_plain).collect()),
        other => other.clone(),
    }
}

/// Snapshot with every subdocument flattened to a detached map; the shape
/// conflict resolvers see.
pub(crate) fn plain_properties(container: &Container) -> Option<HashMap<String, Value>> {
    properties(container).map(|m| m.into_iter().map(|(k, v)| (k, to_plain(&v))).collect())
}

/// Build the tree the save serializer encodes: subdocuments flattened,
/// every blob installed into the store. Returns whether any blob was seen,
/// which drives the revision's attachments flag.
pub(crate) fn save_view(
    container: &Container,
    blobs: &BlobStore,
) -> DbResult<(HashMap<String, Value>, bool)> {
    let mut has_blobs = false;
    let props = properties(container).unwrap_or_default();
    let mut out = HashMap::new();
    for (key, value) in props {
        out.insert(key, save_value(value, blobs, &mut has_blobs)?);
    }
    Ok((out, has_blobs))
}

fn save_value(value: Value, blobs: &BlobStore, has_blobs: &mut bool) -> DbResult<Value> {
    match value {
        Value::Dict(sub) => {
            let (map, nested) = save_view(sub.state(), blobs)?;
            *has_blobs |= nested;
            Ok(Value::Map(map))
        }
        Value::Map(map) => {
            let mut out = HashMap::new();
            for (k, v) in map {
                out.insert(k, save_value(v, blobs, has_blobs)?);
            }
            Ok(Value::Map(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|v| save_value(v, blobs, has_blobs))
                .collect::<DbResult<_>>()?,
        )),
        Value::Blob(blob) => {
            blob.install(blobs)?;
            *has_blobs = true;
            Ok(Value::Blob(blob))
        }
        other => Ok(other),
    }
}

// ==================== Root rebinding ====================

/// Bind a new encoded root after a save or reload, rebasing the staged map
/// so subdocument and list identities survive: subdocuments re-root onto
/// the matching dict, lists rebind element-wise by index, scalars are
/// dropped so reads pull fresh values.
pub(crate) fn use_new_root(
    container: &Container,
    new_root: Option<DictRef>,
    store: Option<BlobStore>,
) {
    let mut to_invalidate: Vec<Subdocument> = Vec::new();
    let mut to_rebind: Vec<(Subdocument, Option<DictRef>)> = Vec::new();
    {
        let mut st = container.lock();
        st.root = new_root.clone();
        if store.is_some() {
            st.store = store.clone();
        }
        st.fully_materialized = false;

        let parent = Arc::downgrade(container);
        let effective_store = st.store.clone();
        let staged = st.staged.take();
        let mut staged_new = HashMap::new();
        for (key, value) in staged.unwrap_or_default() {
            match value {
                Value::Dict(sub) => match new_root.as_ref().and_then(|r| r.get(&key)) {
                    Some(Decoded::Dict(d)) if !is_blob_dict(&d) => {
                        to_rebind.push((sub.clone(), Some(d)));
                        staged_new.insert(key, Value::Dict(sub));
                    }
                    _ => to_invalidate.push(sub),
                },
                Value::Array(old_items) => match new_root.as_ref().and_then(|r| r.get(&key)) {
                    Some(Decoded::Array(a)) => {
                        let items = rebind_array(
                            &a,
                            old_items,
                            &parent,
                            &key,
                            &effective_store,
                            &mut to_rebind,
                            &mut to_invalidate,
                        );
                        staged_new.insert(key, Value::Array(items));
                    }
                    _ => {
                        let mut subs = Vec::new();
                        for item in &old_items {
                            collect_subdocs(item, &mut subs);
                        }
                        to_invalidate.extend(subs);
                    }
                },
                // Scalars are discarded so reads hit the new root.
                _ => {}
            }
        }
        st.staged = if staged_new.is_empty() {
            None
        } else {
            Some(staged_new)
        };
    }
    for sub in to_invalidate {
        invalidate(sub.state());
    }
    for (sub, dict) in to_rebind {
        use_new_root(sub.state(), dict, store.clone());
    }
}

fn rebind_array(
    new: &crate::encoding::ArrayRef,
    old_items: Vec<Value>,
    parent: &WeakContainer,
    key: &str,
    store: &Option<BlobStore>,
    to_rebind: &mut Vec<(Subdocument, Option<DictRef>)>,
    to_invalidate: &mut Vec<Subdocument>,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(new.len());
    for i in 0..new.len() {
        let elem = new.get(i);
        let old = old_items.get(i);
        match (elem, old) {
            (Some(Decoded::Dict(d)), Some(Value::Dict(sub))) if !is_blob_dict(&d) => {
                to_rebind.push((sub.clone(), Some(d)));
                out.push(Value::Dict(sub.clone()));
            }
            (Some(Decoded::Array(a)), Some(Value::Array(nested_old))) => {
                let nested = rebind_array(
                    &a,
                    nested_old.clone(),
                    parent,
                    key,
                    store,
                    to_rebind,
                    to_invalidate,
                );
                out.push(Value::Array(nested));
            }
            (Some(decoded), old) => {
                if let Some(old) = old {
                    collect_subdocs(old, to_invalidate);
                }
                out.push(mount_decoded(&decoded, parent, key, store));
            }
            (None, _) => out.push(Value::Null),
        }
    }
    // Extra trailing subdocuments in the old list are gone from the root.
    for leftover in old_items.iter().skip(new.len()) {
        collect_subdocs(leftover, to_invalidate);
    }
    out
}

/// Drop the whole overlay: staged values, change set, and any mounted
/// subdocument instances.
pub(crate) fn clear(container: &Container) {
    let children = {
        let mut st = container.lock();
        st.changed.clear();
        st.fully_materialized = false;
        let mut children = Vec::new();
        if let Some(staged) = st.staged.take() {
            for value in staged.values() {
                collect_subdocs(value, &mut children);
            }
        }
        children
    };
    for child in children {
        invalidate(child.state());
    }
}

/// Clear the changed-keys set here and in every mounted subdocument.
pub(crate) fn reset_changed(container: &Container) {
    let children = {
        let mut st = container.lock();
        st.changed.clear();
        let mut children = Vec::new();
        if let Some(staged) = &st.staged {
            for value in staged.values() {
                collect_subdocs(value, &mut children);
            }
        }
        children
    };
    for child in children {
        reset_changed(child.state());
    }
}

// ==================== Mutation events ====================

/// Mark the mutated key in every ancestor, walking up to the owning
/// document, then fire its mutation signal. Runs with no container lock
/// held, so listeners are free to read the tree.
pub(crate) fn dispatch_mutation(container: &Container) {
    let (mut link, mut owner) = {
        let st = container.lock();
        (st.parent.clone(), st.owner.clone())
    };
    while let Some(l) = link {
        match l.container.upgrade() {
            Some(parent) => {
                let mut pst = parent.lock();
                pst.changed.insert(l.key.clone());
                link = pst.parent.clone();
                owner = pst.owner.clone();
            }
            None => break,
        }
    }
    if let Some(doc) = owner.upgrade() {
        DocumentInner::note_mutated(&doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_and_changes() {
        let c = new_container();
        assert!(!has_changes(&c));

        set(&c, "name", Value::from("Scott")).unwrap();
        assert_eq!(get(&c, "name"), Value::from("Scott"));
        assert!(has_changes(&c));
        assert!(contains(&c, "name"));
        assert!(!contains(&c, "missing"));
        assert_eq!(get(&c, "missing"), Value::Null);
    }

    #[test]
    fn test_set_equal_value_is_noop() {
        let c = new_container();
        set(&c, "n", Value::Int(7)).unwrap();
        reset_changed(&c);

        set(&c, "n", Value::Int(7)).unwrap();
        assert!(!has_changes(&c));
        set(&c, "gone", Value::Null).unwrap();
        assert!(!has_changes(&c), "removing an absent key stays a no-op");
    }

    #[test]
    fn test_map_becomes_subdocument_and_identity_holds() {
        let c = new_container();
        let mut address = HashMap::new();
        address.insert("city".to_string(), Value::from("sf"));
        set(&c, "address", Value::Map(address)).unwrap();

        let first = get(&c, "address").as_dict().expect("should be a subdocument");
        let second = get(&c, "address").as_dict().unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(first.get_string("city").as_deref(), Some("sf"));
    }

    #[test]
    fn test_overwriting_subdocument_invalidates_it() {
        let c = new_container();
        let mut m = HashMap::new();
        m.insert("x".to_string(), Value::Int(1));
        set(&c, "sub", Value::Map(m)).unwrap();

        let sub = get(&c, "sub").as_dict().unwrap();
        set(&c, "sub", Value::from("scalar now")).unwrap();

        assert!(sub.document().is_none());
        assert!(sub.properties().is_none(), "invalidated subdocument is empty");
        assert!(!sub.exists());
    }

    #[test]
    fn test_revert_discards_staged_values() {
        let c = new_container();
        set(&c, "a", Value::Int(1)).unwrap();
        set(&c, "b", Value::from("x")).unwrap();
        revert(&c);

        assert!(!has_changes(&c));
        assert_eq!(get(&c, "a"), Value::Null);
        assert_eq!(get(&c, "b"), Value::Null);
    }

    #[test]
    fn test_replace_properties_stages_removals() {
        let c = new_container();
        set(&c, "keep", Value::Int(1)).unwrap();
        set(&c, "drop", Value::Int(2)).unwrap();

        let mut new_map = HashMap::new();
        new_map.insert("keep".to_string(), Value::Int(1));
        replace_properties(&c, Some(new_map), true).unwrap();

        assert_eq!(get(&c, "keep"), Value::Int(1));
        assert_eq!(get(&c, "drop"), Value::Null);
        let props = properties(&c).unwrap();
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        assert!(validate(&Value::Double(f64::NAN)).is_err());
        assert!(validate(&Value::Float(f32::INFINITY)).is_err());
        assert!(validate(&Value::Array(vec![Value::Double(f64::NAN)])).is_err());
        assert!(validate(&Value::Double(1.5)).is_ok());
    }

    #[test]
    fn test_reused_subdocument_copies_contents() {
        let a = new_container();
        let mut m = HashMap::new();
        m.insert("v".to_string(), Value::Int(1));
        set(&a, "sub", Value::Map(m)).unwrap();
        let sub = get(&a, "sub").as_dict().unwrap();

        // Assigning an already-owned subdocument elsewhere copies it.
        let b = new_container();
        set(&b, "other", Value::Dict(sub.clone())).unwrap();
        let copy = get(&b, "other").as_dict().unwrap();
        assert!(!copy.same_instance(&sub));
        assert_eq!(copy.get_i64("v"), 1);

        // The original stays mounted where it was.
        assert!(get(&a, "sub").as_dict().unwrap().same_instance(&sub));
    }
}
