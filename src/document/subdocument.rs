use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;

use crate::encoding::DictRef;
use crate::error::DbResult;
use crate::storage::BlobStore;
use crate::value::Value;

use super::blob::Blob;
use super::properties::{self, Container, ParentLink};
use super::Document;

/// A nested property container whose lifecycle is tied to a key inside a
/// parent container. Cloning the handle clones the identity, not the data:
/// two clones are the same subdocument. Mutations bubble up the parent
/// chain to the owning document.
///
/// When its key is overwritten with something else, or its parent is
/// replaced, the instance is invalidated and becomes a detached empty
/// container.
#[derive(Clone)]
pub struct Subdocument {
    state: Container,
}

impl Default for Subdocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Subdocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subdocument")
            .field("exists", &self.exists())
            .field("has_changes", &self.has_changes())
            .finish()
    }
}

impl Subdocument {
    /// A fresh detached subdocument; assign it to a key to mount it.
    pub fn new() -> Self {
        Self {
            state: properties::new_container(),
        }
    }

    pub(crate) fn from_root(root: DictRef, parent: ParentLink, store: Option<BlobStore>) -> Self {
        let sub = Self::new();
        {
            let mut st = sub.state.lock();
            st.root = Some(root);
            st.parent = Some(parent);
            st.store = store;
        }
        sub
    }

    pub(crate) fn state(&self) -> &Container {
        &self.state
    }

    /// Identity test: clones of one subdocument share their state.
    pub fn same_instance(&self, other: &Subdocument) -> bool {
        std::sync::Arc::ptr_eq(&self.state, &other.state)
    }

    /// Whether this subdocument has been saved at least once as part of
    /// its parent (it has an encoded root).
    pub fn exists(&self) -> bool {
        self.state.lock().root.is_some()
    }

    pub fn has_changes(&self) -> bool {
        properties::has_changes(&self.state)
    }

    /// The document this subdocument transitively belongs to, if mounted.
    pub fn document(&self) -> Option<Document> {
        let mut current = self.state.clone();
        loop {
            let (parent, owner) = {
                let st = current.lock();
                (st.parent.clone(), st.owner.clone())
            };
            if let Some(inner) = owner.upgrade() {
                return Some(Document::from_inner(inner));
            }
            match parent.and_then(|link| link.container.upgrade()) {
                Some(next) => current = next,
                None => return None,
            }
        }
    }

    // ==================== Property access ====================

    pub fn get(&self, key: &str) -> Value {
        properties::get(&self.state, key)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> DbResult<()> {
        properties::set(&self.state, key, value.into())
    }

    pub fn remove(&self, key: &str) -> DbResult<()> {
        properties::remove(&self.state, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        properties::contains(&self.state, key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        properties::get_bool(&self.state, key)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        properties::get_i64(&self.state, key)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        properties::get_f64(&self.state, key)
    }

    pub fn get_f32(&self, key: &str) -> f32 {
        properties::get_f32(&self.state, key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        properties::get_string(&self.state, key)
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        properties::get_date(&self.state, key)
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
        properties::properties(&self.state)
    }

    pub fn replace_properties(&self, props: Option<HashMap<String, Value>>) -> DbResult<()> {
        properties::replace_properties(&self.state, props, true)
    }

    /// Effective view as a map; empty when there is nothing visible.
    pub(crate) fn snapshot(&self) -> HashMap<String, Value> {
        self.properties().unwrap_or_default()
    }

    /// Deep detached copy of the effective view, subdocuments flattened.
    pub(crate) fn plain_map(&self) -> Option<HashMap<String, Value>> {
        properties::plain_properties(&self.state)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self.plain_map() {
            Some(map) => Value::Map(map).to_json(),
            None => serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl PartialEq for Subdocument {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other) || self.snapshot() == other.snapshot()
    }
}
