use std::collections::HashMap;

/// Per-database string-interning table for dictionary keys.
///
/// Keys are assigned dense integer ids in first-seen order and are never
/// removed, so handing the table out by shared reference to decoders is
/// safe: an id, once issued, stays valid for the lifetime of the database.
#[derive(Debug, Default)]
pub struct SharedKeys {
    by_id: Vec<String>,
    by_key: HashMap<String, u32>,
    persisted: u32,
}

impl SharedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.by_id.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Intern `key`, returning its id. Existing keys keep their id.
    pub fn encode(&mut self, key: &str) -> u32 {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let id = self.by_id.len() as u32;
        self.by_id.push(key.to_string());
        self.by_key.insert(key.to_string(), id);
        id
    }

    /// Resolve an id back to its key string.
    pub fn decode(&self, id: u32) -> Option<&str> {
        self.by_id.get(id as usize).map(String::as_str)
    }

    /// Look up the id of a key without interning it.
    pub fn lookup(&self, key: &str) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    /// Re-install a key loaded from storage. Ids must arrive in order; gaps
    /// mean the persisted table is corrupt and the entry is ignored.
    pub fn load_known(&mut self, id: u32, key: String) {
        if id as usize != self.by_id.len() {
            tracing::warn!("shared key id {} out of order, ignoring '{}'", id, key);
            return;
        }
        self.by_key.insert(key.clone(), id);
        self.by_id.push(key);
        self.persisted = self.by_id.len() as u32;
    }

    /// Keys interned since the last `mark_persisted`, with their ids.
    pub fn unpersisted(&self) -> impl Iterator<Item = (u32, &str)> {
        let start = self.persisted as usize;
        self.by_id[start..]
            .iter()
            .enumerate()
            .map(move |(i, k)| ((start + i) as u32, k.as_str()))
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = self.by_id.len() as u32;
    }
}
