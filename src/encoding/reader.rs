use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::shared_keys::SharedKeys;
use super::{
    TAG_ARRAY, TAG_DICT, TAG_DOUBLE, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_NULL, TAG_STRING, TAG_TRUE,
};
use crate::error::{DbError, DbResult};
use crate::value::Value;

/// An immutable, reference-counted revision body.
///
/// Containers borrow `DictRef`/`ArrayRef` views that keep the body alive,
/// so rebinding a document to a new revision drops the old body (and every
/// decoded view into it) as soon as the last reference goes away.
#[derive(Clone)]
pub struct Body(Arc<BodyInner>);

struct BodyInner {
    data: Vec<u8>,
    keys: Arc<RwLock<SharedKeys>>,
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body").field("len", &self.0.data.len()).finish()
    }
}

impl Body {
    /// Validate the framing of an encoded body and wrap it for reading.
    /// The bytes are trusted (they come from our own storage), but the
    /// trailer and root tag are still checked so a torn write surfaces as
    /// an error instead of garbage reads.
    pub fn parse(data: Vec<u8>, keys: Arc<RwLock<SharedKeys>>) -> DbResult<Body> {
        if data.len() < 9 {
            return Err(DbError::CorruptData(format!(
                "encoded body too short ({} bytes)",
                data.len()
            )));
        }
        let trailer = data.len() - 4;
        let root = u32::from_le_bytes(data[trailer..].try_into().unwrap()) as usize;
        if root >= trailer || data[root] != TAG_DICT {
            return Err(DbError::CorruptData("encoded body has no root dict".to_string()));
        }
        Ok(Body(Arc::new(BodyInner { data, keys })))
    }

    pub fn root(&self) -> DictRef {
        let trailer = self.0.data.len() - 4;
        let root = u32::from_le_bytes(self.0.data[trailer..].try_into().unwrap());
        DictRef {
            body: self.clone(),
            offset: root,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.0.data
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        self.bytes()
            .get(offset..end)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn value_at(&self, offset: u32) -> Option<Decoded> {
        let offset = offset as usize;
        let tag = *self.bytes().get(offset)?;
        Some(match tag {
            TAG_NULL => Decoded::Null,
            TAG_FALSE => Decoded::Bool(false),
            TAG_TRUE => Decoded::Bool(true),
            TAG_INT => {
                let b = self.bytes().get(offset + 1..offset + 9)?;
                Decoded::Int(i64::from_le_bytes(b.try_into().unwrap()))
            }
            TAG_FLOAT => {
                let b = self.bytes().get(offset + 1..offset + 5)?;
                Decoded::Float(f32::from_le_bytes(b.try_into().unwrap()))
            }
            TAG_DOUBLE => {
                let b = self.bytes().get(offset + 1..offset + 9)?;
                Decoded::Double(f64::from_le_bytes(b.try_into().unwrap()))
            }
            TAG_STRING => {
                let len = self.u32_at(offset + 1)? as usize;
                let b = self.bytes().get(offset + 5..offset + 5 + len)?;
                Decoded::String(String::from_utf8_lossy(b).into_owned())
            }
            TAG_DICT => Decoded::Dict(DictRef {
                body: self.clone(),
                offset: offset as u32,
            }),
            TAG_ARRAY => Decoded::Array(ArrayRef {
                body: self.clone(),
                offset: offset as u32,
            }),
            _ => return None,
        })
    }
}

/// A decoded leaf or a lazy view into a nested container.
#[derive(Clone, Debug)]
pub enum Decoded {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Dict(DictRef),
    Array(ArrayRef),
}

impl Decoded {
    pub fn as_bool(&self) -> bool {
        match self {
            Decoded::Bool(b) => *b,
            Decoded::Int(i) => *i != 0,
            Decoded::Float(f) => *f != 0.0,
            Decoded::Double(d) => *d != 0.0,
            _ => false,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Decoded::Bool(b) => *b as i64,
            Decoded::Int(i) => *i,
            Decoded::Float(f) => *f as i64,
            Decoded::Double(d) => *d as i64,
            _ => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Decoded::Bool(b) => *b as i64 as f64,
            Decoded::Int(i) => *i as f64,
            Decoded::Float(f) => *f as f64,
            Decoded::Double(d) => *d,
            _ => 0.0,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match self {
            Decoded::Bool(b) => *b as i64 as f32,
            Decoded::Int(i) => *i as f32,
            Decoded::Float(f) => *f,
            Decoded::Double(d) => *d as f32,
            _ => 0.0,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Decoded::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Generic conversion: nested dicts become detached maps, arrays become
    /// vectors. Blob metadata dicts come back as plain maps; rehydrating
    /// them into `Blob` values is the document layer's job.
    pub fn to_plain(&self) -> Value {
        match self {
            Decoded::Null => Value::Null,
            Decoded::Bool(b) => Value::Bool(*b),
            Decoded::Int(i) => Value::Int(*i),
            Decoded::Float(f) => Value::Float(*f),
            Decoded::Double(d) => Value::Double(*d),
            Decoded::String(s) => Value::String(s.clone()),
            Decoded::Dict(d) => Value::Map(d.to_plain()),
            Decoded::Array(a) => Value::Array(a.to_plain()),
        }
    }
}

/// Lazy random-access view of an encoded dictionary.
#[derive(Clone)]
pub struct DictRef {
    body: Body,
    offset: u32,
}

impl std::fmt::Debug for DictRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictRef")
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}

impl DictRef {
    pub fn len(&self) -> usize {
        self.body.u32_at(self.offset as usize + 1).unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, index: usize) -> Option<(u32, u32)> {
        let base = self.offset as usize + 5 + index * 8;
        Some((self.body.u32_at(base)?, self.body.u32_at(base + 4)?))
    }

    pub fn get(&self, key: &str) -> Option<Decoded> {
        let key_id = self.body.0.keys.read().lookup(key)?;
        for i in 0..self.len() {
            let (id, value_offset) = self.entry(i)?;
            if id == key_id {
                return self.body.value_at(value_offset);
            }
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        !matches!(self.get(key), None | Some(Decoded::Null))
    }

    pub fn keys(&self) -> Vec<String> {
        let shared = self.body.0.keys.read();
        (0..self.len())
            .filter_map(|i| self.entry(i))
            .filter_map(|(id, _)| shared.decode(id).map(str::to_string))
            .collect()
    }

    // Typed fast paths: decode a single leaf without materializing anything.

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.get(key).map(|v| v.as_i64()).unwrap_or(0)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.get(key).map(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn get_f32(&self, key: &str) -> f32 {
        self.get(key).map(|v| v.as_f32()).unwrap_or(0.0)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_string())
    }

    /// Convert the whole dictionary into a detached property map.
    pub fn to_plain(&self) -> HashMap<String, Value> {
        let names = self.keys();
        names
            .into_iter()
            .filter_map(|name| {
                let v = self.get(&name)?;
                Some((name, v.to_plain()))
            })
            .filter(|(_, v)| !v.is_null())
            .collect()
    }
}

/// Lazy random-access view of an encoded array.
#[derive(Clone)]
pub struct ArrayRef {
    body: Body,
    offset: u32,
}

impl std::fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayRef").field("len", &self.len()).finish()
    }
}

impl ArrayRef {
    pub fn len(&self) -> usize {
        self.body.u32_at(self.offset as usize + 1).unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Decoded> {
        if index >= self.len() {
            return None;
        }
        let slot = self.offset as usize + 5 + index * 4;
        let value_offset = self.body.u32_at(slot)?;
        self.body.value_at(value_offset)
    }

    pub fn to_plain(&self) -> Vec<Value> {
        (0..self.len())
            .map(|i| self.get(i).map(|v| v.to_plain()).unwrap_or(Value::Null))
            .collect()
    }
}
