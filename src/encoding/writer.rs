use std::collections::HashMap;

use super::shared_keys::SharedKeys;
use super::{
    TAG_ARRAY, TAG_DICT, TAG_DOUBLE, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_NULL, TAG_STRING, TAG_TRUE,
};
use crate::error::{DbError, DbResult};
use crate::value::{format_date, Value};

/// Serialize a property map into an encoded body.
///
/// Layout: values are appended depth-first (children before the container
/// that references them), containers hold absolute offsets, and the final
/// four bytes are the offset of the root dictionary. Dict keys are interned
/// through `keys`; null entries are dropped, which is how key removal is
/// persisted. Encoding is deterministic (entries sorted by key id) so the
/// revision digest is a pure function of the content.
///
/// The map must be a save view: subdocuments already flattened to maps and
/// blobs already installed. Dates become RFC-3339 strings, blobs their
/// metadata dicts.
pub fn encode_body(map: &HashMap<String, Value>, keys: &mut SharedKeys) -> DbResult<Vec<u8>> {
    let mut enc = Encoder { buf: Vec::new() };
    let root = enc.write_dict(map, keys)?;
    enc.buf.extend_from_slice(&root.to_le_bytes());
    Ok(enc.buf)
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn write_value(&mut self, value: &Value, keys: &mut SharedKeys) -> DbResult<u32> {
        let offset = self.buf.len() as u32;
        match value {
            Value::Null => self.buf.push(TAG_NULL),
            Value::Bool(false) => self.buf.push(TAG_FALSE),
            Value::Bool(true) => self.buf.push(TAG_TRUE),
            Value::Int(i) => {
                self.buf.push(TAG_INT);
                self.buf.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                self.buf.push(TAG_FLOAT);
                self.buf.extend_from_slice(&f.to_le_bytes());
            }
            Value::Double(d) => {
                self.buf.push(TAG_DOUBLE);
                self.buf.extend_from_slice(&d.to_le_bytes());
            }
            Value::String(s) => return self.write_string(s),
            Value::Date(d) => return self.write_string(&format_date(d)),
            Value::Blob(b) => {
                let meta = b.metadata_values()?;
                return self.write_dict(&meta, keys);
            }
            Value::Array(items) => {
                let offsets: Vec<u32> = items
                    .iter()
                    .map(|item| self.write_value(item, keys))
                    .collect::<DbResult<_>>()?;
                let offset = self.buf.len() as u32;
                self.buf.push(TAG_ARRAY);
                self.buf.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
                for o in offsets {
                    self.buf.extend_from_slice(&o.to_le_bytes());
                }
                return Ok(offset);
            }
            Value::Map(m) => return self.write_dict(m, keys),
            Value::Dict(_) => {
                return Err(DbError::InvalidState(
                    "subdocument reached the body encoder unflattened".to_string(),
                ))
            }
        }
        Ok(offset)
    }

    fn write_string(&mut self, s: &str) -> DbResult<u32> {
        let offset = self.buf.len() as u32;
        self.buf.push(TAG_STRING);
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        Ok(offset)
    }

    fn write_dict(&mut self, map: &HashMap<String, Value>, keys: &mut SharedKeys) -> DbResult<u32> {
        let mut names: Vec<&String> = map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k)
            .collect();
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let value_offset = self.write_value(&map[name], keys)?;
            entries.push((keys.encode(name), value_offset));
        }
        entries.sort_by_key(|(id, _)| *id);

        let offset = self.buf.len() as u32;
        self.buf.push(TAG_DICT);
        self.buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (key_id, value_offset) in entries {
            self.buf.extend_from_slice(&key_id.to_le_bytes());
            self.buf.extend_from_slice(&value_offset.to_le_bytes());
        }
        Ok(offset)
    }
}
