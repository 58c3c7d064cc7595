use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::encoding::DictRef;
use crate::error::{DbError, DbResult};
use crate::storage::{BlobKey, BlobStore};
use crate::value::Value;

/// Metadata dicts carrying this marker are blob references, not ordinary
/// nested dictionaries.
pub(crate) const BLOB_TYPE_KEY: &str = "_cbltype";
pub(crate) const BLOB_TYPE: &str = "blob";

const INLINE_CACHE_LIMIT: usize = 8 * 1024;

/// A binary attachment value.
///
/// A blob starts out *pending* (it carries bytes, a one-shot stream, or a
/// file path) and becomes *installed* when its enclosing document is saved:
/// the content moves into the database's blob store under a
/// content-addressed digest. Once installed it is pinned to that database.
#[derive(Clone)]
pub struct Blob {
    inner: Arc<Mutex<BlobInner>>,
}

struct BlobInner {
    content_type: Option<String>,
    length: Option<u64>,
    digest: Option<String>,
    source: BlobSource,
    store: Option<BlobStore>,
    cached: Option<Vec<u8>>,
}

enum BlobSource {
    Bytes(Vec<u8>),
    Stream(Option<Box<dyn Read + Send>>),
    File(PathBuf),
    Installed,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Blob")
            .field("content_type", &inner.content_type)
            .field("length", &inner.length)
            .field("digest", &inner.digest)
            .finish()
    }
}

impl Blob {
    pub fn from_bytes(content_type: impl Into<String>, bytes: Vec<u8>) -> Blob {
        Blob {
            inner: Arc::new(Mutex::new(BlobInner {
                content_type: Some(content_type.into()),
                length: Some(bytes.len() as u64),
                digest: None,
                source: BlobSource::Bytes(bytes),
                store: None,
                cached: None,
            })),
        }
    }

    /// A blob fed by a one-shot stream; the length is known once the
    /// stream has been drained (at first read or at install).
    pub fn from_stream(content_type: impl Into<String>, stream: Box<dyn Read + Send>) -> Blob {
        Blob {
            inner: Arc::new(Mutex::new(BlobInner {
                content_type: Some(content_type.into()),
                length: None,
                digest: None,
                source: BlobSource::Stream(Some(stream)),
                store: None,
                cached: None,
            })),
        }
    }

    pub fn from_file(content_type: impl Into<String>, path: impl Into<PathBuf>) -> Blob {
        Blob {
            inner: Arc::new(Mutex::new(BlobInner {
                content_type: Some(content_type.into()),
                length: None,
                digest: None,
                source: BlobSource::File(path.into()),
                store: None,
                cached: None,
            })),
        }
    }

    fn installed(
        digest: Option<String>,
        length: Option<u64>,
        content_type: Option<String>,
        store: Option<BlobStore>,
    ) -> Blob {
        Blob {
            inner: Arc::new(Mutex::new(BlobInner {
                content_type,
                length,
                digest,
                source: BlobSource::Installed,
                store,
                cached: None,
            })),
        }
    }

    /// Rehydrate from an encoded metadata dict in a revision body.
    pub(crate) fn from_dict(dict: &DictRef, store: Option<BlobStore>) -> Blob {
        Blob::installed(
            dict.get_string("digest"),
            Some(dict.get_i64("length") as u64),
            dict.get_string("content-type"),
            store,
        )
    }

    /// Construct from a metadata map assigned as a property value.
    pub(crate) fn from_map(map: &HashMap<String, Value>, store: Option<BlobStore>) -> DbResult<Blob> {
        let digest = match map.get("digest") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(DbError::InvalidValue(
                    "blob metadata is missing its digest".to_string(),
                ))
            }
        };
        let length = map.get("length").map(|v| v.as_i64() as u64);
        let content_type = map.get("content-type").and_then(|v| v.as_string());
        Ok(Blob::installed(Some(digest), length, content_type, store))
    }

    pub fn content_type(&self) -> Option<String> {
        self.inner.lock().content_type.clone()
    }

    pub fn length(&self) -> u64 {
        self.inner.lock().length.unwrap_or(0)
    }

    pub fn digest(&self) -> Option<String> {
        self.inner.lock().digest.clone()
    }

    pub fn is_installed(&self) -> bool {
        matches!(self.inner.lock().source, BlobSource::Installed)
    }

    /// The full content bytes. A pending stream is drained (and the blob
    /// transitions to pending-bytes); installed content is read from the
    /// blob store, with small payloads cached inline.
    pub fn content(&self) -> DbResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        if let Some(cached) = &inner.cached {
            return Ok(cached.clone());
        }

        if matches!(inner.source, BlobSource::Stream(_)) {
            let stream = match &mut inner.source {
                BlobSource::Stream(slot) => slot.take(),
                _ => unreachable!(),
            };
            let mut stream = stream.ok_or_else(|| {
                DbError::InvalidState("blob stream has already been consumed".to_string())
            })?;
            let mut data = Vec::new();
            stream.read_to_end(&mut data)?;
            inner.length = Some(data.len() as u64);
            inner.source = BlobSource::Bytes(data);
        }

        if let BlobSource::Bytes(bytes) = &inner.source {
            return Ok(bytes.clone());
        }
        if let BlobSource::File(path) = &inner.source {
            let path = path.clone();
            let data = std::fs::read(path)?;
            inner.length = Some(data.len() as u64);
            return Ok(data);
        }

        // Installed: read the full byte range out of the blob store.
        let store = inner.store.clone().ok_or_else(|| {
            DbError::InvalidState("blob is not attached to a database".to_string())
        })?;
        let digest = inner
            .digest
            .clone()
            .ok_or_else(|| DbError::InvalidState("installed blob has no digest".to_string()))?;
        let data = store.contents(&BlobKey::from_string(&digest)?)?;
        if data.len() <= INLINE_CACHE_LIMIT {
            inner.cached = Some(data.clone());
        }
        Ok(data)
    }

    /// A fresh reader over the content: chunked out of the blob store when
    /// installed, a cursor over pending bytes otherwise.
    pub fn content_stream(&self) -> DbResult<Box<dyn Read + Send>> {
        let inner = self.inner.lock();
        match &inner.source {
            BlobSource::Installed => {
                let store = inner.store.as_ref().ok_or_else(|| {
                    DbError::InvalidState("blob is not attached to a database".to_string())
                })?;
                let digest = inner.digest.as_ref().ok_or_else(|| {
                    DbError::InvalidState("installed blob has no digest".to_string())
                })?;
                let stream = store.read_stream(&BlobKey::from_string(digest)?)?;
                Ok(Box::new(stream))
            }
            BlobSource::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            _ => Err(DbError::InvalidState(
                "blob content is not re-readable before install".to_string(),
            )),
        }
    }

    /// Move pending content into the blob store. Idempotent for the store
    /// it is already installed in; installing into a different database is
    /// an error.
    pub(crate) fn install(&self, store: &BlobStore) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.source, BlobSource::Installed) {
            return match &inner.store {
                Some(current) if current.same_store(store) => Ok(()),
                Some(_) => Err(DbError::InvalidState(
                    "blob is already installed in a different database".to_string(),
                )),
                None => {
                    inner.store = Some(store.clone());
                    Ok(())
                }
            };
        }

        let key = match &mut inner.source {
            BlobSource::Bytes(bytes) => store.create(bytes)?,
            BlobSource::Stream(slot) => {
                let mut stream = slot.take().ok_or_else(|| {
                    DbError::InvalidState("blob stream has already been consumed".to_string())
                })?;
                let mut sink = store.write_sink();
                std::io::copy(&mut stream, &mut sink)?;
                sink.finish()?
            }
            BlobSource::File(path) => {
                let mut file = std::fs::File::open(&*path)?;
                let mut sink = store.write_sink();
                std::io::copy(&mut file, &mut sink)?;
                sink.finish()?
            }
            BlobSource::Installed => unreachable!(),
        };

        inner.length = Some(store.length(&key)?);
        inner.digest = Some(key.to_string());
        inner.source = BlobSource::Installed;
        inner.store = Some(store.clone());
        Ok(())
    }

    /// The metadata map persisted in place of the content. Only valid once
    /// installed (the digest is the reference).
    pub(crate) fn metadata_values(&self) -> DbResult<HashMap<String, Value>> {
        let inner = self.inner.lock();
        let digest = inner.digest.clone().ok_or_else(|| {
            DbError::InvalidState("blob must be installed before it is serialized".to_string())
        })?;
        let mut map = HashMap::new();
        map.insert(BLOB_TYPE_KEY.to_string(), Value::String(BLOB_TYPE.to_string()));
        map.insert("digest".to_string(), Value::String(digest));
        map.insert(
            "length".to_string(),
            Value::Int(inner.length.unwrap_or(0) as i64),
        );
        if let Some(ct) = &inner.content_type {
            map.insert("content-type".to_string(), Value::String(ct.clone()));
        }
        Ok(map)
    }

    /// JSON representation: the metadata dict, never the content.
    pub fn json_properties(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let mut map = serde_json::Map::new();
        map.insert(
            BLOB_TYPE_KEY.to_string(),
            serde_json::Value::String(BLOB_TYPE.to_string()),
        );
        if let Some(digest) = &inner.digest {
            map.insert("digest".to_string(), serde_json::Value::String(digest.clone()));
        }
        if let Some(length) = inner.length {
            map.insert("length".to_string(), serde_json::Value::Number(length.into()));
        }
        if let Some(ct) = &inner.content_type {
            map.insert(
                "content-type".to_string(),
                serde_json::Value::String(ct.clone()),
            );
        }
        serde_json::Value::Object(map)
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        // Lock in address order so two concurrent comparisons cannot
        // deadlock each other.
        let (first, second) = if Arc::as_ptr(&self.inner) < Arc::as_ptr(&other.inner) {
            (&self.inner, &other.inner)
        } else {
            (&other.inner, &self.inner)
        };
        let a = first.lock();
        let b = second.lock();
        match (&a.digest, &b.digest) {
            (Some(da), Some(db)) => da == db,
            _ => match (&a.source, &b.source) {
                (BlobSource::Bytes(ba), BlobSource::Bytes(bb)) => ba == bb,
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_bytes_blob() {
        let blob = Blob::from_bytes("text/plain", b"12345".to_vec());
        assert_eq!(blob.length(), 5);
        assert_eq!(blob.content_type().as_deref(), Some("text/plain"));
        assert!(blob.digest().is_none());
        assert!(!blob.is_installed());
        assert_eq!(blob.content().unwrap(), b"12345");

        let mut stream = blob.content_stream().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"12345");
    }

    #[test]
    fn test_stream_blob_drains_once() {
        let blob = Blob::from_stream(
            "application/octet-stream",
            Box::new(std::io::Cursor::new(b"streamed".to_vec())),
        );
        assert_eq!(blob.length(), 0, "length unknown before the stream drains");
        assert!(blob.content_stream().is_err(), "pending stream is one-shot");

        assert_eq!(blob.content().unwrap(), b"streamed");
        assert_eq!(blob.length(), 8);
        // Drained into pending bytes; further reads keep working.
        assert_eq!(blob.content().unwrap(), b"streamed");
    }

    #[test]
    fn test_blob_equality_by_content() {
        let a = Blob::from_bytes("text/plain", b"same".to_vec());
        let b = Blob::from_bytes("text/plain", b"same".to_vec());
        let c = Blob::from_bytes("text/plain", b"other".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_metadata_requires_install() {
        let blob = Blob::from_bytes("text/plain", b"x".to_vec());
        assert!(blob.metadata_values().is_err());
    }
}
