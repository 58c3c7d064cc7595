use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use super::store::Store;
use crate::error::{DbError, DbResult};

const CHUNK_SIZE: usize = 64 * 1024;
const DIGEST_PREFIX: &str = "sha256-";

/// Content-addressed key of an installed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobKey(String);

impl BlobKey {
    /// Parse the stringified form (`sha256-<base64>`).
    pub fn from_string(s: &str) -> DbResult<BlobKey> {
        let digest = s
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| DbError::InvalidValue(format!("not a blob digest: '{}'", s)))?;
        STANDARD_NO_PAD
            .decode(digest)
            .map_err(|_| DbError::InvalidValue(format!("not a blob digest: '{}'", s)))?;
        Ok(BlobKey(s.to_string()))
    }

    fn from_hash(hash: &[u8]) -> BlobKey {
        BlobKey(format!("{}{}", DIGEST_PREFIX, STANDARD_NO_PAD.encode(hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct BlobMeta {
    length: u64,
    chunk_count: u32,
}

/// Content-addressed blob storage in the blobs column family: one meta row
/// and fixed-size chunk rows per digest. Writes are idempotent; a blob that
/// already exists is not rewritten.
#[derive(Clone, Debug)]
pub struct BlobStore {
    store: Store,
}

impl BlobStore {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn same_store(&self, other: &BlobStore) -> bool {
        self.store.same_store(&other.store)
    }

    /// Store a complete byte buffer and return its key.
    pub fn create(&self, bytes: &[u8]) -> DbResult<BlobKey> {
        let mut sink = self.write_sink();
        sink.write_all(bytes)?;
        sink.finish()
    }

    /// Streaming write sink; the key is known once `finish` is called.
    pub fn write_sink(&self) -> BlobWriteSink {
        BlobWriteSink {
            store: self.clone(),
            hasher: Sha256::new(),
            chunks: Vec::new(),
            current: Vec::new(),
            length: 0,
        }
    }

    fn meta(&self, key: &BlobKey) -> DbResult<BlobMeta> {
        let db = &self.store.shared.db;
        let bytes = db
            .get_cf(self.store.blobs_cf(), meta_row(key))?
            .ok_or_else(|| DbError::NotFound(format!("no blob {}", key)))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn exists(&self, key: &BlobKey) -> bool {
        self.meta(key).is_ok()
    }

    pub fn length(&self, key: &BlobKey) -> DbResult<u64> {
        Ok(self.meta(key)?.length)
    }

    fn chunk(&self, key: &BlobKey, index: u32) -> DbResult<Vec<u8>> {
        let db = &self.store.shared.db;
        db.get_cf(self.store.blobs_cf(), chunk_row(key, index))?
            .ok_or_else(|| DbError::CorruptData(format!("blob {} missing chunk {}", key, index)))
    }

    /// Read the full byte range of a blob.
    pub fn contents(&self, key: &BlobKey) -> DbResult<Vec<u8>> {
        let meta = self.meta(key)?;
        let mut out = Vec::with_capacity(meta.length as usize);
        for i in 0..meta.chunk_count {
            out.extend_from_slice(&self.chunk(key, i)?);
        }
        Ok(out)
    }

    /// A fresh chunked reader over the stored blob.
    pub fn read_stream(&self, key: &BlobKey) -> DbResult<BlobReadStream> {
        let meta = self.meta(key)?;
        Ok(BlobReadStream {
            store: self.clone(),
            key: key.clone(),
            chunk_count: meta.chunk_count,
            next_chunk: 0,
            buffer: Vec::new(),
            pos: 0,
        })
    }
}

/// Accumulates streamed content, hashing as it goes; `finish` installs the
/// chunks under the content-addressed key.
pub struct BlobWriteSink {
    store: BlobStore,
    hasher: Sha256,
    chunks: Vec<Vec<u8>>,
    current: Vec<u8>,
    length: u64,
}

impl BlobWriteSink {
    pub fn finish(mut self) -> DbResult<BlobKey> {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
        let key = BlobKey::from_hash(&self.hasher.finalize());

        if self.store.exists(&key) {
            return Ok(key);
        }

        let meta = BlobMeta {
            length: self.length,
            chunk_count: self.chunks.len() as u32,
        };
        let mut batch = rocksdb::WriteBatch::default();
        let cf = self.store.store.blobs_cf();
        for (i, chunk) in self.chunks.iter().enumerate() {
            batch.put_cf(cf, chunk_row(&key, i as u32), chunk);
        }
        batch.put_cf(cf, meta_row(&key), bincode::serialize(&meta)?);
        self.store.store.shared.db.write(batch)?;
        tracing::debug!("installed blob {} ({} bytes)", key, self.length);
        Ok(key)
    }
}

impl Write for BlobWriteSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.length += buf.len() as u64;
        let mut rest = buf;
        while !rest.is_empty() {
            let room = CHUNK_SIZE - self.current.len();
            let take = room.min(rest.len());
            self.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.current.len() == CHUNK_SIZE {
                self.chunks.push(std::mem::take(&mut self.current));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Chunk-at-a-time reader over an installed blob. Holds a store handle for
/// its lifetime; drop it to release the reference.
pub struct BlobReadStream {
    store: BlobStore,
    key: BlobKey,
    chunk_count: u32,
    next_chunk: u32,
    buffer: Vec<u8>,
    pos: usize,
}

impl Read for BlobReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buffer.len() {
            if self.next_chunk >= self.chunk_count {
                return Ok(0);
            }
            self.buffer = self
                .store
                .chunk(&self.key, self.next_chunk)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.next_chunk += 1;
            self.pos = 0;
        }
        let n = buf.len().min(self.buffer.len() - self.pos);
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn meta_row(key: &BlobKey) -> Vec<u8> {
    format!("m:{}", key.as_str()).into_bytes()
}

fn chunk_row(key: &BlobKey, index: u32) -> Vec<u8> {
    format!("c:{}:{:06}", key.as_str(), index).into_bytes()
}
