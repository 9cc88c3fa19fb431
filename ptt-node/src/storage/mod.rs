//! Key-value storage.
//!
//! Every entity reads and writes through [`KvStore`] under its own prefix
//! (see [`keys`]). There are no cross-entity transactions; a
//! [`WriteBatch`] is atomic within one store. Values are bincode, except the
//! raft records under `me/raft/`, which are JSON.
//!
//! Two backends:
//! - [`RedbStore`]: a single redb table of `&[u8] -> &[u8]` under the data dir
//! - [`MemoryStore`]: a `BTreeMap`, for tests and ephemeral `--e2e` runs

pub mod keys;
pub mod memory;
pub mod redb_store;

use ptt_protocol::ErrorKind;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Stored value at {key} is corrupt: {reason}")]
    Corruption { key: String, reason: String },

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Corruption { .. } => ErrorKind::Corruption,
            _ => ErrorKind::Fatal,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied atomically by [`KvStore::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
        self
    }

    /// Bincode-encode `value` and queue a put.
    pub fn put_value<T: Serialize>(&mut self, key: impl Into<Vec<u8>>, value: &T) -> Result<&mut Self> {
        let bytes = encode(value)?;
        Ok(self.put(key, bytes))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Contract every backend implements.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Encoding(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Corruption {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

/// Load and decode one value.
pub fn load<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

/// Encode and store one value.
pub fn save<T: Serialize>(store: &dyn KvStore, key: &[u8], value: &T) -> Result<()> {
    store.put(key, &encode(value)?)
}

/// Decode every value under `prefix`.
pub fn load_prefix<T: DeserializeOwned>(store: &dyn KvStore, prefix: &[u8]) -> Result<Vec<T>> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(k, v)| decode(&k, &v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Shared behaviour every backend must satisfy.
    pub(crate) fn exercise_store(store: Arc<dyn KvStore>) {
        store.put(b"e1/board/id/a", b"1").unwrap();
        store.put(b"e1/board/id/b", b"2").unwrap();
        store.put(b"e1/boardx", b"3").unwrap();
        store.put(b"e2/board/id/a", b"4").unwrap();

        assert_eq!(store.get(b"e1/board/id/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);

        let scanned = store.scan_prefix(b"e1/board/").unwrap();
        assert_eq!(
            scanned,
            vec![
                (b"e1/board/id/a".to_vec(), b"1".to_vec()),
                (b"e1/board/id/b".to_vec(), b"2".to_vec()),
            ]
        );

        let mut batch = WriteBatch::new();
        batch.put(b"e1/meta".to_vec(), b"m".to_vec()).delete(b"e1/board/id/a".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"e1/board/id/a").unwrap(), None);
        assert_eq!(store.get(b"e1/meta").unwrap(), Some(b"m".to_vec()));

        store.delete(b"e1/meta").unwrap();
        store.delete(b"e1/meta").unwrap();
        assert_eq!(store.get(b"e1/meta").unwrap(), None);
    }

    #[test]
    fn test_memory_store_contract() {
        exercise_store(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn test_redb_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("ptt.redb")).unwrap();
        exercise_store(Arc::new(store));
    }

    #[test]
    fn test_typed_helpers() {
        let store = MemoryStore::new();
        save(&store, b"k", &(7u32, "seven".to_string())).unwrap();
        let loaded: Option<(u32, String)> = load(&store, b"k").unwrap();
        assert_eq!(loaded, Some((7, "seven".to_string())));

        store.put(b"bad", &[0xff]).unwrap();
        let err = load::<(u32, String)>(&store, b"bad").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
