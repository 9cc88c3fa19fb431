use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

use super::{BatchOp, KvStore, Result, StorageError, WriteBatch};

// Single table; callers multiplex by key prefix.
const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ptt");

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database file and make sure the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _ = write_txn.open_table(DATA_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        log::info!("RedbStore: opened {}", path.as_ref().display());
        Ok(Self { db })
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl KvStore for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(DATA_TABLE).map_err(backend)?;
        let val = table.get(key).map_err(backend)?.map(|v| v.value().to_vec());
        Ok(val)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write_batch(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write_batch(batch)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(DATA_TABLE).map_err(backend)?;
        let mut result = Vec::new();
        for entry in table.range(prefix..).map_err(backend)? {
            let (k, v) = entry.map_err(backend)?;
            let k_bytes = k.value();
            if !k_bytes.starts_with(prefix) {
                break;
            }
            result.push((k_bytes.to_vec(), v.value().to_vec()));
        }
        Ok(result)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(DATA_TABLE).map_err(backend)?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put(k, v) => {
                        table.insert(k.as_slice(), v.as_slice()).map_err(backend)?;
                    }
                    BatchOp::Delete(k) => {
                        table.remove(k.as_slice()).map_err(backend)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptt.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.put(b"me/raft/hardstate", b"hs").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get(b"me/raft/hardstate").unwrap(), Some(b"hs".to_vec()));
    }
}
