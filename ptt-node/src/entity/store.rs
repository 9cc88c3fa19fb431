/// Entity-scoped persistence.
///
/// Thin typed layer over [`KvStore`] for one entity's keys. Writes go through
/// a [`WriteBatch`] so one accepted oplog and everything it derives land
/// together.
use std::sync::Arc;

use ptt_protocol::merkle::MerkleUpdate;
use ptt_protocol::oplog::Category;
use ptt_protocol::{Oplog, PttID};

use super::{EntityRecord, Result};
use crate::service::{Block, BlockRef, Object};
use crate::storage::{self, keys, KvStore, StorageError, WriteBatch};

#[derive(Clone)]
pub struct EntityStore {
    entity_id: PttID,
    kv: Arc<dyn KvStore>,
}

impl EntityStore {
    pub fn new(entity_id: PttID, kv: Arc<dyn KvStore>) -> Self {
        EntityStore { entity_id, kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // ── Oplogs ───────────────────────────────────────────────────────────

    pub fn load_oplogs(&self, category: Category) -> Result<Vec<Oplog>> {
        let prefix = keys::oplog_prefix(&self.entity_id, category);
        let mut out = Vec::new();
        for (key, value) in self.kv.scan_prefix(&prefix)? {
            let oplog = Oplog::from_bytes(&value).map_err(|e| StorageError::Corruption {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })?;
            out.push(oplog);
        }
        Ok(out)
    }

    pub fn pending_ids(&self, category: Category) -> Result<Vec<PttID>> {
        let prefix = keys::pending_prefix(&self.entity_id, category);
        self.kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| {
                let text = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
                PttID::from_base58(&text).map_err(|e| {
                    StorageError::Corruption {
                        key: String::from_utf8_lossy(&key).into_owned(),
                        reason: e.to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Queue an oplog with its chain index; `pending` marks it unsigned.
    pub fn put_oplog(&self, batch: &mut WriteBatch, oplog: &Oplog, pending: bool) -> Result<()> {
        let bytes = oplog.to_bytes()?;
        batch.put(keys::oplog(&self.entity_id, oplog.category, &oplog.id), bytes);
        batch.put(
            keys::chain(
                &self.entity_id,
                oplog.category,
                &oplog.obj_id,
                oplog.pre_log_id.as_ref(),
                &oplog.id,
            ),
            oplog.id.to_base58().into_bytes(),
        );
        let pending_key = keys::pending(&self.entity_id, oplog.category, &oplog.id);
        if pending {
            batch.put(pending_key, Vec::new());
        } else {
            batch.delete(pending_key);
        }
        Ok(())
    }

    pub fn delete_oplog(&self, batch: &mut WriteBatch, oplog: &Oplog) {
        batch.delete(keys::oplog(&self.entity_id, oplog.category, &oplog.id));
        batch.delete(keys::chain(
            &self.entity_id,
            oplog.category,
            &oplog.obj_id,
            oplog.pre_log_id.as_ref(),
            &oplog.id,
        ));
        batch.delete(keys::pending(&self.entity_id, oplog.category, &oplog.id));
    }

    // ── Objects and blocks ───────────────────────────────────────────────

    pub fn load_objects(&self) -> Result<Vec<Object>> {
        Ok(storage::load_prefix(self.kv.as_ref(), &keys::object_prefix(&self.entity_id))?)
    }

    pub fn put_object(&self, batch: &mut WriteBatch, object: &Object) -> Result<()> {
        batch.put_value(keys::object(&self.entity_id, &object.id), object)?;
        Ok(())
    }

    pub fn delete_object(&self, batch: &mut WriteBatch, obj_id: &PttID) {
        batch.delete(keys::object(&self.entity_id, obj_id));
    }

    pub fn put_blocks(&self, batch: &mut WriteBatch, obj_id: &PttID, blocks: &[Block]) {
        for block in blocks {
            for (i, line) in block.lines.iter().enumerate() {
                batch.put(keys::block(&self.entity_id, obj_id, &block.id, i as u32), line.clone());
            }
        }
    }

    /// Lines of one block, checked against the hash on the object.
    pub fn block_lines(&self, obj_id: &PttID, block: &BlockRef) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::with_capacity(block.n_sub as usize);
        for i in 0..block.n_sub {
            let key = keys::block(&self.entity_id, obj_id, &block.id, i);
            let line = self
                .kv
                .get(&key)?
                .ok_or_else(|| StorageError::Corruption {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason: "missing block line".into(),
                })?;
            lines.push(line);
        }
        if crate::service::blocks::hash_lines(&lines) != block.hash {
            return Err(StorageError::Corruption {
                key: format!("{}/block/{}", self.entity_id.short(), block.id.short()),
                reason: "block hash mismatch".into(),
            }
            .into());
        }
        Ok(lines)
    }

    // ── Merkle ───────────────────────────────────────────────────────────

    pub fn put_merkle(&self, batch: &mut WriteBatch, category: Category, updates: &[MerkleUpdate]) -> Result<()> {
        for update in updates {
            let key = keys::merkle(&self.entity_id, category, update.level, update.start);
            match &update.node {
                Some(node) => {
                    batch.put_value(key, node)?;
                }
                None => {
                    batch.delete(key);
                }
            }
        }
        Ok(())
    }

    // ── Meta ─────────────────────────────────────────────────────────────

    pub fn load_record(&self) -> Result<Option<EntityRecord>> {
        Ok(storage::load(self.kv.as_ref(), &keys::meta(&self.entity_id))?)
    }

    pub fn put_record(&self, batch: &mut WriteBatch, record: &EntityRecord) -> Result<()> {
        batch.put_value(keys::meta(&self.entity_id), record)?;
        Ok(())
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        Ok(self.kv.write_batch(batch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::membership::tests::{create_entity, user};
    use crate::entity::EntityType;
    use crate::storage::MemoryStore;

    #[test]
    fn test_oplog_pending_roundtrip() {
        let a = user();
        let e = PttID::new_under(&a.id);
        let store = EntityStore::new(e, Arc::new(MemoryStore::new()));
        let create = create_entity(&a, e, EntityType::Board, 0);

        let mut batch = WriteBatch::new();
        store.put_oplog(&mut batch, &create, true).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(store.load_oplogs(Category::Master).unwrap(), vec![create.clone()]);
        assert_eq!(store.pending_ids(Category::Master).unwrap(), vec![create.id]);

        let mut batch = WriteBatch::new();
        store.put_oplog(&mut batch, &create, false).unwrap();
        store.commit(batch).unwrap();
        assert!(store.pending_ids(Category::Master).unwrap().is_empty());

        let mut batch = WriteBatch::new();
        store.delete_oplog(&mut batch, &create);
        store.commit(batch).unwrap();
        assert!(store.load_oplogs(Category::Master).unwrap().is_empty());
        assert!(store.kv().scan_prefix(&keys::entity_prefix(&e)).unwrap().is_empty());
    }

    #[test]
    fn test_block_hash_checked() {
        let e = PttID::random();
        let obj = PttID::random();
        let store = EntityStore::new(e, Arc::new(MemoryStore::new()));
        let blocks = crate::service::blocks::make_blocks(&obj, &PttID::random(), &[b"a".to_vec(), b"b".to_vec()]).unwrap();
        let mut batch = WriteBatch::new();
        store.put_blocks(&mut batch, &obj, &blocks);
        store.commit(batch).unwrap();

        let block_ref = blocks[0].to_ref();
        assert_eq!(store.block_lines(&obj, &block_ref).unwrap(), blocks[0].lines);

        store.kv().put(&keys::block(&e, &obj, &block_ref.id, 1), b"tampered").unwrap();
        let err = store.block_lines(&obj, &block_ref).unwrap_err();
        assert_eq!(err.kind(), ptt_protocol::ErrorKind::Corruption);
    }
}
