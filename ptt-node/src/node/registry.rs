/// Process-wide registry of hosted entities.
///
/// Maps an entity id to the handle of its running worker. The persisted
/// side (`node/registry/{entityID}`) remembers which entities this node
/// hosts and where to dial for them, so a restart reopens the same set.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use ptt_protocol::PttID;

use crate::entity::{EntityHandle, EntityType};
use crate::storage::{self, keys, KvStore, Result};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistryRecord {
    pub entity_id: PttID,
    pub entity_type: EntityType,
    /// Peer address learned from the join url, re-dialed on start.
    pub dial: Option<String>,
}

pub struct Registry {
    kv: Arc<dyn KvStore>,
    handles: RwLock<HashMap<PttID, EntityHandle>>,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Registry {
            kv,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Every persisted record, in key order.
    pub fn records(&self) -> Result<Vec<RegistryRecord>> {
        storage::load_prefix(self.kv.as_ref(), keys::NODE_REGISTRY_PREFIX)
    }

    pub fn record(&self, id: &PttID) -> Result<Option<RegistryRecord>> {
        storage::load(self.kv.as_ref(), &keys::registry(id))
    }

    /// Track a running worker and persist its record; a known dial address
    /// is kept when `dial` is `None`.
    pub fn insert(&self, handle: EntityHandle, dial: Option<String>) -> Result<()> {
        let id = handle.id();
        let dial = match dial {
            Some(addr) => Some(addr),
            None => self.record(&id)?.and_then(|r| r.dial),
        };
        let record = RegistryRecord {
            entity_id: id,
            entity_type: handle.entity_type(),
            dial,
        };
        storage::save(self.kv.as_ref(), &keys::registry(&id), &record)?;
        self.write().insert(id, handle);
        Ok(())
    }

    pub fn get(&self, id: &PttID) -> Option<EntityHandle> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PttID) -> bool {
        self.read().contains_key(id)
    }

    /// Running workers of one type, sorted by id.
    pub fn by_type(&self, entity_type: EntityType) -> Vec<EntityHandle> {
        let mut out: Vec<EntityHandle> = self
            .read()
            .values()
            .filter(|h| h.entity_type() == entity_type)
            .cloned()
            .collect();
        out.sort_by_key(|h| h.id());
        out
    }

    pub fn handles(&self) -> Vec<EntityHandle> {
        self.read().values().cloned().collect()
    }

    /// Stop every worker and forget the handles; records stay.
    pub async fn shutdown(&self) {
        let handles: Vec<EntityHandle> = self.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PttID, EntityHandle>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PttID, EntityHandle>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::node::Node;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn test_records_follow_hosted_entities() {
        let node = Node::start(Config::ephemeral("reg")).await.unwrap();
        let registry = node.registry();
        let records = registry.records().unwrap();
        assert_eq!(records.len(), 3);
        for entity_type in [EntityType::Me, EntityType::Profile, EntityType::Board] {
            assert!(records.iter().any(|r| r.entity_type == entity_type));
            assert_eq!(registry.by_type(entity_type).len(), 1);
        }
        assert!(registry.contains(&node.me_id()));

        // a later insert without an address keeps the one on record
        let board = registry.by_type(EntityType::Board).remove(0);
        registry.insert(board.clone(), Some("10.0.0.1:9487".into())).unwrap();
        registry.insert(board.clone(), None).unwrap();
        let record = registry.record(&board.id()).unwrap().unwrap();
        assert_eq!(record.dial.as_deref(), Some("10.0.0.1:9487"));

        registry.shutdown().await;
        assert!(registry.handles().is_empty());
        assert_eq!(registry.records().unwrap().len(), 3);
        node.shutdown().await;
    }

    #[test]
    fn test_empty_store_has_no_records() {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        assert!(registry.records().unwrap().is_empty());
        assert!(registry.get(&PttID::random()).is_none());
    }
}
