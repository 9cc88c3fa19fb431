//! Durable raft state under `me/raft/...`, behind openraft's storage traits.
//!
//! The log, the vote, the purge mark and the applied state each live under
//! their own key in the node's [`KvStore`]. The state machine is the group
//! configuration only, so applying an entry means recording its log id and,
//! for membership entries, the new membership. Records are JSON: openraft's
//! types are serde-derived for self-describing formats.
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    AnyError, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{DeviceNode, MeTypeConfig, RaftId};
use crate::storage::{self as kv, keys, KvStore, WriteBatch};

type StoreResult<T> = Result<T, StorageError<RaftId>>;

/// What the state machine has applied so far.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub last_applied: Option<LogId<RaftId>>,
    pub membership: StoredMembership<RaftId, DeviceNode>,
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<RaftId, DeviceNode>,
    data: Vec<u8>,
}

fn io_error(subject: ErrorSubject<RaftId>, verb: ErrorVerb, e: impl ToString) -> StorageError<RaftId> {
    StorageIOError::new(subject, verb, AnyError::error(e)).into()
}

#[derive(Clone)]
pub struct MeStore {
    kv: Arc<dyn KvStore>,
}

impl MeStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        MeStore { kv }
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> kv::Result<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| kv::StorageError::Corruption {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(batch: &mut WriteBatch, key: impl Into<Vec<u8>>, value: &T) -> kv::Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| kv::StorageError::Encoding(e.to_string()))?;
        batch.put(key, bytes);
        Ok(())
    }

    fn entries(&self) -> kv::Result<Vec<Entry<MeTypeConfig>>> {
        let mut entries = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(keys::RAFT_LOG_PREFIX)? {
            let entry: Entry<MeTypeConfig> =
                serde_json::from_slice(&bytes).map_err(|e| kv::StorageError::Corruption {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }
        // keys are fixed-width hex, already in index order
        Ok(entries)
    }

    pub fn applied(&self) -> kv::Result<Applied> {
        Ok(self.get(keys::RAFT_APPLIED)?.unwrap_or_default())
    }

    /// Nothing stored yet: this device has never been part of a group.
    pub fn is_fresh(&self) -> kv::Result<bool> {
        Ok(self.kv.scan_prefix(keys::RAFT_PREFIX)?.is_empty())
    }

    /// Forget the group entirely, before joining another one.
    pub fn clear(&self) -> kv::Result<()> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.kv.scan_prefix(keys::RAFT_PREFIX)? {
            batch.delete(key);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(batch)
    }

    fn snapshot_of(&self, applied: &Applied) -> kv::Result<StoredSnapshot> {
        let data = serde_json::to_vec(applied).map_err(|e| kv::StorageError::Encoding(e.to_string()))?;
        let snapshot_id = match applied.last_applied {
            Some(log_id) => log_id.to_string(),
            None => "empty".to_string(),
        };
        Ok(StoredSnapshot {
            meta: SnapshotMeta {
                last_log_id: applied.last_applied,
                last_membership: applied.membership.clone(),
                snapshot_id,
            },
            data,
        })
    }
}

impl RaftLogReader<MeTypeConfig> for MeStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> StoreResult<Vec<Entry<MeTypeConfig>>> {
        let entries = self
            .entries()
            .map_err(|e| io_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;
        Ok(entries
            .into_iter()
            .filter(|e| range.contains(&e.log_id.index))
            .collect())
    }
}

impl RaftSnapshotBuilder<MeTypeConfig> for MeStore {
    async fn build_snapshot(&mut self) -> StoreResult<Snapshot<MeTypeConfig>> {
        let stored = self
            .applied()
            .and_then(|applied| self.snapshot_of(&applied))
            .map_err(|e| io_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        let mut batch = WriteBatch::new();
        Self::put(&mut batch, keys::RAFT_SNAPSHOT, &stored)
            .and_then(|_| self.kv.write_batch(batch))
            .map_err(|e| io_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        log::debug!("raft: snapshot {} built", stored.meta.snapshot_id);
        Ok(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        })
    }
}

#[allow(deprecated)]
impl RaftStorage<MeTypeConfig> for MeStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn save_vote(&mut self, vote: &Vote<RaftId>) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        Self::put(&mut batch, keys::RAFT_VOTE, vote)
            .and_then(|_| self.kv.write_batch(batch))
            .map_err(|e| io_error(ErrorSubject::Vote, ErrorVerb::Write, e))
    }

    async fn read_vote(&mut self) -> StoreResult<Option<Vote<RaftId>>> {
        self.get(keys::RAFT_VOTE)
            .map_err(|e| io_error(ErrorSubject::Vote, ErrorVerb::Read, e))
    }

    async fn get_log_state(&mut self) -> StoreResult<LogState<MeTypeConfig>> {
        let read = |e: kv::StorageError| io_error(ErrorSubject::Logs, ErrorVerb::Read, e);
        let last_purged_log_id: Option<LogId<RaftId>> = self.get(keys::RAFT_PURGED).map_err(read)?;
        let last = self.entries().map_err(read)?.last().map(|e| e.log_id);
        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = Entry<MeTypeConfig>> + OptionalSend,
    {
        let write = |e: kv::StorageError| io_error(ErrorSubject::Logs, ErrorVerb::Write, e);
        let mut batch = WriteBatch::new();
        for entry in entries {
            Self::put(&mut batch, keys::raft_log(entry.log_id.index), &entry).map_err(write)?;
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(batch).map_err(write)
    }

    async fn delete_conflict_logs_since(&mut self, log_id: LogId<RaftId>) -> StoreResult<()> {
        let delete = |e: kv::StorageError| io_error(ErrorSubject::Logs, ErrorVerb::Delete, e);
        let mut batch = WriteBatch::new();
        for entry in self.entries().map_err(delete)? {
            if entry.log_id.index >= log_id.index {
                batch.delete(keys::raft_log(entry.log_id.index));
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(batch).map_err(delete)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<RaftId>) -> StoreResult<()> {
        let delete = |e: kv::StorageError| io_error(ErrorSubject::Logs, ErrorVerb::Delete, e);
        let mut batch = WriteBatch::new();
        for entry in self.entries().map_err(delete)? {
            if entry.log_id.index <= log_id.index {
                batch.delete(keys::raft_log(entry.log_id.index));
            }
        }
        Self::put(&mut batch, keys::RAFT_PURGED, &log_id).map_err(delete)?;
        self.kv.write_batch(batch).map_err(delete)
    }

    async fn last_applied_state(
        &mut self,
    ) -> StoreResult<(Option<LogId<RaftId>>, StoredMembership<RaftId, DeviceNode>)> {
        let applied = self
            .applied()
            .map_err(|e| io_error(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;
        Ok((applied.last_applied, applied.membership))
    }

    async fn apply_to_state_machine(&mut self, entries: &[Entry<MeTypeConfig>]) -> StoreResult<Vec<()>> {
        let write = |e: kv::StorageError| io_error(ErrorSubject::StateMachine, ErrorVerb::Write, e);
        let mut applied = self.applied().map_err(write)?;
        let mut replies = Vec::with_capacity(entries.len());
        for entry in entries {
            applied.last_applied = Some(entry.log_id);
            if let EntryPayload::Membership(membership) = &entry.payload {
                log::info!("raft: membership {:?} applied at {}", membership, entry.log_id.index);
                applied.membership = StoredMembership::new(Some(entry.log_id), membership.clone());
            }
            replies.push(());
        }
        let mut batch = WriteBatch::new();
        Self::put(&mut batch, keys::RAFT_APPLIED, &applied).map_err(write)?;
        self.kv.write_batch(batch).map_err(write)?;
        Ok(replies)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> StoreResult<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftId, DeviceNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> StoreResult<()> {
        let subject = ErrorSubject::Snapshot(Some(meta.signature()));
        let data = snapshot.into_inner();
        let applied: Applied = serde_json::from_slice(&data)
            .map_err(|e| io_error(subject.clone(), ErrorVerb::Read, e))?;
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        let mut batch = WriteBatch::new();
        Self::put(&mut batch, keys::RAFT_APPLIED, &applied)
            .and_then(|_| Self::put(&mut batch, keys::RAFT_SNAPSHOT, &stored))
            .and_then(|_| self.kv.write_batch(batch))
            .map_err(|e| io_error(subject, ErrorVerb::Write, e))?;
        log::info!("raft: installed snapshot {}", meta.snapshot_id);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> StoreResult<Option<Snapshot<MeTypeConfig>>> {
        let stored: Option<StoredSnapshot> = self
            .get(keys::RAFT_SNAPSHOT)
            .map_err(|e| io_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(stored.map(|s| Snapshot {
            meta: s.meta,
            snapshot: Box::new(Cursor::new(s.data)),
        }))
    }
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use openraft::{CommittedLeaderId, Membership};
    use std::collections::{BTreeMap, BTreeSet};

    fn entry(term: u64, index: u64) -> Entry<MeTypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn test_log_survives_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut store = MeStore::new(kv.clone());
        assert!(store.is_fresh().unwrap());

        store.append_to_log((1..=5).map(|i| entry(1, i))).await.unwrap();
        store.save_vote(&Vote::new(1, 9)).await.unwrap();
        assert!(!store.is_fresh().unwrap());

        let mut reloaded = MeStore::new(kv.clone());
        assert_eq!(reloaded.read_vote().await.unwrap(), Some(Vote::new(1, 9)));
        let got = reloaded.try_get_log_entries(2..4).await.unwrap();
        assert_eq!(got.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![2, 3]);

        reloaded.delete_conflict_logs_since(entry(1, 4).log_id).await.unwrap();
        reloaded.purge_logs_upto(entry(1, 1).log_id).await.unwrap();
        let state = reloaded.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(1));
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));

        reloaded.clear().unwrap();
        assert!(reloaded.is_fresh().unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_carries_membership() {
        let mut store = MeStore::new(Arc::new(MemoryStore::new()));
        let membership = Membership::new(
            vec![BTreeSet::from([1, 2])],
            BTreeMap::from([(1, DeviceNode { weight: 2 }), (2, DeviceNode { weight: 1 })]),
        );
        let entries = vec![
            entry(1, 1),
            Entry {
                log_id: LogId::new(CommittedLeaderId::new(1, 1), 2),
                payload: EntryPayload::Membership(membership.clone()),
            },
        ];
        store.apply_to_state_machine(&entries).await.unwrap();
        let snapshot = store.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.map(|l| l.index), Some(2));

        let mut other = MeStore::new(Arc::new(MemoryStore::new()));
        other.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();
        let (last, stored) = other.last_applied_state().await.unwrap();
        assert_eq!(last.map(|l| l.index), Some(2));
        assert_eq!(stored.membership(), &membership);
        assert!(other.get_current_snapshot().await.unwrap().is_some());
    }
}
