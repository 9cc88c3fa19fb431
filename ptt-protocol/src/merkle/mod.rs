/// Time-bucketed merkle index over one oplog category.
///
/// Level 0 leaves cover a 60-second window of `create_ts`; level `k` covers
/// `60^k` leaf windows (minute, hour, 60 hours, 150 days). A leaf hashes the
/// `(id, hash)` pairs of its oplogs in id order; an inner node hashes its
/// children in start order. Two peers compare nodes top-down and only fetch
/// the leaf windows whose hashes differ.
pub mod sync;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::{PttID, Timestamp};

pub use sync::{LeafWindow, MerkleQuery, SyncPlanner};

pub const LEAF_WINDOW_SECS: i64 = 60;
pub const MERKLE_BASE: i64 = 60;
pub const MERKLE_LEVELS: u8 = 4;
pub const TOP_LEVEL: u8 = MERKLE_LEVELS - 1;

const LEAF_TAG: &[u8] = b"ptt-merkle-leaf-v1";
const NODE_TAG: &[u8] = b"ptt-merkle-node-v1";
const ROOT_TAG: &[u8] = b"ptt-merkle-root-v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Invalid merkle level {0}")]
    InvalidLevel(u8),

    #[error("Invalid range [{0}, {1})")]
    InvalidRange(i64, i64),

    #[error("Reply node at level {got} does not answer a level {want} query")]
    UnexpectedReply { want: u8, got: u8 },
}

impl MerkleError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BadInput
    }
}

pub type Result<T> = std::result::Result<T, MerkleError>;

/// Seconds covered by one node at `level`.
pub fn window_secs(level: u8) -> i64 {
    let mut window = LEAF_WINDOW_SECS;
    for _ in 0..level {
        window = window.saturating_mul(MERKLE_BASE);
    }
    window
}

/// Start of the `level` bucket containing `ts`.
pub fn bucket_of(ts: Timestamp, level: u8) -> i64 {
    ts.bucket_start(window_secs(level))
}

fn check_level(level: u8) -> Result<()> {
    if level >= MERKLE_LEVELS {
        return Err(MerkleError::InvalidLevel(level));
    }
    Ok(())
}

/// One exchanged merkle node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MerkleNode {
    pub level: u8,
    pub start: i64,
    pub hash: [u8; 32],
    /// Oplogs under this node.
    pub count: u32,
}

impl MerkleNode {
    pub fn end(&self) -> i64 {
        self.start.saturating_add(window_secs(self.level))
    }
}

/// A node that changed after insert/remove; `node == None` means deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleUpdate {
    pub level: u8,
    pub start: i64,
    pub node: Option<MerkleNode>,
}

#[derive(Debug, Clone, Default)]
pub struct MerkleIndex {
    leaves: BTreeMap<i64, BTreeMap<PttID, [u8; 32]>>,
    levels: Vec<BTreeMap<i64, MerkleNode>>,
}

impl MerkleIndex {
    pub fn new() -> Self {
        MerkleIndex {
            leaves: BTreeMap::new(),
            levels: vec![BTreeMap::new(); MERKLE_LEVELS as usize],
        }
    }

    /// Build an index from `(id, hash, create_ts)` triples.
    pub fn rebuild<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PttID, [u8; 32], Timestamp)>,
    {
        let mut index = Self::new();
        for (id, hash, ts) in entries {
            index.insert(id, hash, ts);
        }
        index
    }

    /// Add an oplog; returns the nodes that changed (empty if already present).
    pub fn insert(&mut self, id: PttID, hash: [u8; 32], create_ts: Timestamp) -> Vec<MerkleUpdate> {
        let bucket = bucket_of(create_ts, 0);
        let leaf = self.leaves.entry(bucket).or_default();
        if leaf.contains_key(&id) {
            return Vec::new();
        }
        leaf.insert(id, hash);
        self.propagate(create_ts)
    }

    /// Remove an oplog; returns the nodes that changed.
    pub fn remove(&mut self, id: &PttID, create_ts: Timestamp) -> Vec<MerkleUpdate> {
        let bucket = bucket_of(create_ts, 0);
        let removed = match self.leaves.get_mut(&bucket) {
            Some(leaf) => leaf.remove(id).is_some(),
            None => false,
        };
        if !removed {
            return Vec::new();
        }
        if self.leaves.get(&bucket).is_some_and(|l| l.is_empty()) {
            self.leaves.remove(&bucket);
        }
        self.propagate(create_ts)
    }

    pub fn contains(&self, id: &PttID, create_ts: Timestamp) -> bool {
        self.leaves
            .get(&bucket_of(create_ts, 0))
            .is_some_and(|leaf| leaf.contains_key(id))
    }

    /// Recompute the leaf containing `ts` and every ancestor.
    fn propagate(&mut self, ts: Timestamp) -> Vec<MerkleUpdate> {
        let mut updates = Vec::with_capacity(MERKLE_LEVELS as usize);

        let leaf_start = bucket_of(ts, 0);
        let leaf_node = self.leaves.get(&leaf_start).map(|leaf| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(LEAF_TAG);
            for (id, hash) in leaf {
                hasher.update(id.as_bytes());
                hasher.update(hash);
            }
            MerkleNode {
                level: 0,
                start: leaf_start,
                hash: *hasher.finalize().as_bytes(),
                count: leaf.len() as u32,
            }
        });
        updates.push(self.set_node(0, leaf_start, leaf_node));

        for level in 1..MERKLE_LEVELS {
            let start = bucket_of(ts, level);
            let end = start.saturating_add(window_secs(level));
            let children: Vec<MerkleNode> = self.levels[(level - 1) as usize]
                .range(start..end)
                .map(|(_, n)| *n)
                .collect();
            let node = if children.is_empty() {
                None
            } else {
                let mut hasher = blake3::Hasher::new();
                hasher.update(NODE_TAG);
                hasher.update(&[level]);
                let mut count = 0u32;
                for child in &children {
                    hasher.update(&child.start.to_be_bytes());
                    hasher.update(&child.hash);
                    count = count.saturating_add(child.count);
                }
                Some(MerkleNode {
                    level,
                    start,
                    hash: *hasher.finalize().as_bytes(),
                    count,
                })
            };
            updates.push(self.set_node(level, start, node));
        }
        updates
    }

    fn set_node(&mut self, level: u8, start: i64, node: Option<MerkleNode>) -> MerkleUpdate {
        let map = &mut self.levels[level as usize];
        match node {
            Some(n) => {
                map.insert(start, n);
            }
            None => {
                map.remove(&start);
            }
        }
        MerkleUpdate { level, start, node }
    }

    /// Nodes at `level` whose start lies in `[start, end)`.
    pub fn nodes(&self, level: u8, start: i64, end: i64) -> Result<Vec<MerkleNode>> {
        check_level(level)?;
        if end < start {
            return Err(MerkleError::InvalidRange(start, end));
        }
        Ok(self.levels[level as usize]
            .range(start..end)
            .map(|(_, n)| *n)
            .collect())
    }

    /// Every node at `level`.
    pub fn all_nodes(&self, level: u8) -> Result<Vec<MerkleNode>> {
        check_level(level)?;
        Ok(self.levels[level as usize].values().copied().collect())
    }

    pub fn node(&self, level: u8, start: i64) -> Option<&MerkleNode> {
        self.levels.get(level as usize).and_then(|m| m.get(&start))
    }

    /// Digest of the whole category.
    pub fn root(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ROOT_TAG);
        for node in self.levels[TOP_LEVEL as usize].values() {
            hasher.update(&node.start.to_be_bytes());
            hasher.update(&node.hash);
        }
        *hasher.finalize().as_bytes()
    }

    /// Oplog ids in the leaf windows covering `[start, end)`.
    pub fn ids_in_range(&self, start: i64, end: i64) -> Vec<PttID> {
        let first = start.div_euclid(LEAF_WINDOW_SECS) * LEAF_WINDOW_SECS;
        self.leaves
            .range(first..end.max(first))
            .flat_map(|(_, leaf)| leaf.keys().copied())
            .collect()
    }

    pub fn leaf_members(&self, leaf_start: i64) -> Vec<PttID> {
        self.leaves
            .get(&leaf_start)
            .map(|leaf| leaf.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.leaves.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}
