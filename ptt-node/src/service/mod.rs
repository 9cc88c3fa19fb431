//! Domain objects.
//!
//! Every domain category has a decode table mapping an opcode to a pure
//! apply function `(previous object, oplog) -> new object`. Replaying an
//! object's chain from its root through the table yields the object head, so
//! local apply and replay after sync are the same code path.
//!
//! | Module | Entity type | Categories |
//! |--------|-------------|------------|
//! | [`me_domain`] | Me | `me` |
//! | [`ptt_oplog`] | Me | `ptt` |
//! | [`profile`] | Profile | `user` |
//! | [`board`] | Board | `board` |
//! | [`friend`] | Friend | `friend` |

pub mod blocks;
pub mod board;
pub mod friend;
pub mod me_domain;
pub mod profile;
pub mod ptt_oplog;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ptt_protocol::oplog::{cbor_decode, cbor_encode, Category, Oplog, OplogError};
use ptt_protocol::{ErrorKind, PttID, Status, Timestamp};

use crate::entity::EntityType;
pub use blocks::{Block, BlockRef};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Unknown opcode {op} in {category}")]
    UnknownOp { category: &'static str, op: u32 },

    #[error("Opcode {0} cannot start an object chain")]
    NotCreation(&'static str),

    #[error("Object {0} was deleted")]
    Deleted(PttID),

    #[error("Line of {0} bytes exceeds the block limit")]
    LineTooLong(usize),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Oplog(#[from] OplogError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Deleted(_) => ErrorKind::Conflict,
            ServiceError::Oplog(e) => e.kind(),
            _ => ErrorKind::BadInput,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Me,
    MyNode,
    PttEvent,
    UserName,
    UserImg,
    NameCard,
    UserNode,
    Title,
    Article,
    Comment,
    Media,
    Message,
}

/// Head state of one object, derived from its applied chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub id: PttID,
    pub entity_id: PttID,
    pub kind: ObjectKind,
    pub status: Status,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    pub creator_id: PttID,
    pub updater_id: PttID,
    /// Creating oplog.
    pub log_id: PttID,
    /// Last applied oplog; the `preLogID` of the next update.
    pub head_log_id: PttID,
    /// Parent object (the article of a comment).
    pub parent_id: Option<PttID>,
    /// Kind-specific CBOR body.
    pub body: Vec<u8>,
    pub blocks: Vec<BlockRef>,
}

impl Object {
    /// Fresh object created by `oplog`.
    pub fn created(oplog: &Oplog, kind: ObjectKind, body: Vec<u8>) -> Self {
        Object {
            id: oplog.obj_id,
            entity_id: oplog.entity_id,
            kind,
            status: Status::Alive,
            create_ts: oplog.create_ts,
            update_ts: oplog.update_ts,
            creator_id: oplog.creator_id,
            updater_id: oplog.creator_id,
            log_id: oplog.id,
            head_log_id: oplog.id,
            parent_id: None,
            body,
            blocks: Vec::new(),
        }
    }

    /// Copy of `self` touched by `oplog`.
    pub fn updated(&self, oplog: &Oplog) -> Self {
        let mut next = self.clone();
        next.update_ts = oplog.update_ts;
        next.updater_id = oplog.creator_id;
        next.head_log_id = oplog.id;
        next
    }

    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(cbor_decode(&self.body)?)
    }

    pub fn is_alive(&self) -> bool {
        self.status == Status::Alive
    }
}

pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(cbor_encode(body)?)
}

/// Output of one apply step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub object: Object,
    /// Newly written blocks, stored alongside the object.
    pub blocks: Vec<Block>,
}

impl Applied {
    pub fn object(object: Object) -> Self {
        Applied {
            object,
            blocks: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decode table
// ---------------------------------------------------------------------------

pub type ApplyFn = fn(Option<&Object>, &Oplog) -> Result<Applied>;

pub struct DecodeEntry {
    pub category: Category,
    pub op: u32,
    pub name: &'static str,
    /// May start an object chain.
    pub creates: bool,
    pub apply: ApplyFn,
}

#[derive(Clone, Copy)]
pub struct DecodeTable {
    entity_type: EntityType,
    entries: &'static [DecodeEntry],
}

impl DecodeTable {
    pub fn for_type(entity_type: EntityType) -> Self {
        let entries: &'static [DecodeEntry] = match entity_type {
            EntityType::Me => me_domain::ME_TABLE,
            EntityType::Profile => profile::TABLE,
            EntityType::Board => board::TABLE,
            EntityType::Friend => friend::TABLE,
        };
        DecodeTable {
            entity_type,
            entries,
        }
    }

    pub fn lookup(&self, category: Category, op: u32) -> Option<&'static DecodeEntry> {
        // the Me entity also carries the ptt category
        let entries = if self.entity_type == EntityType::Me && category == Category::Ptt {
            ptt_oplog::TABLE
        } else {
            self.entries
        };
        entries.iter().find(|e| e.category == category && e.op == op)
    }

    /// Apply one oplog on top of `prev`.
    pub fn apply(&self, prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
        let entry = self
            .lookup(oplog.category, oplog.op)
            .ok_or(ServiceError::UnknownOp {
                category: oplog.category.as_str(),
                op: oplog.op,
            })?;
        if prev.is_none() && !entry.creates {
            return Err(ServiceError::NotCreation(entry.name));
        }
        (entry.apply)(prev, oplog)
    }

    /// Replay an applied chain path, root first. Failing steps are skipped.
    pub fn replay<'a, I>(&self, path: I) -> Option<(Object, Vec<Block>)>
    where
        I: IntoIterator<Item = &'a Oplog>,
    {
        let mut object: Option<Object> = None;
        let mut blocks = Vec::new();
        for oplog in path {
            match self.apply(object.as_ref(), oplog) {
                Ok(applied) => {
                    object = Some(applied.object);
                    blocks.extend(applied.blocks);
                }
                Err(e) => {
                    log::debug!("replay: skipping {} on {}: {}", oplog.id.short(), oplog.obj_id.short(), e);
                    if object.is_none() {
                        return None;
                    }
                }
            }
        }
        object.map(|o| (o, blocks))
    }

    pub fn op_name(&self, category: Category, op: u32) -> &'static str {
        self.lookup(category, op).map(|e| e.name).unwrap_or("Unknown")
    }
}

/// Read access to applied objects, for the query views.
pub trait ObjectSource {
    fn object(&self, id: &PttID) -> Option<Object>;

    fn objects(&self, kind: ObjectKind) -> Vec<Object>;

    fn block_lines(&self, obj_id: &PttID, block: &BlockRef) -> Result<Vec<Vec<u8>>>;
}

/// Reject updates to a deleted object.
pub(crate) fn require_alive(prev: Option<&Object>) -> Result<&Object> {
    let prev = prev.ok_or(ServiceError::NotCreation("update"))?;
    if !prev.is_alive() {
        return Err(ServiceError::Deleted(prev.id));
    }
    Ok(prev)
}

/// Soft delete: status flips, the chain and the blocks stay.
pub(crate) fn apply_delete(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let prev = require_alive(prev)?;
    let mut object = prev.updated(oplog);
    object.status = Status::Deleted;
    Ok(Applied::object(object))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use ptt_protocol::crypto::generate_keypair;
    use ptt_protocol::oplog::{NewOplog, OpSigner};

    /// Oplog signed by a fresh identity, `at` seconds after a fixed epoch.
    pub(crate) fn oplog_for<T: Serialize>(
        entity_id: PttID,
        category: Category,
        op: u32,
        obj_id: PttID,
        data: &T,
        at: i64,
    ) -> Oplog {
        let (pubkey, private) = generate_keypair();
        let id = PttID::from_pubkey(&pubkey);
        let signer = OpSigner::direct(id, private).unwrap();
        let new = NewOplog {
            entity_id,
            category,
            op,
            obj_id,
            pre_log_id: None,
            master_log_id: PttID::random(),
            data: cbor_encode(data).unwrap(),
            extra: Vec::new(),
        };
        Oplog::create(new, &signer, Timestamp::from_seconds(1_700_000_000 + at)).unwrap()
    }

    #[derive(Default)]
    pub(crate) struct MemSource {
        objects: BTreeMap<PttID, Object>,
        blocks: HashMap<PttID, Vec<Vec<u8>>>,
    }

    impl MemSource {
        pub(crate) fn apply(&mut self, table: &DecodeTable, prev: Option<&Object>, oplog: &Oplog) {
            let applied = table.apply(prev, oplog).unwrap();
            for block in applied.blocks {
                self.blocks.insert(block.id, block.lines);
            }
            self.objects.insert(applied.object.id, applied.object);
        }
    }

    impl ObjectSource for MemSource {
        fn object(&self, id: &PttID) -> Option<Object> {
            self.objects.get(id).cloned()
        }

        fn objects(&self, kind: ObjectKind) -> Vec<Object> {
            self.objects.values().filter(|o| o.kind == kind).cloned().collect()
        }

        fn block_lines(&self, _obj_id: &PttID, block: &BlockRef) -> Result<Vec<Vec<u8>>> {
            self.blocks
                .get(&block.id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(block.id.to_string()))
        }
    }

    #[test]
    fn test_tables_have_unique_opcodes() {
        for t in [EntityType::Me, EntityType::Profile, EntityType::Board, EntityType::Friend] {
            let table = DecodeTable::for_type(t);
            for (i, a) in table.entries.iter().enumerate() {
                for b in &table.entries[i + 1..] {
                    assert!(!(a.category == b.category && a.op == b.op), "{} duplicates {}", a.name, b.name);
                }
                assert!(t.domain_categories().contains(&a.category));
            }
        }
    }

    #[test]
    fn test_me_table_resolves_ptt_category() {
        let table = DecodeTable::for_type(EntityType::Me);
        assert!(table.lookup(Category::Ptt, ptt_oplog::PttOp::CreateBoard as u32).is_some());
        let board = DecodeTable::for_type(EntityType::Board);
        assert!(board.lookup(Category::Ptt, ptt_oplog::PttOp::CreateBoard as u32).is_none());
    }
}
