/// Core opcodes and their CBOR payloads.
///
/// Master, member and OpKey oplogs are the same for every entity type;
/// domain opcodes are declared by the entity types that own them.
use serde::{Deserialize, Serialize};

use crate::crypto::KeyExtra;
use crate::types::{NodeID, PttID, Timestamp};

// ---------------------------------------------------------------------------
// Master category
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MasterOp {
    CreateEntity = 1,
    AddMaster = 2,
    RemoveMaster = 3,
    TransferMaster = 4,
    MigrateEntity = 5,
    DeleteEntity = 6,
}

impl MasterOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::CreateEntity),
            2 => Some(Self::AddMaster),
            3 => Some(Self::RemoveMaster),
            4 => Some(Self::TransferMaster),
            5 => Some(Self::MigrateEntity),
            6 => Some(Self::DeleteEntity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MasterOp::CreateEntity => "CreateEntity",
            MasterOp::AddMaster => "AddMaster",
            MasterOp::RemoveMaster => "RemoveMaster",
            MasterOp::TransferMaster => "TransferMaster",
            MasterOp::MigrateEntity => "MigrateEntity",
            MasterOp::DeleteEntity => "DeleteEntity",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateEntityData {
    /// Entity type tag, interpreted by the node.
    pub entity_type: u8,
    pub master_id: PttID,
    pub master_pub: [u8; 32],
    pub owner_ids: Vec<PttID>,
    /// Type-specific creation payload (board title, friend pair, ...).
    pub body: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AddMasterData {
    pub master_id: PttID,
    pub master_pub: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoveMasterData {
    pub master_id: PttID,
}

/// Atomic promote + demote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferMasterData {
    pub from_id: PttID,
    pub to_id: PttID,
    pub to_pub: [u8; 32],
}

/// Owner change; the legacy owner stays listed so its signatures verify.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MigrateEntityData {
    pub legacy_owner: PttID,
    pub new_owner: PttID,
    pub new_owner_pub: [u8; 32],
    /// Entity the legacy one was merged into, if any.
    pub merged_into: Option<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeleteEntityData {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Member category
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemberOp {
    AddMember = 1,
    DeleteMember = 2,
    MigrateMember = 3,
}

impl MemberOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::AddMember),
            2 => Some(Self::DeleteMember),
            3 => Some(Self::MigrateMember),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberOp::AddMember => "AddMember",
            MemberOp::DeleteMember => "DeleteMember",
            MemberOp::MigrateMember => "MigrateMember",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AddMemberData {
    pub member_id: PttID,
    pub member_pub: [u8; 32],
    /// Device that brought the member in, when known.
    pub node_id: Option<NodeID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeleteMemberData {
    pub member_id: PttID,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MigrateMemberData {
    pub from_id: PttID,
    pub to_id: PttID,
    pub to_pub: [u8; 32],
}

// ---------------------------------------------------------------------------
// OpKey category
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpKeyOp {
    CreateOpKey = 1,
    RevokeOpKey = 2,
    DeleteOpKey = 3,
}

impl OpKeyOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::CreateOpKey),
            2 => Some(Self::RevokeOpKey),
            3 => Some(Self::DeleteOpKey),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKeyOp::CreateOpKey => "CreateOpKey",
            OpKeyOp::RevokeOpKey => "RevokeOpKey",
            OpKeyOp::DeleteOpKey => "DeleteOpKey",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKeyEndReason {
    Expired,
    Revoked,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateOpKeyData {
    pub key_id: PttID,
    pub owner_id: PttID,
    pub pubkey: [u8; 32],
    pub key_hash: [u8; 32],
    pub salt: [u8; 16],
    pub extra: KeyExtra,
    pub expire_ts: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EndOpKeyData {
    pub key_id: PttID,
    pub key_hash: [u8; 32],
    pub reason: OpKeyEndReason,
}
