//! Entity core.
//!
//! An entity is a replicated state machine with its own oplogs, masters,
//! members, OpKeys and peers. All mutation of one entity happens on its
//! worker task ([`worker`]); the synchronous state machine the worker drives
//! is the [`engine::EntityEngine`].

pub mod engine;
pub mod membership;
pub mod reputation;
pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ptt_protocol::oplog::Category;
use ptt_protocol::{ErrorKind, OpKeyError, OplogError, PttID, Status, Timestamp};

use crate::service::ServiceError;
use crate::storage::StorageError;

pub use engine::{EntityEngine, ReceiveOutcome};
pub use membership::{MasterInfo, MemberInfo, Membership};
pub use worker::{EntityEvent, EntityHandle};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    OpKey(#[from] OpKeyError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Entity {0} not found")]
    NotFound(String),

    #[error("Not a master of this entity")]
    NotMaster,

    #[error("Not a member of this entity")]
    NotMember,

    #[error("Cannot remove the last master")]
    LastMaster,

    #[error("Entity is {0} and no longer accepts writes")]
    Closed(&'static str),

    #[error("Entity worker is unhealthy: {0}")]
    Unhealthy(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Entity worker is gone")]
    WorkerGone,

    #[error("Invalid operation: {0}")]
    InvalidOp(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Predecessor {0} not stored yet")]
    MissingParent(PttID),

    #[error("No OpKey for this entity and this device is not the Me leader")]
    NoAuthority,
}

impl EntityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EntityError::Oplog(e) => e.kind(),
            EntityError::Storage(e) => e.kind(),
            EntityError::OpKey(e) => e.kind(),
            EntityError::Service(e) => e.kind(),
            EntityError::NotFound(_) => ErrorKind::NotFound,
            EntityError::NotMaster | EntityError::NotMember | EntityError::Closed(_) => {
                ErrorKind::Unauthorized
            }
            EntityError::LastMaster | EntityError::Conflict(_) => ErrorKind::Conflict,
            EntityError::Unhealthy(_) => ErrorKind::Fatal,
            EntityError::DeadlineExceeded | EntityError::WorkerGone | EntityError::MissingParent(_) => {
                ErrorKind::Transient
            }
            EntityError::InvalidOp(_) => ErrorKind::BadInput,
            EntityError::NoAuthority => ErrorKind::NoLeader,
        }
    }
}

pub type Result<T> = std::result::Result<T, EntityError>;

// ---------------------------------------------------------------------------
// Entity types and record
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntityType {
    Me = 1,
    Profile = 2,
    Board = 3,
    Friend = 4,
}

impl EntityType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EntityType::Me),
            2 => Some(EntityType::Profile),
            3 => Some(EntityType::Board),
            4 => Some(EntityType::Friend),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Me => "me",
            EntityType::Profile => "profile",
            EntityType::Board => "board",
            EntityType::Friend => "friend",
        }
    }

    /// Categories holding this type's domain objects.
    pub fn domain_categories(&self) -> &'static [Category] {
        match self {
            EntityType::Me => &[Category::Me, Category::Ptt],
            EntityType::Profile => &[Category::User],
            EntityType::Board => &[Category::Board],
            EntityType::Friend => &[Category::Friend],
        }
    }

    /// Every category of this type, membership first.
    pub fn categories(&self) -> Vec<Category> {
        let mut all = vec![Category::Master, Category::Member, Category::OpKey];
        all.extend_from_slice(self.domain_categories());
        all
    }
}

/// Persisted `{entityID}/meta`, derived from the master chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct EntityRecord {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "T")]
    pub entity_type: EntityType,
    pub status: Status,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    #[serde(rename = "UpdaterID")]
    pub updater_id: PttID,
    #[serde(rename = "LogID")]
    pub log_id: PttID,
    #[serde(rename = "OwnerIDs")]
    pub owner_ids: Vec<PttID>,
    #[serde(rename = "MergedInto")]
    pub merged_into: Option<PttID>,
    /// Type-specific creation payload.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub body: Vec<u8>,
}

impl EntityRecord {
    pub fn pending(id: PttID, entity_type: EntityType) -> Self {
        EntityRecord {
            id,
            entity_type,
            status: Status::Pending,
            create_ts: Timestamp::ZERO,
            update_ts: Timestamp::ZERO,
            creator_id: PttID::ZERO,
            updater_id: PttID::ZERO,
            log_id: PttID::ZERO,
            owner_ids: Vec::new(),
            merged_into: None,
            body: Vec::new(),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.status == Status::Alive
    }
}

/// Worker health as surfaced to callers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_membership_first() {
        let cats = EntityType::Board.categories();
        assert_eq!(&cats[..3], &[Category::Master, Category::Member, Category::OpKey]);
        assert_eq!(cats[3], Category::Board);
        assert_eq!(EntityType::Me.domain_categories(), &[Category::Me, Category::Ptt]);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(EntityError::LastMaster.kind(), ErrorKind::Conflict);
        assert_eq!(EntityError::NotMaster.kind(), ErrorKind::Unauthorized);
        assert_eq!(EntityError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert!(!EntityError::MissingParent(PttID::ZERO).kind().penalises_peer());
        assert_eq!(
            EntityError::Oplog(OplogError::HashMismatch(PttID::ZERO)).kind(),
            ErrorKind::Corruption
        );
    }
}
