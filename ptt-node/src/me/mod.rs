//! The Me: one user across their devices.
//!
//! Every device of a user hosts the same Me entity and runs one member of
//! the Me raft group. The raft leader is the only device that issues OpKeys
//! and co-signs master oplogs; followers stay readable and re-derive what the
//! leader signed through ordinary entity sync.
//!
//! Raft members carry a weight taken from their [`NodeType`], so a server is
//! preferred over a desktop and a desktop over a phone.

pub mod join;
pub mod raft;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ptt_protocol::crypto::JoinKeyError;
use ptt_protocol::{ErrorKind, JoinUrlError};

use crate::entity::EntityError;
use crate::node::identity::KeyError;

pub use join::{JoinKeyInfo, JoinKeyRing, JoinMeAccept, JoinMeRequest};
pub use raft::{RaftError, RaftHandle, RaftStatus};

pub const WEIGHT_MOBILE: u32 = 1;
pub const WEIGHT_DESKTOP: u32 = 2;
pub const WEIGHT_SERVER: u32 = 3;

// ─── Node type ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeType {
    #[default]
    Unknown,
    Mobile,
    Desktop,
    Server,
}

impl NodeType {
    /// Raft weight; an unknown device counts as the lightest.
    pub fn weight(&self) -> u32 {
        match self {
            NodeType::Unknown | NodeType::Mobile => WEIGHT_MOBILE,
            NodeType::Desktop => WEIGHT_DESKTOP,
            NodeType::Server => WEIGHT_SERVER,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Unknown => "unknown",
            NodeType::Mobile => "mobile",
            NodeType::Desktop => "desktop",
            NodeType::Server => "server",
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = MeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(NodeType::Unknown),
            "mobile" => Ok(NodeType::Mobile),
            "desktop" => Ok(NodeType::Desktop),
            "server" => Ok(NodeType::Server),
            other => Err(MeError::BadInput(format!("unknown node type {other}"))),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MeError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    JoinKey(#[from] JoinKeyError),

    #[error(transparent)]
    JoinUrl(#[from] JoinUrlError),

    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("myKey does not belong to this Me")]
    WrongMyKey,

    #[error("Unknown join key")]
    UnknownJoinKey,

    #[error("Join refused: {0}")]
    Refused(String),
}

impl MeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeError::Raft(e) => e.kind(),
            MeError::Entity(e) => e.kind(),
            MeError::Key(e) => e.kind(),
            MeError::JoinKey(e) => e.kind(),
            MeError::JoinUrl(e) => e.kind(),
            MeError::BadInput(_) => ErrorKind::BadInput,
            MeError::WrongMyKey | MeError::UnknownJoinKey | MeError::Refused(_) => ErrorKind::Unauthorized,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_order_device_classes() {
        assert!(NodeType::Server.weight() > NodeType::Desktop.weight());
        assert!(NodeType::Desktop.weight() > NodeType::Mobile.weight());
        assert_eq!(NodeType::Unknown.weight(), WEIGHT_MOBILE);
        assert_eq!("server".parse::<NodeType>().unwrap(), NodeType::Server);
        assert!("tablet".parse::<NodeType>().is_err());
    }
}
