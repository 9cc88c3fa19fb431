//! Peer links.
//!
//! One TCP link per remote node, authenticated by a signed `Hello` exchange
//! over the node keys. Each link has a reader task that routes inbound frames
//! to the node dispatcher and a writer task draining its [`SendQueue`].
//! The [`PeerManager`] owns every link; entity workers reach a peer only by
//! pushing into its queue through a [`LinkHandle`].

pub mod frame;
pub mod link;
pub mod manager;
pub mod message;
pub mod queue;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ptt_protocol::{ErrorKind, NodeID, PttID};

pub use frame::{Frame, FrameCodec};
pub use manager::{PeerEvent, PeerManager, PeerSettings};
pub use message::Message;
pub use queue::{Pushed, SendQueue};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed")]
    Closed,

    #[error("Peer {0} is not connected")]
    NotConnected(String),

    #[error("Connecting to ourselves")]
    SelfConnect,
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Malformed(_) | PeerError::UnknownType(_) => ErrorKind::BadInput,
            PeerError::Handshake(_) => ErrorKind::Unauthorized,
            PeerError::SelfConnect => ErrorKind::BadInput,
            PeerError::NotConnected(_) => ErrorKind::NotFound,
            PeerError::Io(_) | PeerError::HandshakeTimeout | PeerError::Closed => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

/// How a peer is known to us.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerClass {
    /// Identified member of at least one of our entities.
    Member,
    /// Authenticated link, not on any shared entity.
    Identified,
    /// Dialed on purpose (join url, stored dial target).
    Explicit,
    /// Learned from an address book.
    Random,
}

impl PeerClass {
    pub fn letter(&self) -> &'static str {
        match self {
            PeerClass::Member => "M",
            PeerClass::Identified => "I",
            PeerClass::Explicit => "E",
            PeerClass::Random => "R",
        }
    }
}

/// `{M, I, E, R}` counter.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCounts {
    #[serde(rename = "M")]
    pub member: usize,
    #[serde(rename = "I")]
    pub identified: usize,
    #[serde(rename = "E")]
    pub explicit: usize,
    #[serde(rename = "R")]
    pub random: usize,
}

impl PeerCounts {
    pub fn add(&mut self, class: PeerClass) {
        match class {
            PeerClass::Member => self.member += 1,
            PeerClass::Identified => self.identified += 1,
            PeerClass::Explicit => self.explicit += 1,
            PeerClass::Random => self.random += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.member + self.identified + self.explicit + self.random
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    #[serde(rename = "NodeID")]
    pub node_id: NodeID,
    /// Member id the peer identified as, on entity-scoped listings.
    #[serde(rename = "UserID")]
    pub user_id: Option<PttID>,
    pub addr: Option<String>,
    #[serde(rename = "PeerType")]
    pub class: PeerClass,
    pub connected: bool,
}

// ---------------------------------------------------------------------------
// Link handle
// ---------------------------------------------------------------------------

/// Sending side of one link, cloned into every entity worker that uses it.
#[derive(Clone)]
pub struct LinkHandle {
    pub node_id: NodeID,
    pub addr: SocketAddr,
    queue: Arc<SendQueue>,
}

impl LinkHandle {
    pub fn new(node_id: NodeID, addr: SocketAddr, queue: Arc<SendQueue>) -> Self {
        LinkHandle { node_id, addr, queue }
    }

    pub fn send(&self, entity_id: PttID, message: &Message) -> Pushed {
        match message.to_frame(entity_id) {
            Ok(frame) => self.queue.push(frame),
            Err(e) => {
                log::warn!("LinkHandle {}: cannot encode {:?}: {}", self.node_id.short(), message.msg_type(), e);
                Pushed::DroppedNew
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("node_id", &self.node_id)
            .field("addr", &self.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_serialize_as_letters() {
        let mut counts = PeerCounts::default();
        counts.add(PeerClass::Member);
        counts.add(PeerClass::Member);
        counts.add(PeerClass::Random);
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json, serde_json::json!({"M": 2, "I": 0, "E": 0, "R": 1}));
        assert_eq!(counts.total(), 3);
    }
}
