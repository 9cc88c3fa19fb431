/// Error taxonomy shared by every layer.
///
/// Concrete error enums stay per module; each one maps itself onto a kind so
/// the RPC façade and the peer layer can decide what to surface and what to
/// penalise without matching on foreign variants.
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed id, bad encoding, unknown method, out-of-range parameter.
    BadInput,
    /// Entity, object or oplog unknown locally.
    NotFound,
    /// Missing OpKey, not a master, not the raft leader, expired key.
    Unauthorized,
    /// Irreconcilable chain contradiction.
    Conflict,
    /// Peer drop or timeout; retried on the next sync tick.
    Transient,
    /// Stored data fails its own hash.
    Corruption,
    /// Me raft group has no leader.
    NoLeader,
    /// Data dir or identity key unusable.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadInput => "bad input",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Corruption => "corruption",
            ErrorKind::NoLeader => "no leader",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// JSON-RPC error code for this kind.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ErrorKind::BadInput => -32602,
            ErrorKind::NotFound => -32004,
            ErrorKind::Unauthorized => -32003,
            ErrorKind::Conflict => -32009,
            ErrorKind::Transient => -32010,
            ErrorKind::Corruption => -32011,
            ErrorKind::NoLeader => -32012,
            ErrorKind::Fatal => -32603,
        }
    }

    /// Errors of these kinds count against the sending peer's reputation.
    pub fn penalises_peer(&self) -> bool {
        matches!(
            self,
            ErrorKind::BadInput | ErrorKind::Unauthorized | ErrorKind::Corruption
        )
    }
}
