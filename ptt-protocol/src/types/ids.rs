/// Identity types shared by every entity, object and oplog.
///
/// - `PttID`: 32-byte identifier `[addr(16) | postfix(16)]`. The address half is
///   derived from the owning user's master public key, the postfix half tells
///   objects of the same user apart.
/// - `NodeID`: the Ed25519 public key of a device node key.
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::ErrorKind;

/// Bytes in an address half.
pub const ADDR_LEN: usize = 16;
/// Bytes in a full identifier.
pub const ID_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid base58 id: {0}")]
    InvalidBase58(String),

    #[error("Invalid id length: {0}")]
    InvalidLength(usize),
}

impl IdError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BadInput
    }
}

fn decode_base58_32(s: &str) -> Result<[u8; 32], IdError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| IdError::InvalidBase58(e.to_string()))?;
    if bytes.len() != ID_LEN {
        return Err(IdError::InvalidLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// PttID
// ---------------------------------------------------------------------------

/// Identifier of a user, entity, object or oplog.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PttID(pub [u8; 32]);

impl PttID {
    /// The all-zero id addresses the peer-management channel.
    pub const ZERO: PttID = PttID([0u8; 32]);

    /// Address half derived from a master public key, BLAKE3(pubkey)[0..16].
    pub fn addr_of(pubkey: &[u8; 32]) -> [u8; ADDR_LEN] {
        let hash = blake3::hash(pubkey);
        let mut addr = [0u8; ADDR_LEN];
        addr.copy_from_slice(&hash.as_bytes()[..ADDR_LEN]);
        addr
    }

    /// Stable user id of a master public key.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ptt-user");
        hasher.update(pubkey);
        let mut postfix = [0u8; ADDR_LEN];
        postfix.copy_from_slice(&hasher.finalize().as_bytes()[..ADDR_LEN]);
        Self::from_parts(Self::addr_of(pubkey), postfix)
    }

    /// Join an address half and a postfix half.
    pub fn from_parts(addr: [u8; ADDR_LEN], postfix: [u8; ADDR_LEN]) -> Self {
        let mut id = [0u8; ID_LEN];
        id[..ADDR_LEN].copy_from_slice(&addr);
        id[ADDR_LEN..].copy_from_slice(&postfix);
        PttID(id)
    }

    /// A fresh id under the same user address as `owner`.
    pub fn new_under(owner: &PttID) -> Self {
        let mut postfix = [0u8; ADDR_LEN];
        rand::thread_rng().fill_bytes(&mut postfix);
        Self::from_parts(owner.addr(), postfix)
    }

    /// A fully random id (tests, ephemeral objects).
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        PttID(id)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PttID(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != ID_LEN {
            return Err(IdError::InvalidLength(bytes.len()));
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(PttID(id))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn addr(&self) -> [u8; ADDR_LEN] {
        let mut addr = [0u8; ADDR_LEN];
        addr.copy_from_slice(&self.0[..ADDR_LEN]);
        addr
    }

    pub fn postfix(&self) -> [u8; ADDR_LEN] {
        let mut postfix = [0u8; ADDR_LEN];
        postfix.copy_from_slice(&self.0[ADDR_LEN..]);
        postfix
    }

    /// True when both ids live under the same user address.
    pub fn same_addr(&self, other: &PttID) -> bool {
        self.0[..ADDR_LEN] == other.0[..ADDR_LEN]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }

    /// Text form used on the wire and in RPC.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, IdError> {
        decode_base58_32(s).map(PttID)
    }

    /// First characters of the text form, for logs.
    pub fn short(&self) -> String {
        let s = self.to_base58();
        s.chars().take(8).collect()
    }
}

impl FromStr for PttID {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl fmt::Debug for PttID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PttID({})", self.short())
    }
}

impl fmt::Display for PttID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl Serialize for PttID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base58())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PttID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PttID::from_base58(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(PttID)
        }
    }
}

// ---------------------------------------------------------------------------
// NodeID
// ---------------------------------------------------------------------------

/// Device identity: the Ed25519 public key of the node key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeID(pub [u8; 32]);

impl NodeID {
    pub fn from_pubkey(pubkey: [u8; 32]) -> Self {
        NodeID(pubkey)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Raft member id of this node: BLAKE3(node_id)[0..8], never zero.
    pub fn raft_id(&self) -> u64 {
        let hash = blake3::hash(&self.0);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&hash.as_bytes()[..8]);
        let id = u64::from_be_bytes(buf);
        if id == 0 {
            1
        } else {
            id
        }
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, IdError> {
        decode_base58_32(s).map(NodeID)
    }

    pub fn short(&self) -> String {
        let s = self.to_base58();
        s.chars().take(8).collect()
    }
}

impl FromStr for NodeID {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self.short())
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl Serialize for NodeID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base58())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NodeID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            NodeID::from_base58(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(NodeID)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_from_pubkey() {
        let pubkey = [42u8; 32];
        let id = PttID::from_pubkey(&pubkey);
        assert_eq!(id, PttID::from_pubkey(&pubkey));
        assert_eq!(id.addr(), PttID::addr_of(&pubkey));
        assert_ne!(id, PttID::from_pubkey(&[43u8; 32]));
    }

    #[test]
    fn test_new_under_keeps_addr() {
        let user = PttID::from_pubkey(&[1u8; 32]);
        let a = PttID::new_under(&user);
        let b = PttID::new_under(&user);
        assert!(a.same_addr(&user));
        assert!(b.same_addr(&user));
        assert_ne!(a, b);
        assert_ne!(a.postfix(), user.postfix());
    }

    #[test]
    fn test_base58_text_form() {
        let id = PttID::random();
        let text = id.to_string();
        let parsed: PttID = text.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(matches!(
            "0OIl".parse::<PttID>(),
            Err(IdError::InvalidBase58(_))
        ));
        let short = bs58::encode([1u8; 8]).into_string();
        assert_eq!(short.parse::<PttID>(), Err(IdError::InvalidLength(8)));
    }

    #[test]
    fn test_json_uses_text_form_and_bincode_uses_bytes() {
        let id = PttID::from_bytes([7u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base58()));
        let back: PttID = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bytes.len(), 32);
        let back: PttID = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_zero_id() {
        assert!(PttID::ZERO.is_zero());
        assert!(!PttID::random().is_zero());
    }

    #[test]
    fn test_raft_id_stable_and_nonzero() {
        let node = NodeID::from_pubkey([9u8; 32]);
        assert_eq!(node.raft_id(), node.raft_id());
        assert_ne!(node.raft_id(), 0);
        assert_ne!(node.raft_id(), NodeID::from_pubkey([10u8; 32]).raft_id());
    }
}
