/// Key-chain certificates (`keyExtra`).
///
/// A chain is a list of signed statements `parent_pub → child_pub` each
/// scoped to a purpose and valid until `not_after`. The first link is signed
/// by a master key; the last child is the key that actually signed an oplog.
/// The chain travels with every signature, so it verifies on its own even
/// after the child key was rotated away locally.
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crypto::signing::{self, SigningError};
use crate::error::ErrorKind;
use crate::types::{PttID, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyChainError {
    #[error("Bad signature on key link {0}")]
    BadSig(usize),

    #[error("Key expired at {0:?}")]
    ExpiredKey(Timestamp),

    #[error("Chain root is not a known master key")]
    UnknownMaster,

    #[error("Key link {0} does not continue the chain")]
    BrokenChain(usize),

    #[error("Key link {0} is not valid for this entity")]
    WrongPurpose(usize),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Encoding failed: {0}")]
    Encoding(String),
}

impl KeyChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyChainError::Encoding(_) => ErrorKind::BadInput,
            _ => ErrorKind::Unauthorized,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyChainError>;

/// What a certified child key may be used for.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Signing oplogs of one entity.
    OpSigning { entity_id: PttID },
    /// Signing on behalf of a device node (peer identification).
    Node,
}

impl KeyPurpose {
    /// Purpose bytes used for deterministic child derivation.
    pub fn derivation_info(&self, salt: &[u8]) -> Vec<u8> {
        let mut info = Vec::with_capacity(64);
        match self {
            KeyPurpose::OpSigning { entity_id } => {
                info.extend_from_slice(b"op-signing:");
                info.extend_from_slice(entity_id.as_bytes());
            }
            KeyPurpose::Node => info.extend_from_slice(b"node:"),
        }
        info.extend_from_slice(salt);
        info
    }

    fn allows(&self, entity_id: Option<&PttID>) -> bool {
        match (self, entity_id) {
            (KeyPurpose::OpSigning { entity_id: scoped }, Some(want)) => scoped == want,
            (KeyPurpose::OpSigning { .. }, None) => true,
            (KeyPurpose::Node, Some(_)) => false,
            (KeyPurpose::Node, None) => true,
        }
    }
}

/// One signed certificate link.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyLink {
    pub parent_pub: [u8; 32],
    pub purpose: KeyPurpose,
    pub child_pub: [u8; 32],
    pub not_after: Timestamp,
    #[serde(with = "BigArray")]
    pub sig: [u8; 64],
}

impl KeyLink {
    fn signable_bytes(
        parent_pub: &[u8; 32],
        purpose: &KeyPurpose,
        child_pub: &[u8; 32],
        not_after: &Timestamp,
    ) -> Result<Vec<u8>> {
        bincode::serialize(&(b"ptt-keylink-v1", parent_pub, purpose, child_pub, not_after))
            .map_err(|e| KeyChainError::Encoding(e.to_string()))
    }

    /// Certify `child_pub` with the parent private key.
    pub fn certify(
        parent_private: &[u8; 32],
        purpose: KeyPurpose,
        child_pub: [u8; 32],
        not_after: Timestamp,
    ) -> Result<Self> {
        let parent_pub = signing::derive_public_key(parent_private)?;
        let bytes = Self::signable_bytes(&parent_pub, &purpose, &child_pub, &not_after)?;
        let sig = signing::sign_data(&bytes, parent_private)?;
        Ok(KeyLink {
            parent_pub,
            purpose,
            child_pub,
            not_after,
            sig,
        })
    }

    pub fn verify_sig(&self) -> Result<bool> {
        let bytes =
            Self::signable_bytes(&self.parent_pub, &self.purpose, &self.child_pub, &self.not_after)?;
        Ok(signing::verify_signature(&bytes, &self.sig, &self.parent_pub)?)
    }
}

/// The `keyExtra` chain attached to a signature bundle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct KeyExtra {
    pub links: Vec<KeyLink>,
}

impl KeyExtra {
    /// Empty chain: the root key signs directly.
    pub fn direct() -> Self {
        KeyExtra { links: Vec::new() }
    }

    pub fn single(link: KeyLink) -> Self {
        KeyExtra { links: vec![link] }
    }

    pub fn is_direct(&self) -> bool {
        self.links.is_empty()
    }

    pub fn root(&self) -> Option<&[u8; 32]> {
        self.links.first().map(|l| &l.parent_pub)
    }

    pub fn leaf(&self) -> Option<&[u8; 32]> {
        self.links.last().map(|l| &l.child_pub)
    }

    /// Earliest `not_after` along the chain.
    pub fn not_after(&self) -> Option<Timestamp> {
        self.links.iter().map(|l| l.not_after).min()
    }
}

/// Walk `chain` from `root_master_pub` and return the leaf public key.
///
/// `at` is the signing time being checked: every link must still be valid at
/// `at`. `entity_id` scopes op-signing links to one entity.
pub fn verify_chain(
    chain: &KeyExtra,
    root_master_pub: &[u8; 32],
    at: Timestamp,
    entity_id: Option<&PttID>,
) -> Result<[u8; 32]> {
    let mut current = *root_master_pub;
    for (i, link) in chain.links.iter().enumerate() {
        if link.parent_pub != current {
            return Err(if i == 0 {
                KeyChainError::UnknownMaster
            } else {
                KeyChainError::BrokenChain(i)
            });
        }
        if !link.verify_sig()? {
            return Err(KeyChainError::BadSig(i));
        }
        if !link.purpose.allows(entity_id) {
            return Err(KeyChainError::WrongPurpose(i));
        }
        if at > link.not_after {
            return Err(KeyChainError::ExpiredKey(link.not_after));
        }
        current = link.child_pub;
    }
    Ok(current)
}
