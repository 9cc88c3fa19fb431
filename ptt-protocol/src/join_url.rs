/// Join URLs.
///
/// `ptt://{kind}/{base58(bincode(JoinUrl))}`. The URL names the entity to
/// join, the inviting node, the public half of the inviter's current join
/// key with its hash, and a signalling hint (`host:port`) where the inviting
/// node accepts peer links.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::crypto::join_key_hash;
use crate::error::ErrorKind;
use crate::types::{NodeID, PttID, Timestamp};

const SCHEME: &str = "ptt://";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinUrlError {
    #[error("Not a join url")]
    InvalidScheme,

    #[error("Unknown join kind: {0}")]
    InvalidKind(String),

    #[error("Malformed join url: {0}")]
    Malformed(String),

    #[error("Join url kind {url} does not match {want}")]
    KindMismatch { url: &'static str, want: &'static str },

    #[error("Join key hash does not match the published key")]
    HashMismatch,

    #[error("Join url expired")]
    Expired,
}

impl JoinUrlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JoinUrlError::Expired => ErrorKind::Unauthorized,
            _ => ErrorKind::BadInput,
        }
    }
}

pub type Result<T> = std::result::Result<T, JoinUrlError>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Me,
    Friend,
    Board,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Me => "me",
            JoinKind::Friend => "friend",
            JoinKind::Board => "board",
        }
    }
}

impl FromStr for JoinKind {
    type Err = JoinUrlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "me" => Ok(JoinKind::Me),
            "friend" => Ok(JoinKind::Friend),
            "board" => Ok(JoinKind::Board),
            other => Err(JoinUrlError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JoinUrl {
    pub kind: JoinKind,
    pub entity_id: PttID,
    /// The inviter's user id (friend joins address the person, not an entity).
    pub inviter_id: PttID,
    pub inviter_pub: [u8; 32],
    pub node_id: NodeID,
    pub join_key_pub: [u8; 32],
    pub join_key_hash: [u8; 32],
    pub signalling_addr: String,
    /// Display name carried for the joiner's UI.
    pub name: String,
    pub expire_ts: Timestamp,
}

impl JoinUrl {
    /// Encode to the `ptt://` text form.
    pub fn encode(&self) -> Result<String> {
        let bytes =
            bincode::serialize(self).map_err(|e| JoinUrlError::Malformed(e.to_string()))?;
        Ok(format!(
            "{}{}/{}",
            SCHEME,
            self.kind.as_str(),
            bs58::encode(bytes).into_string()
        ))
    }

    /// Decode and check the embedded key hash.
    pub fn decode(text: &str) -> Result<Self> {
        let rest = text
            .trim()
            .strip_prefix(SCHEME)
            .ok_or(JoinUrlError::InvalidScheme)?;
        let (kind, body) = rest
            .split_once('/')
            .ok_or_else(|| JoinUrlError::Malformed("missing payload".into()))?;
        let kind: JoinKind = kind.parse()?;
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| JoinUrlError::Malformed(e.to_string()))?;
        let url: JoinUrl =
            bincode::deserialize(&bytes).map_err(|e| JoinUrlError::Malformed(e.to_string()))?;
        if url.kind != kind {
            return Err(JoinUrlError::KindMismatch {
                url: url.kind.as_str(),
                want: kind.as_str(),
            });
        }
        if join_key_hash(&url.join_key_pub) != url.join_key_hash {
            return Err(JoinUrlError::HashMismatch);
        }
        if PttID::from_pubkey(&url.inviter_pub) != url.inviter_id {
            return Err(JoinUrlError::Malformed("inviter key does not match its id".into()));
        }
        Ok(url)
    }

    /// Decode and require a specific kind that has not expired.
    pub fn decode_for(text: &str, want: JoinKind, now: Timestamp) -> Result<Self> {
        let url = Self::decode(text)?;
        if url.kind != want {
            return Err(JoinUrlError::KindMismatch {
                url: url.kind.as_str(),
                want: want.as_str(),
            });
        }
        if now > url.expire_ts {
            return Err(JoinUrlError::Expired);
        }
        Ok(url)
    }
}

impl fmt::Display for JoinUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}
