//! # PTT Protocol SDK
//!
//! **Identity-rooted, signed and hash-chained operation logs.**
//!
//! This crate is the I/O-free half of the ptt stack. It defines what every
//! node must agree on bit for bit: identifiers, the oplog record and how it
//! is hashed, signed and verified, chain resolution, the merkle digest used
//! to diff two replicas, the OpKey lifecycle and the join URL. The node crate
//! (`pttnode`) adds storage, peers, workers and raft on top.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | `PttID`, `NodeID`, `Timestamp` + `Clock`, `Status` |
//! | [`crypto`] | Ed25519 signing, HKDF child keys, key-chain certificates, join-key DH |
//! | [`oplog`] | Oplog record, canonical hash, signatures, verification, chains |
//! | [`merkle`] | Time-bucketed merkle index and the diff planner |
//! | [`opkey`] | Per-entity operation keys and the key ring |
//! | [`join_url`] | Invitation URLs |
//! | [`limits`] | Size guardrails and default tunables |
//! | [`error`] | Error taxonomy shared by every layer |

#![allow(clippy::too_many_arguments, clippy::type_complexity)]

// ── Public modules ──────────────────────────────────────────────────────────

pub mod crypto;
pub mod error;
pub mod join_url;
pub mod limits;
pub mod merkle;
pub mod opkey;
pub mod oplog;
pub mod types;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use error::ErrorKind;
pub use join_url::{JoinKind, JoinUrl, JoinUrlError};
pub use merkle::{MerkleIndex, MerkleNode, SyncPlanner};
pub use opkey::{OpKey, OpKeyError, OpKeyInfo, OpKeyRing};
pub use oplog::{Category, MasterView, NewOplog, OpSigner, Oplog, OplogError, SignInfo};
pub use types::{Clock, NodeID, PttID, Status, Timestamp};

// ── Library metadata ────────────────────────────────────────────────────────

/// Protocol SDK version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
