//! # PTT node
//!
//! A node hosts the replicated entities of one user: the Me entity shared by
//! the user's devices, the profile, boards and friendships. Every entity is a
//! signed oplog replicated among its members; each entity runs in its own
//! worker and syncs with peers by merkle diff.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Node tunables, built from `gptt` flags |
//! | [`storage`] | KV store (redb or memory) and the key layout |
//! | [`entity`] | Entity engine, membership, persistence and worker |
//! | [`peer`] | Framed peer links, handshake and the peer manager |
//! | [`me`] | Device joins and the weighted raft over the Me entity |
//! | [`service`] | Domain objects: profile, board, friend, PTT events |
//! | [`node`] | Wiring, actions and join flows |
//! | [`rpc`] | JSON-RPC 2.0 over HTTP |
//!
//! Identifiers, oplogs, merkle and OpKeys live in `ptt-protocol`.

#![allow(clippy::too_many_arguments, clippy::type_complexity)]

pub mod config;
pub mod entity;
pub mod me;
pub mod node;
pub mod peer;
pub mod rpc;
pub mod service;
pub mod storage;

pub use config::Config;
pub use node::{Node, NodeError};

/// Version reported by `ptt_getVersion` and `gptt --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION.split('.').count(), 3);
    }
}
