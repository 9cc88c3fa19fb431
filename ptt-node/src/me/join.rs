/// Join keys and the payloads of the join-me handshake.
///
/// Every join URL this node shows carries the public half of its current
/// join key. Keys renew once per period; the previous key stays accepted for
/// one more period so a URL shown just before a renewal still works.
///
/// Adding a device to a Me takes the inviter's `myKey`. The joiner never
/// sends it: it signs the join key hash and its node id with it, and the
/// inviter checks that signature against its own user key.
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use zeroize::{Zeroize, ZeroizeOnDrop};

use ptt_protocol::crypto::{sign_data, verify_signature, JoinKey};
use ptt_protocol::{NodeID, Oplog, PttID, Timestamp};

use super::{MeError, NodeType, Result};
use crate::entity::EntityType;
use crate::node::identity::{KeyError, UserKey};
use crate::storage::{self, keys, KvStore};

const PROOF_CONTEXT: &[u8] = b"ptt-join-me-v1";

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredJoinKey {
    secret: [u8; 32],
    create_ts: i64,
    expire_ts: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JoinKeyInfo {
    pub hash: String,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "ExpireTS")]
    pub expire_ts: Timestamp,
}

/// Current and previous join key of this node.
pub struct JoinKeyRing {
    kv: Arc<dyn KvStore>,
    renew_secs: i64,
    /// Newest last.
    keys: Mutex<Vec<JoinKey>>,
}

impl JoinKeyRing {
    pub fn load(kv: Arc<dyn KvStore>, renew_secs: i64) -> Result<Self> {
        let stored: Vec<StoredJoinKey> = storage::load(kv.as_ref(), keys::NODE_JOIN_KEYS)
            .map_err(KeyError::from)?
            .unwrap_or_default();
        let keys = stored
            .iter()
            .map(|k| JoinKey::from_secret(k.secret, Timestamp::from_seconds(k.create_ts), Timestamp::from_seconds(k.expire_ts)))
            .collect();
        Ok(JoinKeyRing {
            kv,
            renew_secs: renew_secs.max(1),
            keys: Mutex::new(keys),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinKey>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, keys: &[JoinKey]) -> Result<()> {
        let stored: Vec<StoredJoinKey> = keys
            .iter()
            .map(|k| StoredJoinKey {
                secret: *k.secret(),
                create_ts: k.create_ts.ts,
                expire_ts: k.expire_ts.ts,
            })
            .collect();
        storage::save(self.kv.as_ref(), keys::NODE_JOIN_KEYS, &stored).map_err(KeyError::from)?;
        Ok(())
    }

    /// Key to put in a new URL, renewing first when the period is over.
    pub fn current(&self, now: Timestamp) -> Result<JoinKey> {
        let mut keys = self.lock();
        let fresh = keys
            .last()
            .map(|k| now < k.create_ts.plus_seconds(self.renew_secs))
            .unwrap_or(false);
        if !fresh {
            // valid through the period after the next renewal
            keys.push(JoinKey::generate(now, 2 * self.renew_secs));
            keys.retain(|k| !k.is_expired(now));
            let excess = keys.len().saturating_sub(2);
            keys.drain(..excess);
            self.persist(&keys)?;
            log::info!("JoinKeyRing: renewed join key at {}", now.ts);
        }
        keys.last().cloned().ok_or(MeError::UnknownJoinKey)
    }

    /// Look up an unexpired key by hash.
    pub fn find(&self, hash: &[u8; 32], now: Timestamp) -> Option<JoinKey> {
        self.lock()
            .iter()
            .find(|k| &k.hash == hash && !k.is_expired(now))
            .cloned()
    }

    pub fn infos(&self) -> Vec<JoinKeyInfo> {
        self.lock()
            .iter()
            .map(|k| JoinKeyInfo {
                hash: hex::encode(k.hash),
                create_ts: k.create_ts,
                expire_ts: k.expire_ts,
            })
            .collect()
    }
}

// ─── Join-me payloads ────────────────────────────────────────────────────────

fn proof_message(join_key_hash: &[u8; 32], node_id: &NodeID) -> Vec<u8> {
    let mut msg = PROOF_CONTEXT.to_vec();
    msg.extend_from_slice(join_key_hash);
    msg.extend_from_slice(node_id.as_bytes());
    msg
}

/// Sealed inside a `JoinRequest` of kind Me.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JoinMeRequest {
    pub node_id: NodeID,
    pub node_type: NodeType,
    pub name: String,
    /// Public half of the presented `myKey`.
    pub user_pub: [u8; 32],
    pub proof: Vec<u8>,
}

impl JoinMeRequest {
    pub fn new(
        my_key: &UserKey,
        join_key_hash: &[u8; 32],
        node_id: NodeID,
        node_type: NodeType,
        name: String,
    ) -> Result<Self> {
        let sig = sign_data(&proof_message(join_key_hash, &node_id), my_key.private()).map_err(KeyError::from)?;
        Ok(JoinMeRequest {
            node_id,
            node_type,
            name,
            user_pub: my_key.pubkey,
            proof: sig.to_vec(),
        })
    }

    /// Check the request was made with the `myKey` of `user_id`.
    pub fn verify(&self, user_id: &PttID, join_key_hash: &[u8; 32]) -> Result<()> {
        if PttID::from_pubkey(&self.user_pub) != *user_id {
            return Err(MeError::WrongMyKey);
        }
        let valid = verify_signature(&proof_message(join_key_hash, &self.node_id), &self.proof, &self.user_pub)
            .map_err(KeyError::from)?;
        if !valid {
            return Err(MeError::WrongMyKey);
        }
        Ok(())
    }
}

/// Full oplog set of one entity, handed to a joiner.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EntityBundle {
    pub entity_id: PttID,
    pub entity_type: EntityType,
    pub oplogs: Vec<Oplog>,
}

/// Inviter's answer once the joiner is a master of the Me and a raft voter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JoinMeAccept {
    pub me_id: PttID,
    /// The Me first, then its profile and personal board.
    pub bundles: Vec<EntityBundle>,
    /// Raft address book: every member device and its listen address.
    pub peers: Vec<(NodeID, Option<String>)>,
}
