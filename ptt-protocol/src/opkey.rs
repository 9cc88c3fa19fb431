/// Per-entity operation keys.
///
/// An OpKey is derived deterministically from the owner's master key and a
/// random salt, so every device holding the master key can re-derive the
/// private half from the replicated `CreateOpKey` oplog. Its authority is a
/// single [`KeyLink`] from the master key scoped to the entity and valid
/// until `expire_ts`.
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crypto::{self, KeyChainError, KeyExtra, KeyLink, KeyPurpose, SigningError};
use crate::error::ErrorKind;
use crate::oplog::{CreateOpKeyData, OpSigner, OplogError};
use crate::types::{PttID, Status, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpKeyError {
    #[error("No alive op key for this entity")]
    NoAliveKey,

    #[error("Op key {0} not found")]
    NotFound(String),

    #[error("Op key expired")]
    Expired,

    #[error("Op key private half is not held by this node")]
    NoPrivateKey,

    #[error("Master key does not match the op key certificate")]
    WrongMaster,

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    KeyChain(#[from] KeyChainError),

    #[error(transparent)]
    Oplog(#[from] OplogError),
}

impl OpKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpKeyError::NotFound(_) => ErrorKind::NotFound,
            OpKeyError::Signing(e) => e.kind(),
            OpKeyError::KeyChain(e) => e.kind(),
            OpKeyError::Oplog(e) => e.kind(),
            _ => ErrorKind::Unauthorized,
        }
    }
}

pub type Result<T> = std::result::Result<T, OpKeyError>;

/// One operation key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpKey {
    pub id: PttID,
    pub entity_id: PttID,
    /// User id whose master key certified this key.
    pub owner_id: PttID,
    pub hash: [u8; 32],
    pub salt: [u8; 16],
    pub pubkey: [u8; 32],
    #[serde(skip)]
    private: Option<[u8; 32]>,
    pub extra: KeyExtra,
    pub create_ts: Timestamp,
    pub expire_ts: Timestamp,
    pub status: Status,
    /// The `CreateOpKey` oplog that introduced it.
    pub log_id: Option<PttID>,
}

impl std::fmt::Debug for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpKey")
            .field("id", &self.id)
            .field("entity_id", &self.entity_id)
            .field("hash", &hex::encode(&self.hash[..6]))
            .field("expire_ts", &self.expire_ts)
            .field("status", &self.status)
            .field("has_private", &self.private.is_some())
            .finish()
    }
}

fn derive(
    master_private: &[u8; 32],
    entity_id: PttID,
    salt: &[u8; 16],
) -> Result<(KeyPurpose, [u8; 32], [u8; 32])> {
    let purpose = KeyPurpose::OpSigning { entity_id };
    let (pubkey, private) = crypto::derive_child(master_private, &purpose.derivation_info(salt))?;
    Ok((purpose, pubkey, private))
}

impl OpKey {
    /// Issue a fresh key (`IssueOpKey`).
    pub fn issue(
        entity_id: PttID,
        owner_id: PttID,
        master_private: &[u8; 32],
        lifetime_secs: i64,
        now: Timestamp,
    ) -> Result<Self> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let (purpose, pubkey, private) = derive(master_private, entity_id, &salt)?;
        let expire_ts = now.plus_seconds(lifetime_secs);
        let link = KeyLink::certify(master_private, purpose, pubkey, expire_ts)?;
        Ok(OpKey {
            id: PttID::new_under(&owner_id),
            entity_id,
            owner_id,
            hash: crypto::key_hash(&pubkey),
            salt,
            pubkey,
            private: Some(private),
            extra: KeyExtra::single(link),
            create_ts: now,
            expire_ts,
            status: Status::Alive,
            log_id: None,
        })
    }

    /// Rebuild a key from its replicated oplog payload.
    ///
    /// With the owner's master key the private half is re-derived and checked
    /// against the published pubkey.
    pub fn from_oplog(
        entity_id: PttID,
        data: &CreateOpKeyData,
        log_id: PttID,
        create_ts: Timestamp,
        master_private: Option<&[u8; 32]>,
    ) -> Result<Self> {
        let private = match master_private {
            Some(master) => {
                let (_, pubkey, private) = derive(master, entity_id, &data.salt)?;
                if pubkey != data.pubkey {
                    return Err(OpKeyError::WrongMaster);
                }
                Some(private)
            }
            None => None,
        };
        Ok(OpKey {
            id: data.key_id,
            entity_id,
            owner_id: data.owner_id,
            hash: data.key_hash,
            salt: data.salt,
            pubkey: data.pubkey,
            private,
            extra: data.extra.clone(),
            create_ts,
            expire_ts: data.expire_ts,
            status: Status::Alive,
            log_id: Some(log_id),
        })
    }

    pub fn to_create_data(&self) -> CreateOpKeyData {
        CreateOpKeyData {
            key_id: self.id,
            owner_id: self.owner_id,
            pubkey: self.pubkey,
            key_hash: self.hash,
            salt: self.salt,
            extra: self.extra.clone(),
            expire_ts: self.expire_ts,
        }
    }

    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expire_ts
    }

    pub fn needs_renewal(&self, now: Timestamp, renew_secs: i64) -> bool {
        now > self.expire_ts.minus_seconds(renew_secs)
    }

    /// Check the certificate against the owner's master pubkey at `at`.
    pub fn verify_extra(&self, master_pub: &[u8; 32], at: Timestamp) -> Result<()> {
        let leaf = crypto::verify_chain(&self.extra, master_pub, at, Some(&self.entity_id))?;
        if leaf != self.pubkey {
            return Err(OpKeyError::WrongMaster);
        }
        Ok(())
    }

    /// Signer for new oplogs; fails once expired or without the private half.
    pub fn signer(&self, now: Timestamp) -> Result<OpSigner> {
        if self.status != Status::Alive || self.is_expired(now) {
            return Err(OpKeyError::Expired);
        }
        let private = self.private.ok_or(OpKeyError::NoPrivateKey)?;
        Ok(OpSigner::delegated(self.owner_id, private, self.extra.clone())?)
    }

    pub fn info(&self) -> OpKeyInfo {
        OpKeyInfo {
            id: self.id,
            entity_id: self.entity_id,
            doer_id: self.owner_id,
            hash: hex::encode(self.hash),
            log_id: self.log_id,
            create_ts: self.create_ts,
            expire_ts: self.expire_ts,
            status: self.status,
        }
    }
}

impl Drop for OpKey {
    fn drop(&mut self) {
        if let Some(private) = self.private.as_mut() {
            zeroize::Zeroize::zeroize(private);
        }
    }
}

/// Public view returned by `getOpKeyInfos`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct OpKeyInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "EntityID")]
    pub entity_id: PttID,
    #[serde(rename = "DoerID")]
    pub doer_id: PttID,
    pub hash: String,
    #[serde(rename = "LogID")]
    pub log_id: Option<PttID>,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "ExpireTS")]
    pub expire_ts: Timestamp,
    pub status: Status,
}

/// Alive keys by hash plus retained history.
///
/// Expiry is lazy: every lookup first sweeps keys whose `expire_ts` passed.
/// At most one key per owner is alive; a newer key retires the older one.
#[derive(Debug, Default, Clone)]
pub struct OpKeyRing {
    alive: BTreeMap<[u8; 32], OpKey>,
    history: BTreeMap<[u8; 32], OpKey>,
}

impl OpKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Returns the key it displaced, if any.
    pub fn insert(&mut self, mut key: OpKey) -> Option<OpKey> {
        if self.alive.contains_key(&key.hash) || self.history.contains_key(&key.hash) {
            return None;
        }
        let current = self
            .alive
            .values()
            .find(|k| k.owner_id == key.owner_id)
            .map(|k| (k.hash, k.create_ts, k.id));

        match current {
            Some((_, create_ts, id)) if (create_ts, id) > (key.create_ts, key.id) => {
                key.status = Status::Deleted;
                self.history.insert(key.hash, key);
                None
            }
            Some((hash, _, _)) => {
                self.alive.insert(key.hash, key);
                let mut old = self.alive.remove(&hash)?;
                old.status = Status::Deleted;
                self.history.insert(hash, old.clone());
                Some(old)
            }
            None => {
                self.alive.insert(key.hash, key);
                None
            }
        }
    }

    /// Move expired keys to history; returns them.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<OpKey> {
        let expired: Vec<[u8; 32]> = self
            .alive
            .values()
            .filter(|k| k.is_expired(now))
            .map(|k| k.hash)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for hash in expired {
            if let Some(mut key) = self.alive.remove(&hash) {
                log::info!(
                    "OpKeyRing: key {} of {} expired",
                    &hex::encode(hash)[..8],
                    key.entity_id.short()
                );
                key.status = Status::Deleted;
                self.history.insert(hash, key.clone());
                out.push(key);
            }
        }
        out
    }

    /// Retire a key explicitly.
    pub fn revoke(&mut self, hash: &[u8; 32]) -> Result<OpKey> {
        let mut key = self
            .alive
            .remove(hash)
            .ok_or_else(|| OpKeyError::NotFound(hex::encode(hash)))?;
        key.status = Status::Deleted;
        self.history.insert(*hash, key.clone());
        Ok(key)
    }

    /// Mark a key deleted from a replicated `DeleteOpKey` / `RevokeOpKey`.
    pub fn mark_deleted(&mut self, hash: &[u8; 32]) -> bool {
        if let Some(mut key) = self.alive.remove(hash) {
            key.status = Status::Deleted;
            self.history.insert(*hash, key);
            return true;
        }
        false
    }

    pub fn get(&mut self, hash: &[u8; 32], now: Timestamp) -> Option<&OpKey> {
        self.sweep(now);
        self.alive.get(hash)
    }

    /// The key this node signs with for `owner_id`.
    pub fn signing_key(&mut self, owner_id: &PttID, now: Timestamp) -> Option<&OpKey> {
        self.sweep(now);
        self.alive
            .values()
            .find(|k| k.owner_id == *owner_id && k.has_private())
    }

    pub fn alive(&mut self, now: Timestamp) -> Vec<OpKey> {
        self.sweep(now);
        self.alive.values().cloned().collect()
    }

    /// Alive keys without sweeping (read-only snapshot).
    pub fn alive_snapshot(&self) -> Vec<&OpKey> {
        self.alive.values().collect()
    }

    /// Alive and retired keys.
    pub fn all(&self) -> Vec<&OpKey> {
        self.alive.values().chain(self.history.values()).collect()
    }

    pub fn len_alive(&self) -> usize {
        self.alive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn owner() -> ([u8; 32], [u8; 32], PttID) {
        let (pubkey, private) = generate_keypair();
        (pubkey, private, PttID::from_pubkey(&pubkey))
    }

    #[test]
    fn test_issue_and_rederive() {
        let (master_pub, master_priv, owner_id) = owner();
        let entity = PttID::new_under(&owner_id);
        let key = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(10))
            .unwrap();
        key.verify_extra(&master_pub, Timestamp::from_seconds(50)).unwrap();

        let data = key.to_create_data();
        let restored = OpKey::from_oplog(
            entity,
            &data,
            PttID::random(),
            key.create_ts,
            Some(&master_priv),
        )
        .unwrap();
        assert!(restored.has_private());
        assert_eq!(restored.pubkey, key.pubkey);

        let (_, other_priv, _) = owner();
        assert_eq!(
            OpKey::from_oplog(entity, &data, PttID::random(), key.create_ts, Some(&other_priv))
                .unwrap_err(),
            OpKeyError::WrongMaster
        );
    }

    #[test]
    fn test_signer_refuses_after_expiry() {
        let (_, master_priv, owner_id) = owner();
        let entity = PttID::new_under(&owner_id);
        let key = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(0))
            .unwrap();
        assert!(key.signer(Timestamp::from_seconds(100)).is_ok());
        assert_eq!(
            key.signer(Timestamp::from_seconds(101)).unwrap_err(),
            OpKeyError::Expired
        );
        assert!(key.needs_renewal(Timestamp::from_seconds(60), 50));
        assert!(!key.needs_renewal(Timestamp::from_seconds(40), 50));
    }

    #[test]
    fn test_ring_sweep_keeps_history() {
        let (_, master_priv, owner_id) = owner();
        let entity = PttID::new_under(&owner_id);
        let key = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(0))
            .unwrap();
        let hash = key.hash;
        let mut ring = OpKeyRing::new();
        ring.insert(key);
        assert!(ring.get(&hash, Timestamp::from_seconds(50)).is_some());
        assert!(ring.get(&hash, Timestamp::from_seconds(101)).is_none());
        assert_eq!(ring.len_alive(), 0);
        let all = ring.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, Status::Deleted);
    }

    #[test]
    fn test_ring_one_alive_per_owner() {
        let (_, master_priv, owner_id) = owner();
        let entity = PttID::new_under(&owner_id);
        let old = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(0))
            .unwrap();
        let new = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(60))
            .unwrap();
        let old_hash = old.hash;
        let new_hash = new.hash;

        // arrival order does not matter
        let mut ring = OpKeyRing::new();
        ring.insert(new.clone());
        assert!(ring.insert(old.clone()).is_none());
        assert_eq!(ring.len_alive(), 1);
        assert!(ring.get(&new_hash, Timestamp::from_seconds(70)).is_some());

        let mut ring = OpKeyRing::new();
        ring.insert(old);
        let displaced = ring.insert(new).unwrap();
        assert_eq!(displaced.hash, old_hash);
        assert_eq!(
            ring.signing_key(&owner_id, Timestamp::from_seconds(70)).map(|k| k.hash),
            Some(new_hash)
        );
    }

    #[test]
    fn test_revoke() {
        let (_, master_priv, owner_id) = owner();
        let entity = PttID::new_under(&owner_id);
        let key = OpKey::issue(entity, owner_id, &master_priv, 100, Timestamp::from_seconds(0))
            .unwrap();
        let hash = key.hash;
        let mut ring = OpKeyRing::new();
        ring.insert(key);
        assert_eq!(ring.revoke(&hash).unwrap().status, Status::Deleted);
        assert!(matches!(ring.revoke(&hash), Err(OpKeyError::NotFound(_))));
    }
}
