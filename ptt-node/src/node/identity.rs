/// Node key material.
///
/// A node holds:
/// - the **node key**: device identity, never leaves the device
/// - the **user key** (`myKey`): the master key of the Me, shared by every
///   device of the user
/// - **legacy user keys**: user keys this device held before joining another
///   Me; still needed to sign for entities the old identity masters
///
/// Private halves are zeroized on drop.
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ptt_protocol::crypto::{decode_my_key, derive_public_key, encode_my_key, generate_keypair, SigningError};
use ptt_protocol::{ErrorKind, NodeID, OpSigner, OplogError, PttID};

use crate::storage::{self, keys, KvStore, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::Signing(e) => e.kind(),
            KeyError::Oplog(e) => e.kind(),
            KeyError::Storage(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// One Ed25519 identity.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UserKey {
    #[zeroize(skip)]
    pub id: PttID,
    #[zeroize(skip)]
    pub pubkey: [u8; 32],
    private: [u8; 32],
}

impl std::fmt::Debug for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKey").field("id", &self.id).finish()
    }
}

impl UserKey {
    pub fn generate() -> Self {
        let (pubkey, private) = generate_keypair();
        UserKey {
            id: PttID::from_pubkey(&pubkey),
            pubkey,
            private,
        }
    }

    pub fn from_private(private: [u8; 32]) -> Result<Self> {
        let pubkey = derive_public_key(&private)?;
        Ok(UserKey {
            id: PttID::from_pubkey(&pubkey),
            pubkey,
            private,
        })
    }

    /// Parse the `myKey` text form.
    pub fn from_my_key(text: &str) -> Result<Self> {
        Self::from_private(decode_my_key(text)?)
    }

    pub fn private(&self) -> &[u8; 32] {
        &self.private
    }

    /// Signer using this key directly (no delegation).
    pub fn signer(&self) -> std::result::Result<OpSigner, OplogError> {
        OpSigner::direct(self.id, self.private)
    }

    pub fn my_key(&self) -> String {
        encode_my_key(&self.private)
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredUserKeys {
    user: [u8; 32],
    legacy: Vec<[u8; 32]>,
}

/// Keys of this node, shared by every entity worker.
pub struct KeyStore {
    kv: Arc<dyn KvStore>,
    node: UserKey,
    user: RwLock<UserKey>,
    legacy: RwLock<Vec<UserKey>>,
}

impl KeyStore {
    /// Load the node's keys, generating any that are missing.
    pub fn load_or_create(kv: Arc<dyn KvStore>) -> Result<Self> {
        let node = match storage::load::<[u8; 32]>(kv.as_ref(), keys::NODE_KEY)? {
            Some(private) => UserKey::from_private(private)?,
            None => {
                let key = UserKey::generate();
                storage::save(kv.as_ref(), keys::NODE_KEY, key.private())?;
                log::info!("KeyStore: generated node key {}", key.id.short());
                key
            }
        };
        let (user, legacy) = match storage::load::<StoredUserKeys>(kv.as_ref(), keys::NODE_MY_KEY)? {
            Some(stored) => {
                let user = UserKey::from_private(stored.user)?;
                let legacy = stored
                    .legacy
                    .iter()
                    .map(|k| UserKey::from_private(*k))
                    .collect::<Result<Vec<_>>>()?;
                (user, legacy)
            }
            None => {
                let key = UserKey::generate();
                log::info!("KeyStore: generated user key {}", key.id.short());
                (key, Vec::new())
            }
        };
        let store = KeyStore {
            kv,
            node,
            user: RwLock::new(user),
            legacy: RwLock::new(legacy),
        };
        store.persist_user_keys()?;
        Ok(store)
    }

    fn persist_user_keys(&self) -> Result<()> {
        let stored = StoredUserKeys {
            user: *self.user().private(),
            legacy: self.legacy().iter().map(|k| *k.private()).collect(),
        };
        storage::save(self.kv.as_ref(), keys::NODE_MY_KEY, &stored)?;
        Ok(())
    }

    pub fn node_key(&self) -> &UserKey {
        &self.node
    }

    pub fn node_id(&self) -> NodeID {
        NodeID::from_pubkey(self.node.pubkey)
    }

    pub fn user(&self) -> UserKey {
        self.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn user_id(&self) -> PttID {
        self.user.read().unwrap_or_else(|e| e.into_inner()).id
    }

    pub fn legacy(&self) -> Vec<UserKey> {
        self.legacy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every identity this node can sign as: user, legacy users, node.
    pub fn all(&self) -> Vec<UserKey> {
        let mut out = vec![self.user()];
        out.extend(self.legacy());
        out.push(self.node.clone());
        out
    }

    pub fn find(&self, id: &PttID) -> Option<UserKey> {
        self.all().into_iter().find(|k| k.id == *id)
    }

    pub fn holds(&self, id: &PttID) -> bool {
        self.find(id).is_some()
    }

    /// Adopt `new` as the user key; the current one becomes legacy.
    pub fn switch_user(&self, new: UserKey) -> Result<UserKey> {
        let old = {
            let mut user = self.user.write().unwrap_or_else(|e| e.into_inner());
            if user.id == new.id {
                return Ok(user.clone());
            }
            std::mem::replace(&mut *user, new)
        };
        self.legacy
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(old.clone());
        self.persist_user_keys()?;
        log::info!(
            "KeyStore: switched user {} -> {}",
            old.id.short(),
            self.user_id().short()
        );
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use hex_literal::hex;

    const FIXED: [u8; 32] = hex!("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60");

    #[test]
    fn test_fixed_key_is_stable() {
        let a = UserKey::from_private(FIXED).unwrap();
        let b = UserKey::from_my_key(&a.my_key()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.pubkey, b.pubkey);
        assert_eq!(a.id, PttID::from_pubkey(&a.pubkey));
        assert!(UserKey::from_my_key("not a key").is_err());
    }

    #[test]
    fn test_keys_survive_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let first = KeyStore::load_or_create(kv.clone()).unwrap();
        let again = KeyStore::load_or_create(kv.clone()).unwrap();
        assert_eq!(first.node_id(), again.node_id());
        assert_eq!(first.user_id(), again.user_id());
    }

    #[test]
    fn test_switch_user_keeps_legacy() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let store = KeyStore::load_or_create(kv.clone()).unwrap();
        let original = store.user_id();
        let other = UserKey::from_private(FIXED).unwrap();

        let old = store.switch_user(other.clone()).unwrap();
        assert_eq!(old.id, original);
        assert_eq!(store.user_id(), other.id);
        assert!(store.holds(&original));
        assert_eq!(store.all().len(), 3);

        let reloaded = KeyStore::load_or_create(kv).unwrap();
        assert_eq!(reloaded.user_id(), other.id);
        assert_eq!(reloaded.legacy()[0].id, original);
    }
}
