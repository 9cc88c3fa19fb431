/// Oplog: the signed, hash-chained operation record.
///
/// Every state change of an entity is an immutable oplog. Oplogs are the
/// atomic unit of replication: stored, exchanged with peers, verified and
/// replayed deterministically.
///
/// - Canonical form: bincode over a fixed field order (everything except
///   `hash`, `creator_sig`, `master_signs` and the local sync flags)
/// - `hash = BLAKE3("ptt-oplog-v1" || canonical)`
/// - Opcode payloads in `data`: CBOR via ciborium
/// - Signatures: Ed25519 over `(id, hash, salt, sign_ts)`
pub mod chain;
pub mod ops;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crypto::{self, KeyChainError, KeyExtra, SigningError};
use crate::error::ErrorKind;
use crate::limits::{check_oplog_size, SizeCheck, MAX_MASTER_SIGNS};
use crate::types::{PttID, Timestamp};

pub use ops::{
    AddMasterData, AddMemberData, CreateEntityData, CreateOpKeyData, DeleteEntityData,
    DeleteMemberData, EndOpKeyData, MasterOp, MemberOp, MigrateEntityData, MigrateMemberData,
    OpKeyEndReason, OpKeyOp, RemoveMasterData, TransferMasterData,
};

const HASH_TAG: &[u8] = b"ptt-oplog-v1";
const SIG_TAG: &[u8] = b"ptt-oplog-sig-v1";
const ID_TAG: &[u8] = b"ptt-oplog-id-v1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OplogError {
    #[error("Bad signature: {0}")]
    BadSig(String),

    #[error("Bad chain: {0}")]
    BadChain(String),

    #[error("Signer {0} is not a master")]
    NotMaster(PttID),

    #[error("Oplog {0} already exists")]
    Duplicate(PttID),

    #[error("Oplog created {create_ts:?} is ahead of local clock {now:?}")]
    FutureTS { create_ts: Timestamp, now: Timestamp },

    #[error("Signing key expired")]
    ExpiredKey,

    #[error("Master oplog {0} unknown")]
    UnknownMaster(PttID),

    #[error("Creator {0} is not a member")]
    UnknownCreator(PttID),

    #[error("Hash mismatch on oplog {0}")]
    HashMismatch(PttID),

    #[error("Oplog {0} conflicts with a stored oplog of the same id")]
    Conflict(PttID),

    #[error("Oplog payload too large: {0} bytes")]
    TooLarge(usize),

    #[error("Invalid opcode {op} for {category}")]
    InvalidOp { category: &'static str, op: u32 },

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Decoding failed: {0}")]
    Decoding(String),
}

impl OplogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OplogError::BadSig(_)
            | OplogError::NotMaster(_)
            | OplogError::ExpiredKey
            | OplogError::UnknownCreator(_) => ErrorKind::Unauthorized,
            OplogError::BadChain(_) | OplogError::Conflict(_) => ErrorKind::Conflict,
            OplogError::Duplicate(_) => ErrorKind::Conflict,
            OplogError::UnknownMaster(_) => ErrorKind::Transient,
            OplogError::HashMismatch(_) => ErrorKind::Corruption,
            OplogError::FutureTS { .. }
            | OplogError::TooLarge(_)
            | OplogError::InvalidOp { .. }
            | OplogError::Encoding(_)
            | OplogError::Decoding(_) => ErrorKind::BadInput,
        }
    }
}

impl From<SigningError> for OplogError {
    fn from(e: SigningError) -> Self {
        OplogError::BadSig(e.to_string())
    }
}

impl From<KeyChainError> for OplogError {
    fn from(e: KeyChainError) -> Self {
        match e {
            KeyChainError::ExpiredKey(_) => OplogError::ExpiredKey,
            other => OplogError::BadSig(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OplogError>;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Oplog partition inside an entity. Master/Member/OpKey exist in every
/// entity; the rest are domain categories of one entity type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Category {
    Master = 1,
    Member = 2,
    OpKey = 3,
    Me = 4,
    Ptt = 5,
    User = 6,
    Board = 7,
    Friend = 8,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Master,
        Category::Member,
        Category::OpKey,
        Category::Me,
        Category::Ptt,
        Category::User,
        Category::Board,
        Category::Friend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Master => "master",
            Category::Member => "member",
            Category::OpKey => "opkey",
            Category::Me => "me",
            Category::Ptt => "ptt",
            Category::User => "user",
            Category::Board => "board",
            Category::Friend => "friend",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u8 == v)
    }

    /// Membership categories are reconciled before anything else.
    pub fn is_membership(&self) -> bool {
        matches!(self, Category::Master | Category::Member)
    }

    pub fn is_domain(&self) -> bool {
        !matches!(self, Category::Master | Category::Member | Category::OpKey)
    }
}

// ---------------------------------------------------------------------------
// Signature bundle
// ---------------------------------------------------------------------------

/// `(creatorID, creatorHash, salt, sig, pubkey, keyExtra)`: one signature
/// over an oplog's `(id, hash)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignInfo {
    /// Identity the signature speaks for (user id).
    pub signer_id: PttID,
    /// BLAKE3 of `pubkey`; peers look keys up by this.
    pub key_hash: [u8; 32],
    pub salt: [u8; 16],
    pub sign_ts: Timestamp,
    #[serde(with = "BigArray")]
    pub sig: [u8; 64],
    pub pubkey: [u8; 32],
    pub key_extra: KeyExtra,
}

impl SignInfo {
    fn signable_bytes(
        id: &PttID,
        hash: &[u8; 32],
        salt: &[u8; 16],
        sign_ts: &Timestamp,
    ) -> Result<Vec<u8>> {
        bincode::serialize(&(SIG_TAG, id, hash, salt, sign_ts))
            .map_err(|e| OplogError::Encoding(e.to_string()))
    }

    /// Check the key chain from `root_pub` at time `at` and the signature
    /// over `(id, hash)`.
    pub fn verify_with_root(
        &self,
        id: &PttID,
        hash: &[u8; 32],
        root_pub: &[u8; 32],
        at: Timestamp,
        entity_id: &PttID,
    ) -> Result<()> {
        let leaf = crypto::verify_chain(&self.key_extra, root_pub, at, Some(entity_id))?;
        if leaf != self.pubkey {
            return Err(OplogError::BadSig("signing key is not the chain leaf".into()));
        }
        self.verify_over(id, hash)
    }

    fn verify_over(&self, id: &PttID, hash: &[u8; 32]) -> Result<()> {
        if crypto::key_hash(&self.pubkey) != self.key_hash {
            return Err(OplogError::BadSig("key hash does not match pubkey".into()));
        }
        let bytes = Self::signable_bytes(id, hash, &self.salt, &self.sign_ts)?;
        if !crypto::verify_signature(&bytes, &self.sig, &self.pubkey)? {
            return Err(OplogError::BadSig(format!(
                "signature by {} does not verify",
                self.signer_id.short()
            )));
        }
        Ok(())
    }
}

/// A key able to produce [`SignInfo`] bundles.
///
/// `signer_id` is the identity the key speaks for; `key_extra` certifies
/// `pubkey` back to that identity's master key (empty when the master key
/// signs directly).
#[derive(Clone)]
pub struct OpSigner {
    pub signer_id: PttID,
    private: [u8; 32],
    pub pubkey: [u8; 32],
    pub key_extra: KeyExtra,
}

impl OpSigner {
    /// Sign with the identity master key itself.
    pub fn direct(signer_id: PttID, private: [u8; 32]) -> Result<Self> {
        let pubkey = crypto::derive_public_key(&private)?;
        Ok(OpSigner {
            signer_id,
            private,
            pubkey,
            key_extra: KeyExtra::direct(),
        })
    }

    /// Sign with a delegated key certified by `key_extra`.
    pub fn delegated(signer_id: PttID, private: [u8; 32], key_extra: KeyExtra) -> Result<Self> {
        let pubkey = crypto::derive_public_key(&private)?;
        if let Some(leaf) = key_extra.leaf() {
            if *leaf != pubkey {
                return Err(OplogError::BadSig("key extra leaf is not this key".into()));
            }
        }
        Ok(OpSigner {
            signer_id,
            private,
            pubkey,
            key_extra,
        })
    }

    /// Earliest certificate expiry, `None` for a direct master key.
    pub fn not_after(&self) -> Option<Timestamp> {
        self.key_extra.not_after()
    }

    pub fn key_hash(&self) -> [u8; 32] {
        crypto::key_hash(&self.pubkey)
    }

    pub fn sign(&self, id: &PttID, hash: &[u8; 32], now: Timestamp) -> Result<SignInfo> {
        if let Some(not_after) = self.not_after() {
            if now > not_after {
                return Err(OplogError::ExpiredKey);
            }
        }
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let bytes = SignInfo::signable_bytes(id, hash, &salt, &now)?;
        let sig = crypto::sign_data(&bytes, &self.private)?;
        Ok(SignInfo {
            signer_id: self.signer_id,
            key_hash: self.key_hash(),
            salt,
            sign_ts: now,
            sig,
            pubkey: self.pubkey,
            key_extra: self.key_extra.clone(),
        })
    }
}

impl std::fmt::Debug for OpSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OpSigner({}, key={}..)",
            self.signer_id.short(),
            &hex::encode(self.key_hash())[..8]
        )
    }
}

impl Drop for OpSigner {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.private);
    }
}

// ---------------------------------------------------------------------------
// Oplog
// ---------------------------------------------------------------------------

/// Fields a caller supplies to create an oplog.
#[derive(Clone, Debug)]
pub struct NewOplog {
    pub entity_id: PttID,
    pub category: Category,
    pub op: u32,
    pub obj_id: PttID,
    pub pre_log_id: Option<PttID>,
    pub master_log_id: PttID,
    pub data: Vec<u8>,
    pub extra: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Oplog {
    pub id: PttID,
    pub entity_id: PttID,
    pub category: Category,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    pub creator_id: PttID,
    pub op: u32,
    pub obj_id: PttID,
    pub pre_log_id: Option<PttID>,
    pub master_log_id: PttID,
    pub nonce: [u8; 16],
    pub data: Vec<u8>,
    pub extra: Vec<u8>,
    pub hash: [u8; 32],
    pub creator_sig: SignInfo,
    pub master_signs: Vec<SignInfo>,
    /// True once the object head it belongs to is verified end to end.
    pub is_sync: bool,
    /// Transient diff flag: set when merged from a peer.
    pub is_newer: bool,
}

/// Borrowed view of the hashed fields, in canonical order.
#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a PttID,
    entity_id: &'a PttID,
    category: &'a Category,
    create_ts: &'a Timestamp,
    update_ts: &'a Timestamp,
    creator_id: &'a PttID,
    op: u32,
    obj_id: &'a PttID,
    pre_log_id: &'a Option<PttID>,
    master_log_id: &'a PttID,
    nonce: &'a [u8; 16],
    data: &'a [u8],
    extra: &'a [u8],
}

/// What verification established about an oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// At least one valid master co-signature is attached.
    pub master_signed: bool,
    /// The creator is itself a master at `master_log_id`.
    pub creator_is_master: bool,
}

/// Read-only view of membership the verifier needs.
pub trait MasterView {
    fn entity_id(&self) -> PttID;

    /// Masters in force right after master oplog `master_log_id` was
    /// applied: id → public key. `None` when that master oplog is unknown.
    fn masters_at(&self, master_log_id: &PttID) -> Option<BTreeMap<PttID, [u8; 32]>>;

    /// Identity key of a non-master creator that was a member at `at`.
    fn member_pubkey(&self, member_id: &PttID, at: Timestamp) -> Option<[u8; 32]>;
}

/// Verification knobs.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub now: Timestamp,
    pub future_tolerance_secs: i64,
}

/// Derive an oplog id: creator address || H(creatorID || createTS || objID || nonce)[..16].
pub fn derive_oplog_id(
    creator_id: &PttID,
    create_ts: &Timestamp,
    obj_id: &PttID,
    nonce: &[u8; 16],
) -> PttID {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ID_TAG);
    hasher.update(creator_id.as_bytes());
    hasher.update(&create_ts.to_be_bytes());
    hasher.update(obj_id.as_bytes());
    hasher.update(nonce);
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(creator_id.addr(), postfix)
}

impl Oplog {
    /// Create and sign a new oplog (`NewOplog`).
    ///
    /// `createTS = updateTS = now`; the id is derived from the creator, time,
    /// object and a random nonce. For an entity's bootstrap master oplog pass
    /// `master_log_id = PttID::ZERO`: it is replaced by the oplog's own id.
    pub fn create(new: NewOplog, signer: &OpSigner, now: Timestamp) -> Result<Self> {
        if let SizeCheck::DataTooLarge(n) | SizeCheck::ExtraTooLarge(n) =
            check_oplog_size(new.data.len(), new.extra.len())
        {
            return Err(OplogError::TooLarge(n));
        }
        if let Some(not_after) = signer.not_after() {
            if now > not_after {
                return Err(OplogError::ExpiredKey);
            }
        }

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let id = derive_oplog_id(&signer.signer_id, &now, &new.obj_id, &nonce);
        let master_log_id = if new.master_log_id.is_zero() {
            id
        } else {
            new.master_log_id
        };

        let mut oplog = Oplog {
            id,
            entity_id: new.entity_id,
            category: new.category,
            create_ts: now,
            update_ts: now,
            creator_id: signer.signer_id,
            op: new.op,
            obj_id: new.obj_id,
            pre_log_id: new.pre_log_id,
            master_log_id,
            nonce,
            data: new.data,
            extra: new.extra,
            hash: [0u8; 32],
            creator_sig: SignInfo {
                signer_id: signer.signer_id,
                key_hash: [0u8; 32],
                salt: [0u8; 16],
                sign_ts: now,
                sig: [0u8; 64],
                pubkey: [0u8; 32],
                key_extra: KeyExtra::direct(),
            },
            master_signs: Vec::new(),
            is_sync: false,
            is_newer: false,
        };
        oplog.hash = oplog.compute_hash()?;
        oplog.creator_sig = signer.sign(&oplog.id, &oplog.hash, now)?;
        Ok(oplog)
    }

    /// Canonical bytes of everything except hash, signatures and local flags.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let canonical = Canonical {
            id: &self.id,
            entity_id: &self.entity_id,
            category: &self.category,
            create_ts: &self.create_ts,
            update_ts: &self.update_ts,
            creator_id: &self.creator_id,
            op: self.op,
            obj_id: &self.obj_id,
            pre_log_id: &self.pre_log_id,
            master_log_id: &self.master_log_id,
            nonce: &self.nonce,
            data: &self.data,
            extra: &self.extra,
        };
        bincode::serialize(&canonical).map_err(|e| OplogError::Encoding(e.to_string()))
    }

    pub fn compute_hash(&self) -> Result<[u8; 32]> {
        let canonical = self.canonical_bytes()?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_TAG);
        hasher.update(&canonical);
        Ok(*hasher.finalize().as_bytes())
    }

    /// True for the self-signed first master oplog of an entity.
    pub fn is_bootstrap(&self) -> bool {
        self.category == Category::Master
            && self.op == MasterOp::CreateEntity as u32
            && self.pre_log_id.is_none()
            && self.master_log_id == self.id
    }

    /// Co-sign as a master (`AttachMasterSign`).
    ///
    /// Re-checks the hash and the creator signature first. Signing twice with
    /// the same identity is a no-op. Returns whether a signature was added.
    pub fn attach_master_sign(&mut self, master: &OpSigner, now: Timestamp) -> Result<bool> {
        if self.compute_hash()? != self.hash {
            return Err(OplogError::HashMismatch(self.id));
        }
        self.creator_sig.verify_over(&self.id, &self.hash)?;
        if self.has_master_sign_from(&master.signer_id) {
            return Ok(false);
        }
        if self.master_signs.len() >= MAX_MASTER_SIGNS {
            return Ok(false);
        }
        let sign = master.sign(&self.id, &self.hash, now)?;
        self.master_signs.push(sign);
        Ok(true)
    }

    pub fn has_master_sign_from(&self, signer_id: &PttID) -> bool {
        self.master_signs.iter().any(|s| s.signer_id == *signer_id)
    }

    /// Set-union master signatures from another copy of the same oplog.
    ///
    /// Returns the number of signatures added.
    pub fn merge_master_signs(&mut self, other: &Oplog) -> Result<usize> {
        if other.id != self.id {
            return Err(OplogError::Conflict(other.id));
        }
        if other.hash != self.hash {
            return Err(OplogError::Conflict(other.id));
        }
        let mut added = 0;
        for sign in &other.master_signs {
            if self.master_signs.len() >= MAX_MASTER_SIGNS {
                break;
            }
            if !self.has_master_sign_from(&sign.signer_id) {
                self.master_signs.push(sign.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Masters a bootstrap oplog declares for itself.
    fn bootstrap_masters(&self) -> Result<BTreeMap<PttID, [u8; 32]>> {
        let data: CreateEntityData = cbor_decode(&self.data)?;
        if data.master_id != self.creator_id {
            return Err(OplogError::BadChain(
                "bootstrap master is not the creator".into(),
            ));
        }
        let mut masters = BTreeMap::new();
        masters.insert(data.master_id, data.master_pub);
        Ok(masters)
    }

    /// Verify an oplog (`Verify`).
    ///
    /// Recomputes the hash, checks the creator signature through its key
    /// chain, and checks every master co-signature against the masters in
    /// force at `master_log_id`. A missing co-signature is reported through
    /// [`VerifyOutcome::master_signed`], not as an error.
    pub fn verify(&self, view: &dyn MasterView, opts: VerifyOptions) -> Result<VerifyOutcome> {
        if self.entity_id != view.entity_id() {
            return Err(OplogError::BadChain("oplog belongs to another entity".into()));
        }
        if self.update_ts < self.create_ts {
            return Err(OplogError::BadChain("updateTS before createTS".into()));
        }
        if self.create_ts > opts.now.plus_seconds(opts.future_tolerance_secs) {
            return Err(OplogError::FutureTS {
                create_ts: self.create_ts,
                now: opts.now,
            });
        }
        if let SizeCheck::DataTooLarge(n) | SizeCheck::ExtraTooLarge(n) =
            check_oplog_size(self.data.len(), self.extra.len())
        {
            return Err(OplogError::TooLarge(n));
        }
        if self.compute_hash()? != self.hash {
            return Err(OplogError::HashMismatch(self.id));
        }
        if derive_oplog_id(&self.creator_id, &self.create_ts, &self.obj_id, &self.nonce) != self.id
        {
            return Err(OplogError::BadChain("id does not match its content".into()));
        }

        let masters = if self.is_bootstrap() {
            self.bootstrap_masters()?
        } else {
            view.masters_at(&self.master_log_id)
                .ok_or(OplogError::UnknownMaster(self.master_log_id))?
        };

        // creator signature through its key chain
        let creator_is_master = masters.contains_key(&self.creator_id);
        let root_pub = match masters.get(&self.creator_id) {
            Some(pk) => *pk,
            None => view
                .member_pubkey(&self.creator_id, self.create_ts)
                .ok_or(OplogError::UnknownCreator(self.creator_id))?,
        };
        if self.category == Category::Master && !creator_is_master {
            return Err(OplogError::NotMaster(self.creator_id));
        }
        if self.creator_sig.signer_id != self.creator_id {
            return Err(OplogError::BadSig("creator signature speaks for someone else".into()));
        }
        self.creator_sig.verify_with_root(
            &self.id,
            &self.hash,
            &root_pub,
            self.create_ts,
            &self.entity_id,
        )?;

        // master co-signatures
        let mut valid_masters = 0usize;
        for sign in &self.master_signs {
            let master_pub = masters
                .get(&sign.signer_id)
                .ok_or(OplogError::NotMaster(sign.signer_id))?;
            sign.verify_with_root(&self.id, &self.hash, master_pub, sign.sign_ts, &self.entity_id)?;
            valid_masters += 1;
        }

        Ok(VerifyOutcome {
            master_signed: valid_masters >= 1,
            creator_is_master,
        })
    }

    /// Full serialization (storage and wire).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| OplogError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| OplogError::Decoding(e.to_string()))
    }

    /// Decode the CBOR `data` into a typed payload.
    pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        cbor_decode(&self.data)
    }
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

/// CBOR-encode a value to bytes.
pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| OplogError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// CBOR-decode a value from bytes.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| OplogError::Decoding(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, KeyLink, KeyPurpose};

    /// Fixed membership for verification tests.
    pub(crate) struct FixedView {
        pub entity_id: PttID,
        pub master_log_id: PttID,
        pub masters: BTreeMap<PttID, [u8; 32]>,
        pub members: BTreeMap<PttID, [u8; 32]>,
    }

    impl MasterView for FixedView {
        fn entity_id(&self) -> PttID {
            self.entity_id
        }

        fn masters_at(&self, master_log_id: &PttID) -> Option<BTreeMap<PttID, [u8; 32]>> {
            if *master_log_id == self.master_log_id {
                Some(self.masters.clone())
            } else {
                None
            }
        }

        fn member_pubkey(&self, member_id: &PttID, _at: Timestamp) -> Option<[u8; 32]> {
            self.members.get(member_id).copied()
        }
    }

    pub(crate) struct Identity {
        pub id: PttID,
        pub pubkey: [u8; 32],
        pub private: [u8; 32],
    }

    pub(crate) fn identity() -> Identity {
        let (pubkey, private) = generate_keypair();
        Identity {
            id: PttID::from_pubkey(&pubkey),
            pubkey,
            private,
        }
    }

    fn opts(now: i64) -> VerifyOptions {
        VerifyOptions {
            now: Timestamp::from_seconds(now),
            future_tolerance_secs: 30,
        }
    }

    fn bootstrap(master: &Identity, entity_id: PttID, now: i64) -> Oplog {
        let data = cbor_encode(&CreateEntityData {
            entity_type: 3,
            master_id: master.id,
            master_pub: master.pubkey,
            owner_ids: vec![master.id],
            body: vec![],
        })
        .unwrap();
        let signer = OpSigner::direct(master.id, master.private).unwrap();
        let mut log = Oplog::create(
            NewOplog {
                entity_id,
                category: Category::Master,
                op: MasterOp::CreateEntity as u32,
                obj_id: entity_id,
                pre_log_id: None,
                master_log_id: PttID::ZERO,
                data,
                extra: vec![],
            },
            &signer,
            Timestamp::from_seconds(now),
        )
        .unwrap();
        log.attach_master_sign(&signer, Timestamp::from_seconds(now)).unwrap();
        log
    }

    fn view_for(master: &Identity, entity_id: PttID, master_log_id: PttID) -> FixedView {
        let mut masters = BTreeMap::new();
        masters.insert(master.id, master.pubkey);
        FixedView {
            entity_id,
            master_log_id,
            masters,
            members: BTreeMap::new(),
        }
    }

    fn op_signer_for(owner: &Identity, entity_id: PttID, not_after: i64) -> OpSigner {
        let (child_pub, child_priv) =
            crypto::derive_child(&owner.private, b"op-signing:test").unwrap();
        let link = KeyLink::certify(
            &owner.private,
            KeyPurpose::OpSigning { entity_id },
            child_pub,
            Timestamp::from_seconds(not_after),
        )
        .unwrap();
        OpSigner::delegated(owner.id, child_priv, KeyExtra::single(link)).unwrap()
    }

    fn domain_op(signer: &OpSigner, entity_id: PttID, master_log_id: PttID, now: i64) -> Oplog {
        Oplog::create(
            NewOplog {
                entity_id,
                category: Category::Board,
                op: 1,
                obj_id: PttID::random(),
                pre_log_id: None,
                master_log_id,
                data: b"hello".to_vec(),
                extra: vec![],
            },
            signer,
            Timestamp::from_seconds(now),
        )
        .unwrap()
    }

    #[test]
    fn test_bootstrap_verifies_against_itself() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let log = bootstrap(&master, entity_id, 100);
        assert!(log.is_bootstrap());
        assert_eq!(log.master_log_id, log.id);
        let empty = FixedView {
            entity_id,
            master_log_id: PttID::ZERO,
            masters: BTreeMap::new(),
            members: BTreeMap::new(),
        };
        let outcome = log.verify(&empty, opts(100)).unwrap();
        assert!(outcome.master_signed);
        assert!(outcome.creator_is_master);
    }

    #[test]
    fn test_delegated_creator_sig_and_master_sign() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let view = view_for(&master, entity_id, boot.id);

        let signer = op_signer_for(&master, entity_id, 1000);
        let mut log = domain_op(&signer, entity_id, boot.id, 110);
        let outcome = log.verify(&view, opts(110)).unwrap();
        assert!(!outcome.master_signed);

        let master_signer = OpSigner::direct(master.id, master.private).unwrap();
        assert!(log.attach_master_sign(&master_signer, Timestamp::from_seconds(111)).unwrap());
        assert!(!log.attach_master_sign(&master_signer, Timestamp::from_seconds(112)).unwrap());
        assert_eq!(log.master_signs.len(), 1);
        assert!(log.verify(&view, opts(112)).unwrap().master_signed);
    }

    #[test]
    fn test_tampered_data_is_hash_mismatch() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let view = view_for(&master, entity_id, boot.id);
        let signer = OpSigner::direct(master.id, master.private).unwrap();
        let mut log = domain_op(&signer, entity_id, boot.id, 110);
        log.data = b"evil".to_vec();
        assert_eq!(log.verify(&view, opts(110)), Err(OplogError::HashMismatch(log.id)));
    }

    #[test]
    fn test_future_ts_rejected() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let view = view_for(&master, entity_id, boot.id);
        let signer = OpSigner::direct(master.id, master.private).unwrap();
        let log = domain_op(&signer, entity_id, boot.id, 1000);
        assert!(matches!(
            log.verify(&view, opts(900)),
            Err(OplogError::FutureTS { .. })
        ));
        assert!(log.verify(&view, opts(975)).is_ok());
    }

    #[test]
    fn test_unknown_master_log() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let view = view_for(&master, entity_id, PttID::random());
        let signer = OpSigner::direct(master.id, master.private).unwrap();
        let missing = PttID::random();
        let log = domain_op(&signer, entity_id, missing, 100);
        assert_eq!(log.verify(&view, opts(100)), Err(OplogError::UnknownMaster(missing)));
    }

    #[test]
    fn test_master_category_requires_master_creator() {
        let master = identity();
        let outsider = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let mut view = view_for(&master, entity_id, boot.id);
        view.members.insert(outsider.id, outsider.pubkey);
        let signer = OpSigner::direct(outsider.id, outsider.private).unwrap();
        let log = Oplog::create(
            NewOplog {
                entity_id,
                category: Category::Master,
                op: MasterOp::AddMaster as u32,
                obj_id: entity_id,
                pre_log_id: Some(boot.id),
                master_log_id: boot.id,
                data: vec![],
                extra: vec![],
            },
            &signer,
            Timestamp::from_seconds(110),
        )
        .unwrap();
        assert_eq!(log.verify(&view, opts(110)), Err(OplogError::NotMaster(outsider.id)));
    }

    #[test]
    fn test_member_creator_uses_member_key() {
        let master = identity();
        let member = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let mut view = view_for(&master, entity_id, boot.id);

        let signer = op_signer_for(&member, entity_id, 1000);
        let log = domain_op(&signer, entity_id, boot.id, 120);
        assert_eq!(
            log.verify(&view, opts(120)),
            Err(OplogError::UnknownCreator(member.id))
        );
        view.members.insert(member.id, member.pubkey);
        let outcome = log.verify(&view, opts(120)).unwrap();
        assert!(!outcome.creator_is_master);
    }

    #[test]
    fn test_expired_signer_cannot_create_but_history_verifies() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let boot = bootstrap(&master, entity_id, 100);
        let view = view_for(&master, entity_id, boot.id);
        let signer = op_signer_for(&master, entity_id, 200);

        let log = domain_op(&signer, entity_id, boot.id, 150);
        let err = Oplog::create(
            NewOplog {
                entity_id,
                category: Category::Board,
                op: 1,
                obj_id: PttID::random(),
                pre_log_id: None,
                master_log_id: boot.id,
                data: vec![],
                extra: vec![],
            },
            &signer,
            Timestamp::from_seconds(201),
        );
        assert_eq!(err, Err(OplogError::ExpiredKey));
        // verified long after expiry: the chain is checked at createTS
        assert!(log.verify(&view, opts(10_000)).is_ok());
    }

    #[test]
    fn test_merge_master_signs_is_set_union() {
        let a = identity();
        let b = identity();
        let entity_id = PttID::new_under(&a.id);
        let signer = OpSigner::direct(a.id, a.private).unwrap();
        let mut log = domain_op(&signer, entity_id, PttID::random(), 100);
        let mut copy = log.clone();

        log.attach_master_sign(&signer, Timestamp::from_seconds(101)).unwrap();
        let b_signer = OpSigner::direct(b.id, b.private).unwrap();
        copy.attach_master_sign(&b_signer, Timestamp::from_seconds(101)).unwrap();
        copy.attach_master_sign(&signer, Timestamp::from_seconds(102)).unwrap();

        assert_eq!(log.merge_master_signs(&copy).unwrap(), 1);
        assert_eq!(log.master_signs.len(), 2);
        assert_eq!(log.merge_master_signs(&copy).unwrap(), 0);

        let other = domain_op(&signer, entity_id, PttID::random(), 100);
        assert!(matches!(log.merge_master_signs(&other), Err(OplogError::Conflict(_))));
    }

    #[test]
    fn test_canonical_roundtrip_and_hash_excludes_signatures() {
        let master = identity();
        let entity_id = PttID::new_under(&master.id);
        let signer = OpSigner::direct(master.id, master.private).unwrap();
        let mut log = domain_op(&signer, entity_id, PttID::random(), 100);
        let bytes = log.to_bytes().unwrap();
        assert_eq!(Oplog::from_bytes(&bytes).unwrap(), log);

        let before = log.compute_hash().unwrap();
        log.attach_master_sign(&signer, Timestamp::from_seconds(101)).unwrap();
        log.is_sync = true;
        assert_eq!(log.compute_hash().unwrap(), before);
    }
}
