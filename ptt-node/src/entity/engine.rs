/// Entity engine: the synchronous state machine behind one entity worker.
///
/// `EntityEngine` holds the full in-memory state of one entity: oplogs per
/// category, the pending set, membership, the OpKey ring, one merkle index
/// per category and the applied domain objects. Every local submission
/// flows through [`EntityEngine::submit`], every inbound oplog through
/// [`EntityEngine::receive`]; both end in the same store-then-apply path.
///
/// An oplog is **accepted** once it carries a valid master co-signature (or
/// is the self-signed bootstrap). Unsigned oplogs stay **pending**: they are
/// stored and forwarded so a master can co-sign them, and only their own
/// creator applies them. Pending oplogs older than `expire_oplog_secs` are
/// discarded.
///
/// Derived state (membership, OpKey ring, objects) is a replay of the
/// accepted oplogs, so the same set in any arrival order yields the same
/// state.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;

use ptt_protocol::merkle::MerkleNode;
use ptt_protocol::oplog::chain::{ChainLink, ObjectChain};
use ptt_protocol::oplog::{
    cbor_encode, Category, CreateEntityData, CreateOpKeyData, EndOpKeyData, MasterView, NewOplog,
    OpKeyEndReason, OpKeyOp, OpSigner, Oplog, OplogError, SignInfo, VerifyOptions,
};
use ptt_protocol::{Clock, MerkleIndex, OpKey, OpKeyInfo, OpKeyRing, PttID, Timestamp};

use super::membership::{apply_master, Membership};
use super::store::EntityStore;
use super::{EntityError, EntityRecord, EntityType, Result};
use crate::config::Config;
use crate::node::identity::{KeyStore, UserKey};
use crate::service::{self, BlockRef, DecodeTable, Object, ObjectKind, ObjectSource};
use crate::storage::{KvStore, WriteBatch};

const IDENTIFY_TAG: &[u8] = b"ptt-identify-v1";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Tunables the engine reads from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub future_tolerance_secs: i64,
    pub expire_oplog_secs: i64,
    pub expire_opkey_secs: i64,
    pub renew_opkey_secs: i64,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        EngineSettings {
            future_tolerance_secs: config.future_tolerance_secs,
            expire_oplog_secs: config.expire_oplog_secs,
            expire_opkey_secs: config.expire_opkey_secs,
            renew_opkey_secs: config.renew_opkey_secs,
        }
    }
}

/// Node-wide handles every engine shares.
#[derive(Clone)]
pub struct EngineContext {
    pub kv: Arc<dyn KvStore>,
    pub keys: Arc<KeyStore>,
    pub clock: Arc<Clock>,
    /// True while this device leads its Me raft group.
    pub authority: watch::Receiver<bool>,
    pub settings: EngineSettings,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A local write and everything it produced.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub oplog: Oplog,
    /// New oplogs to forward, `oplog` last.
    pub gossip: Vec<Oplog>,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOutcome {
    /// Oplogs that are new or gained signatures here.
    pub gossip: Vec<Oplog>,
    pub accepted: usize,
    pub pending: usize,
    pub duplicates: usize,
    /// Dropped because their master oplog is unknown; a sync fetches it.
    pub deferred: usize,
    pub rejected: usize,
    /// Rejections that count against the sender.
    pub penalised: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Housekeeping {
    pub expired_oplogs: usize,
    /// Own oplogs to forward again (pending) or anew (key deletions).
    pub gossip: Vec<Oplog>,
}

enum Ingested {
    Accepted(Oplog),
    Pending(Oplog),
    /// Known oplog that gained master signatures.
    Updated(Oplog),
    Duplicate,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct EntityEngine {
    id: PttID,
    ctx: EngineContext,
    store: EntityStore,
    record: EntityRecord,
    oplogs: BTreeMap<Category, BTreeMap<PttID, Oplog>>,
    pending: BTreeSet<PttID>,
    by_obj: BTreeMap<(Category, PttID), BTreeSet<PttID>>,
    membership: Membership,
    ring: OpKeyRing,
    merkle: BTreeMap<Category, MerkleIndex>,
    objects: BTreeMap<PttID, Object>,
}

impl EntityEngine {
    /// Load an entity from the store (empty if never seen).
    pub fn open(id: PttID, entity_type: EntityType, ctx: EngineContext) -> Result<Self> {
        let store = EntityStore::new(id, ctx.kv.clone());
        let record = store
            .load_record()?
            .unwrap_or_else(|| EntityRecord::pending(id, entity_type));

        let mut engine = EntityEngine {
            id,
            ctx,
            store,
            record,
            oplogs: BTreeMap::new(),
            pending: BTreeSet::new(),
            by_obj: BTreeMap::new(),
            membership: Membership::new(id),
            ring: OpKeyRing::new(),
            merkle: BTreeMap::new(),
            objects: BTreeMap::new(),
        };

        for category in entity_type.categories() {
            let pending: BTreeSet<PttID> = engine.store.pending_ids(category)?.into_iter().collect();
            let mut by_id = BTreeMap::new();
            for oplog in engine.store.load_oplogs(category)? {
                engine
                    .by_obj
                    .entry((category, oplog.obj_id))
                    .or_default()
                    .insert(oplog.id);
                by_id.insert(oplog.id, oplog);
            }
            let index = MerkleIndex::rebuild(
                by_id
                    .values()
                    .filter(|o| !pending.contains(&o.id))
                    .map(|o| (o.id, o.hash, o.create_ts)),
            );
            engine.merkle.insert(category, index);
            engine.pending.extend(pending);
            engine.oplogs.insert(category, by_id);
        }
        engine.objects = engine
            .store
            .load_objects()?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();
        engine.rebuild_membership();
        engine.rebuild_ring();

        log::debug!(
            "EntityEngine {}: opened {} ({} oplogs, {} pending)",
            id.short(),
            engine.record.entity_type.as_str(),
            engine.oplogs.values().map(|m| m.len()).sum::<usize>(),
            engine.pending.len()
        );
        Ok(engine)
    }

    pub fn id(&self) -> PttID {
        self.id
    }

    pub fn record(&self) -> &EntityRecord {
        &self.record
    }

    pub fn entity_type(&self) -> EntityType {
        self.record.entity_type
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn settings(&self) -> EngineSettings {
        self.ctx.settings
    }

    pub fn now(&self) -> Timestamp {
        self.ctx.clock.now()
    }

    fn has_authority(&self) -> bool {
        *self.ctx.authority.borrow()
    }

    fn verify_options(&self, now: Timestamp) -> VerifyOptions {
        VerifyOptions {
            now,
            future_tolerance_secs: self.ctx.settings.future_tolerance_secs,
        }
    }

    fn is_accepted(&self, id: &PttID) -> bool {
        !self.pending.contains(id)
    }

    // -----------------------------------------------------------------------
    // Local identity
    // -----------------------------------------------------------------------

    /// Our key that is a master here, if any.
    pub fn local_master(&self) -> Option<UserKey> {
        self.ctx
            .keys
            .all()
            .into_iter()
            .find(|k| self.membership.is_master(&k.id))
    }

    /// Our key this entity knows us by: master first, then member.
    pub fn local_member(&self) -> Option<UserKey> {
        let keys = self.ctx.keys.all();
        keys.iter()
            .find(|k| self.membership.is_master(&k.id))
            .or_else(|| keys.iter().find(|k| self.membership.is_member(&k.id)))
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    /// Create the entity with `owner` as its only master (`CreateEntity`).
    pub fn bootstrap(&mut self, owner: &UserKey, owner_ids: Vec<PttID>, body: Vec<u8>) -> Result<Submitted> {
        if self.membership.is_created() {
            return Err(EntityError::InvalidOp(format!("{} already exists", self.id)));
        }
        let now = self.now();
        let data = cbor_encode(&CreateEntityData {
            entity_type: self.record.entity_type as u8,
            master_id: owner.id,
            master_pub: owner.pubkey,
            owner_ids,
            body,
        })?;
        let new = NewOplog {
            entity_id: self.id,
            category: Category::Master,
            op: ptt_protocol::oplog::MasterOp::CreateEntity as u32,
            obj_id: self.id,
            pre_log_id: None,
            master_log_id: PttID::ZERO,
            data,
            extra: Vec::new(),
        };
        let signer = owner.signer()?;
        let mut oplog = Oplog::create(new, &signer, now)?;
        oplog.attach_master_sign(&signer, now)?;

        let mut batch = WriteBatch::new();
        self.store_oplog(&mut batch, oplog.clone(), true)?;
        self.rebuild_membership();
        self.apply_effects(&mut batch, &BTreeSet::new())?;
        self.store.commit(batch)?;
        log::info!(
            "EntityEngine {}: created {} by {}",
            self.id.short(),
            self.record.entity_type.as_str(),
            owner.id.short()
        );
        Ok(Submitted {
            gossip: vec![oplog.clone()],
            oplog,
        })
    }

    /// Sign, validate, store and apply a new oplog (`SubmitOp`).
    ///
    /// Master and OpKey oplogs are signed with the identity key itself,
    /// everything else with this identity's OpKey for the entity.
    pub fn submit(&mut self, category: Category, op: u32, obj_id: PttID, data: Vec<u8>) -> Result<Submitted> {
        if !self.record.is_writable() {
            return Err(EntityError::Closed(self.record.status.as_str()));
        }
        if !self.record.entity_type.categories().contains(&category) {
            return Err(EntityError::InvalidOp(format!(
                "{} has no {} category",
                self.record.entity_type.as_str(),
                category.as_str()
            )));
        }
        let who = match category {
            Category::Master => self.local_master().ok_or(EntityError::NotMaster)?,
            _ => self.local_member().ok_or(EntityError::NotMember)?,
        };
        let now = self.now();
        let mut batch = WriteBatch::new();
        let mut gossip = Vec::new();

        let signer = match category {
            Category::Master | Category::OpKey => who.signer()?,
            _ => self.ensure_opkey(&who, now, &mut batch, &mut gossip)?,
        };
        let pre_log_id = match category {
            Category::Master => self.membership.head_log_id(),
            Category::Member | Category::OpKey => self.chain_head(category, &obj_id),
            _ => self.objects.get(&obj_id).map(|o| o.head_log_id),
        };
        let oplog = self.sign_oplog(&who, &signer, category, op, obj_id, pre_log_id, data, now)?;

        // validate before the oplog is stored; an OpKey issued above stays
        let valid = match category {
            Category::Master => apply_master(self.membership.current(), &oplog).map(|_| ()),
            Category::Member => self.membership.authorize_member_op(&oplog),
            Category::OpKey => Ok(()),
            _ => self.validate_domain(&oplog),
        };
        if let Err(e) = valid {
            if !batch.is_empty() {
                self.apply_effects(&mut batch, &BTreeSet::new())?;
                self.store.commit(batch)?;
            }
            return Err(e);
        }

        let accepted = !oplog.master_signs.is_empty();
        self.store_oplog(&mut batch, oplog.clone(), accepted)?;
        if category.is_membership() && accepted {
            self.rebuild_membership();
        }
        let touched: BTreeSet<(Category, PttID)> = [(category, obj_id)].into_iter().collect();
        self.apply_effects(&mut batch, &touched)?;
        self.store.commit(batch)?;

        gossip.push(oplog.clone());
        Ok(Submitted { oplog, gossip })
    }

    fn sign_oplog(
        &self,
        who: &UserKey,
        signer: &OpSigner,
        category: Category,
        op: u32,
        obj_id: PttID,
        pre_log_id: Option<PttID>,
        data: Vec<u8>,
        now: Timestamp,
    ) -> Result<Oplog> {
        let master_log_id = self
            .membership
            .head_log_id()
            .ok_or_else(|| EntityError::NotFound(self.id.to_string()))?;
        let new = NewOplog {
            entity_id: self.id,
            category,
            op,
            obj_id,
            pre_log_id,
            master_log_id,
            data,
            extra: Vec::new(),
        };
        let mut oplog = Oplog::create(new, signer, now)?;
        if self.membership.is_master(&who.id) {
            oplog.attach_master_sign(&who.signer()?, now)?;
        }
        Ok(oplog)
    }

    /// Signer for domain writes by `who`, issuing an OpKey when needed.
    ///
    /// Keys are issued only while this device holds write authority (leads
    /// its Me raft group); other devices re-derive the leader's key.
    fn ensure_opkey(
        &mut self,
        who: &UserKey,
        now: Timestamp,
        batch: &mut WriteBatch,
        gossip: &mut Vec<Oplog>,
    ) -> Result<OpSigner> {
        let renew_secs = self.ctx.settings.renew_opkey_secs;
        let current = self
            .ring
            .signing_key(&who.id, now)
            .map(|k| (k.signer(now), k.needs_renewal(now, renew_secs)));
        let authority = self.has_authority();
        match current {
            Some((Ok(signer), false)) => return Ok(signer),
            Some((Ok(signer), true)) if !authority => return Ok(signer),
            _ if !authority => return Err(EntityError::NoAuthority),
            _ => {}
        }

        let mut key = OpKey::issue(self.id, who.id, who.private(), self.ctx.settings.expire_opkey_secs, now)?;
        let data = cbor_encode(&key.to_create_data())?;
        let oplog = self.sign_oplog(
            who,
            &who.signer()?,
            Category::OpKey,
            OpKeyOp::CreateOpKey as u32,
            key.id,
            None,
            data,
            now,
        )?;
        let accepted = !oplog.master_signs.is_empty();
        key.log_id = Some(oplog.id);
        let signer = key.signer(now)?;
        self.store_oplog(batch, oplog.clone(), accepted)?;
        self.rebuild_ring();
        log::info!(
            "EntityEngine {}: issued OpKey {} for {}",
            self.id.short(),
            key.id.short(),
            who.id.short()
        );
        gossip.push(oplog);
        Ok(signer)
    }

    /// Retire one of our OpKeys (`RevokeOpKey`).
    pub fn revoke_opkey(&mut self, key_hash: &[u8; 32]) -> Result<Submitted> {
        self.end_opkey(key_hash, OpKeyEndReason::Revoked)
    }

    fn end_opkey(&mut self, key_hash: &[u8; 32], reason: OpKeyEndReason) -> Result<Submitted> {
        let key = self
            .ring
            .all()
            .into_iter()
            .find(|k| k.hash == *key_hash)
            .cloned()
            .ok_or_else(|| EntityError::NotFound(hex::encode(key_hash)))?;
        if !self.ctx.keys.holds(&key.owner_id) {
            return Err(EntityError::NotMember);
        }
        let op = match reason {
            OpKeyEndReason::Revoked => OpKeyOp::RevokeOpKey,
            OpKeyEndReason::Expired => OpKeyOp::DeleteOpKey,
        };
        let data = cbor_encode(&EndOpKeyData {
            key_id: key.id,
            key_hash: key.hash,
            reason,
        })?;
        self.submit(Category::OpKey, op as u32, key.id, data)
    }

    fn chain_head(&self, category: Category, obj_id: &PttID) -> Option<PttID> {
        let ids = self.by_obj.get(&(category, *obj_id))?;
        let by_id = self.oplogs.get(&category)?;
        let chain = ObjectChain::from_links(ids.iter().filter_map(|id| by_id.get(id)).map(ChainLink::of));
        chain.resolve().head().copied()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Verify, merge and apply oplogs from a peer (`ReceiveOp`).
    ///
    /// Membership oplogs are handled first; an oplog signed under a master
    /// oplog that arrives later in the same batch is retried until a pass
    /// makes no progress.
    pub fn receive(&mut self, mut oplogs: Vec<Oplog>) -> Result<ReceiveOutcome> {
        let now = self.now();
        oplogs.sort_by(|a, b| (a.category, a.create_ts, a.id).cmp(&(b.category, b.create_ts, b.id)));

        let mut outcome = ReceiveOutcome::default();
        let mut batch = WriteBatch::new();
        let mut touched = BTreeSet::new();
        let mut queue = oplogs;
        loop {
            let mut retry = Vec::new();
            let mut progress = false;
            for oplog in queue {
                match self.ingest(&mut batch, &oplog, now) {
                    Ok(Ingested::Accepted(o)) => {
                        progress = true;
                        outcome.accepted += 1;
                        touched.insert((o.category, o.obj_id));
                        outcome.gossip.push(o);
                    }
                    Ok(Ingested::Pending(o)) => {
                        progress = true;
                        outcome.pending += 1;
                        outcome.gossip.push(o);
                    }
                    Ok(Ingested::Updated(o)) => outcome.gossip.push(o),
                    Ok(Ingested::Duplicate) => outcome.duplicates += 1,
                    Err(EntityError::Oplog(OplogError::UnknownMaster(_)))
                    | Err(EntityError::Oplog(OplogError::UnknownCreator(_)))
                    | Err(EntityError::MissingParent(_)) => retry.push(oplog),
                    Err(e) => {
                        log::debug!(
                            "EntityEngine {}: rejected {} {}: {}",
                            self.id.short(),
                            oplog.category.as_str(),
                            oplog.id.short(),
                            e
                        );
                        outcome.rejected += 1;
                        if e.kind().penalises_peer() {
                            outcome.penalised += 1;
                        }
                    }
                }
            }
            if retry.is_empty() {
                break;
            }
            if !progress {
                outcome.deferred = retry.len();
                break;
            }
            queue = retry;
        }

        self.apply_effects(&mut batch, &touched)?;
        self.store.commit(batch)?;
        Ok(outcome)
    }

    fn ingest(&mut self, batch: &mut WriteBatch, incoming: &Oplog, now: Timestamp) -> Result<Ingested> {
        if incoming.entity_id != self.id {
            return Err(EntityError::InvalidOp("oplog of another entity".into()));
        }
        if !self.record.entity_type.categories().contains(&incoming.category) {
            return Err(EntityError::InvalidOp(format!(
                "unexpected category {}",
                incoming.category.as_str()
            )));
        }
        let opts = self.verify_options(now);

        // known oplog: union the master signatures
        if let Some(existing) = self.oplogs.get(&incoming.category).and_then(|m| m.get(&incoming.id)) {
            let mut merged = existing.clone();
            if merged.merge_master_signs(incoming)? == 0 {
                return Ok(Ingested::Duplicate);
            }
            let verified = merged.verify(&self.membership, opts)?;
            let was_pending = self.pending.contains(&merged.id);
            let accepted = verified.master_signed || merged.is_bootstrap();
            self.store_oplog(batch, merged.clone(), accepted)?;
            if was_pending && accepted {
                if merged.category.is_membership() {
                    self.rebuild_membership();
                }
                return Ok(Ingested::Accepted(merged));
            }
            return Ok(Ingested::Updated(merged));
        }

        let verified = incoming.verify(&self.membership, opts)?;
        if incoming.category == Category::Member {
            self.membership.authorize_member_op(incoming)?;
        }
        let mut oplog = incoming.clone();
        let mut master_signed = verified.master_signed;
        if let Some(master) = self.local_master() {
            if !oplog.has_master_sign_from(&master.id) {
                // a co-signature vouches for the op, so it must apply
                if oplog.category.is_domain() {
                    self.validate_domain(&oplog)?;
                }
                if oplog.attach_master_sign(&master.signer()?, now)? {
                    master_signed = true;
                }
            }
        }
        let accepted = master_signed || oplog.is_bootstrap();
        self.store_oplog(batch, oplog.clone(), accepted)?;
        if !accepted {
            return Ok(Ingested::Pending(oplog));
        }
        if oplog.category.is_membership() {
            self.rebuild_membership();
        }
        Ok(Ingested::Accepted(oplog))
    }

    /// Check a domain oplog against the object state it builds on.
    ///
    /// That state is the replay of the stored chain ending at `pre_log_id`.
    /// A second root for an object whose root has another creator is a
    /// conflict.
    fn validate_domain(&self, oplog: &Oplog) -> Result<()> {
        let table = DecodeTable::for_type(self.record.entity_type);
        let by_id = self.oplogs.get(&oplog.category);
        let Some(pre) = oplog.pre_log_id else {
            let rival = self
                .by_obj
                .get(&(oplog.category, oplog.obj_id))
                .into_iter()
                .flatten()
                .filter_map(|id| by_id.and_then(|m| m.get(id)))
                .find(|o| o.pre_log_id.is_none() && o.creator_id != oplog.creator_id);
            if let Some(rival) = rival {
                return Err(EntityError::Conflict(format!(
                    "{} already created by {}",
                    oplog.obj_id.short(),
                    rival.creator_id.short()
                )));
            }
            table.apply(None, oplog)?;
            return Ok(());
        };

        let mut path = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(pre);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(EntityError::InvalidOp(format!("cycle at {}", id.short())));
            }
            let parent = by_id
                .and_then(|m| m.get(&id))
                .filter(|o| o.obj_id == oplog.obj_id)
                .ok_or(EntityError::MissingParent(id))?;
            path.push(parent);
            cursor = parent.pre_log_id;
        }
        path.reverse();
        let prev = table.replay(path).map(|(object, _)| object);
        table.apply(prev.as_ref(), oplog)?;
        Ok(())
    }

    fn store_oplog(&mut self, batch: &mut WriteBatch, oplog: Oplog, accepted: bool) -> Result<()> {
        self.store.put_oplog(batch, &oplog, !accepted)?;
        let category = oplog.category;
        if accepted {
            let was_pending = self.pending.remove(&oplog.id);
            let index = self.merkle.entry(category).or_default();
            if was_pending || !index.contains(&oplog.id, oplog.create_ts) {
                let updates = index.insert(oplog.id, oplog.hash, oplog.create_ts);
                self.store.put_merkle(batch, category, &updates)?;
            }
        } else {
            self.pending.insert(oplog.id);
        }
        self.by_obj
            .entry((category, oplog.obj_id))
            .or_default()
            .insert(oplog.id);
        self.oplogs.entry(category).or_default().insert(oplog.id, oplog);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived state
    // -----------------------------------------------------------------------

    fn rebuild_membership(&mut self) {
        let pending = &self.pending;
        let masters = self
            .oplogs
            .get(&Category::Master)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|o| !pending.contains(&o.id));
        let members = self
            .oplogs
            .get(&Category::Member)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|o| !pending.contains(&o.id));
        self.membership.rebuild(masters, members);
        if let Some(record) = self.membership.record() {
            if record.status != self.record.status {
                log::info!(
                    "EntityEngine {}: {} -> {}",
                    self.id.short(),
                    self.record.status.as_str(),
                    record.status.as_str()
                );
            }
            self.record = record;
        }
    }

    /// Rebuild the OpKey ring from the opkey category.
    ///
    /// Keys owned by one of our identities get their private half
    /// re-derived, so any device holding the user key can sign with them.
    fn rebuild_ring(&mut self) {
        let keys = self.ctx.keys.all();
        let mut ops: Vec<&Oplog> = self
            .oplogs
            .get(&Category::OpKey)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|o| !self.pending.contains(&o.id) || keys.iter().any(|k| k.id == o.creator_id))
            .collect();
        ops.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));

        let mut ring = OpKeyRing::new();
        for oplog in ops {
            match OpKeyOp::from_u32(oplog.op) {
                Some(OpKeyOp::CreateOpKey) => {
                    let Ok(data) = oplog.decode_data::<CreateOpKeyData>() else { continue };
                    if data.owner_id != oplog.creator_id {
                        continue;
                    }
                    let master_private = keys.iter().find(|k| k.id == data.owner_id).map(|k| k.private());
                    let key = match OpKey::from_oplog(self.id, &data, oplog.id, oplog.create_ts, master_private) {
                        Ok(key) => key,
                        Err(e) => {
                            log::warn!("EntityEngine {}: bad OpKey {}: {}", self.id.short(), oplog.id.short(), e);
                            continue;
                        }
                    };
                    let root = self
                        .membership
                        .masters_at(&oplog.master_log_id)
                        .and_then(|m| m.get(&data.owner_id).copied())
                        .or_else(|| self.membership.member_pubkey(&data.owner_id, oplog.create_ts));
                    if let Some(root) = root {
                        if key.verify_extra(&root, oplog.create_ts).is_err() {
                            continue;
                        }
                    }
                    ring.insert(key);
                }
                Some(OpKeyOp::RevokeOpKey) | Some(OpKeyOp::DeleteOpKey) => {
                    if let Ok(data) = oplog.decode_data::<EndOpKeyData>() {
                        ring.mark_deleted(&data.key_hash);
                    }
                }
                None => {}
            }
        }
        self.ring = ring;
    }

    /// Replay what the touched chains affect and queue the writes.
    fn apply_effects(&mut self, batch: &mut WriteBatch, touched: &BTreeSet<(Category, PttID)>) -> Result<()> {
        if touched.iter().any(|(c, _)| c.is_membership()) {
            self.rebuild_membership();
        }
        if touched.iter().any(|(c, _)| *c == Category::OpKey) {
            self.rebuild_ring();
        }
        for (category, obj_id) in touched.iter().filter(|(c, _)| c.is_domain()) {
            self.replay_object(batch, *category, obj_id)?;
        }
        self.store.put_record(batch, &self.record)?;
        Ok(())
    }

    /// Recompute one object's head from its chain.
    ///
    /// Accepted oplogs count for everyone; pending ones only for their
    /// creator, so a member reads its own writes before a master co-signs.
    fn replay_object(&mut self, batch: &mut WriteBatch, category: Category, obj_id: &PttID) -> Result<()> {
        let table = DecodeTable::for_type(self.record.entity_type);
        let replayed = {
            let keys = self.ctx.keys.all();
            let by_id = self.oplogs.get(&category);
            let visible: BTreeMap<PttID, &Oplog> = self
                .by_obj
                .get(&(category, *obj_id))
                .into_iter()
                .flatten()
                .filter_map(|id| by_id.and_then(|m| m.get(id)))
                .filter(|o| self.is_accepted(&o.id) || keys.iter().any(|k| k.id == o.creator_id))
                .map(|o| (o.id, o))
                .collect();
            let chain = ObjectChain::from_links(visible.values().map(|o| ChainLink::of(o)));
            let path: Vec<&Oplog> = chain
                .resolve()
                .path
                .iter()
                .filter_map(|id| visible.get(id).copied())
                .collect();
            table.replay(path)
        };

        match replayed {
            Some((object, blocks)) => {
                self.store.put_blocks(batch, obj_id, &blocks);
                self.store.put_object(batch, &object)?;
                self.objects.insert(object.id, object);
            }
            None => {
                if self.objects.remove(obj_id).is_some() {
                    self.store.delete_object(batch, obj_id);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Expire stale pending oplogs and our own expired OpKeys.
    pub fn housekeeping(&mut self) -> Result<Housekeeping> {
        let now = self.now();
        let cutoff = now.minus_seconds(self.ctx.settings.expire_oplog_secs);
        let mut out = Housekeeping::default();
        let mut batch = WriteBatch::new();
        let mut touched = BTreeSet::new();

        let stale: Vec<Oplog> = self
            .pending
            .iter()
            .filter_map(|id| self.find_oplog(id))
            .filter(|o| o.create_ts < cutoff)
            .cloned()
            .collect();
        for oplog in stale {
            log::debug!(
                "EntityEngine {}: pending {} {} expired",
                self.id.short(),
                oplog.category.as_str(),
                oplog.id.short()
            );
            self.store.delete_oplog(&mut batch, &oplog);
            self.pending.remove(&oplog.id);
            if let Some(m) = self.oplogs.get_mut(&oplog.category) {
                m.remove(&oplog.id);
            }
            if let Some(ids) = self.by_obj.get_mut(&(oplog.category, oplog.obj_id)) {
                ids.remove(&oplog.id);
            }
            touched.insert((oplog.category, oplog.obj_id));
            out.expired_oplogs += 1;
        }
        self.apply_effects(&mut batch, &touched)?;
        self.store.commit(batch)?;

        // our pending oplogs still need a master co-signature
        out.gossip.extend(self.own_pending());

        if self.has_authority() && self.record.is_writable() {
            self.ring.sweep(now);
            let ended: BTreeSet<PttID> = self
                .oplogs
                .get(&Category::OpKey)
                .into_iter()
                .flat_map(|m| m.values())
                .filter(|o| o.op != OpKeyOp::CreateOpKey as u32)
                .map(|o| o.obj_id)
                .collect();
            let expired: Vec<[u8; 32]> = self
                .ring
                .all()
                .into_iter()
                .filter(|k| k.is_expired(now) && !ended.contains(&k.id) && self.ctx.keys.holds(&k.owner_id))
                .map(|k| k.hash)
                .collect();
            for hash in expired {
                match self.end_opkey(&hash, OpKeyEndReason::Expired) {
                    Ok(submitted) => out.gossip.extend(submitted.gossip),
                    Err(e) => log::warn!("EntityEngine {}: cannot retire OpKey: {}", self.id.short(), e),
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn find_oplog(&self, id: &PttID) -> Option<&Oplog> {
        self.oplogs.values().find_map(|m| m.get(id))
    }

    /// Oplogs of a category ordered by `(createTS, id)`, pending included.
    pub fn oplog_list(&self, category: Category) -> Vec<Oplog> {
        let mut out: Vec<Oplog> = self
            .oplogs
            .get(&category)
            .into_iter()
            .flat_map(|m| m.values())
            .map(|o| {
                let mut o = o.clone();
                o.is_sync = self.is_accepted(&o.id);
                o
            })
            .collect();
        out.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
        out
    }

    /// Rebuild every merkle index from the accepted oplogs (`ForceSync`).
    pub fn reindex(&mut self) {
        let pending = &self.pending;
        for (category, by_id) in &self.oplogs {
            let index = MerkleIndex::rebuild(
                by_id
                    .values()
                    .filter(|o| !pending.contains(&o.id))
                    .map(|o| (o.id, o.hash, o.create_ts)),
            );
            self.merkle.insert(*category, index);
        }
    }

    pub fn merkle_index(&self, category: Category) -> Option<&MerkleIndex> {
        self.merkle.get(&category)
    }

    pub fn merkle_nodes(&self, category: Category, level: u8, start: i64, end: i64) -> Result<Vec<MerkleNode>> {
        match self.merkle.get(&category) {
            Some(index) => index
                .nodes(level, start, end)
                .map_err(|e| EntityError::InvalidOp(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Accepted oplogs created in `[start, end)`, capped at `limit`.
    pub fn oplogs_in_window(&self, category: Category, start: i64, end: i64, limit: usize) -> Vec<Oplog> {
        let (Some(index), Some(by_id)) = (self.merkle.get(&category), self.oplogs.get(&category)) else {
            return Vec::new();
        };
        index
            .ids_in_range(start, end)
            .iter()
            .filter_map(|id| by_id.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn oplogs_by_ids(&self, category: Category, ids: &[PttID]) -> Vec<Oplog> {
        let Some(by_id) = self.oplogs.get(&category) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| by_id.get(id)).cloned().collect()
    }

    /// Pending oplogs this node created.
    pub fn own_pending(&self) -> Vec<Oplog> {
        self.pending
            .iter()
            .filter_map(|id| self.find_oplog(id))
            .filter(|o| self.ctx.keys.holds(&o.creator_id))
            .cloned()
            .collect()
    }

    /// Every accepted oplog, membership first (`ExportBundle`).
    pub fn export_bundle(&self) -> Vec<Oplog> {
        let mut out: Vec<Oplog> = self
            .oplogs
            .values()
            .flat_map(|m| m.values())
            .filter(|o| self.is_accepted(&o.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.category, a.create_ts, a.id).cmp(&(b.category, b.create_ts, b.id)));
        out
    }

    /// Alive OpKeys.
    pub fn opkey_infos(&mut self) -> Vec<OpKeyInfo> {
        let now = self.now();
        self.ring.alive(now).iter().map(|k| k.info()).collect()
    }

    /// Every OpKey on record, retired ones included.
    pub fn opkey_history(&self) -> Vec<OpKeyInfo> {
        self.ring.all().into_iter().map(|k| k.info()).collect()
    }

    pub fn object_list(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn op_name(&self, oplog: &Oplog) -> &'static str {
        use ptt_protocol::oplog::{MasterOp, MemberOp};
        match oplog.category {
            Category::Master => MasterOp::from_u32(oplog.op).map(|o| o.as_str()).unwrap_or("Unknown"),
            Category::Member => MemberOp::from_u32(oplog.op).map(|o| o.as_str()).unwrap_or("Unknown"),
            Category::OpKey => OpKeyOp::from_u32(oplog.op).map(|o| o.as_str()).unwrap_or("Unknown"),
            c => DecodeTable::for_type(self.record.entity_type).op_name(c, oplog.op),
        }
    }

    // -----------------------------------------------------------------------
    // Identify
    // -----------------------------------------------------------------------

    fn identify_hash(&self, nonce: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(IDENTIFY_TAG);
        hasher.update(self.id.as_bytes());
        hasher.update(nonce);
        *hasher.finalize().as_bytes()
    }

    /// Prove membership to a peer by signing its nonce.
    pub fn identify_sign(&self, nonce: &[u8; 32]) -> Option<SignInfo> {
        let who = self.local_member()?;
        let signer = who.signer().ok()?;
        signer.sign(&self.id, &self.identify_hash(nonce), self.now()).ok()
    }

    /// Check a peer's proof; returns the proven member id.
    pub fn verify_identify(&self, nonce: &[u8; 32], sign: &SignInfo) -> Option<PttID> {
        let id = sign.signer_id;
        let root = self
            .membership
            .master_pubkey(&id)
            .or_else(|| self.membership.member(&id).filter(|m| m.status.is_alive()).map(|m| m.pubkey))?;
        sign.verify_with_root(&self.id, &self.identify_hash(nonce), &root, sign.sign_ts, &self.id)
            .ok()
            .map(|_| id)
    }
}

impl ObjectSource for EntityEngine {
    fn object(&self, id: &PttID) -> Option<Object> {
        self.objects.get(id).cloned()
    }

    fn objects(&self, kind: ObjectKind) -> Vec<Object> {
        self.objects.values().filter(|o| o.kind == kind).cloned().collect()
    }

    fn block_lines(&self, obj_id: &PttID, block: &BlockRef) -> service::Result<Vec<Vec<u8>>> {
        self.store
            .block_lines(obj_id, block)
            .map_err(|e| service::ServiceError::NotFound(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::service::board::{self, ArticleData, BoardOp, CommentData, CommentType};
    use crate::storage::MemoryStore;
    use ptt_protocol::oplog::{AddMemberData, DeleteMemberData, MemberOp};
    use ptt_protocol::ErrorKind;

    pub(crate) struct Harness {
        pub kv: Arc<dyn KvStore>,
        pub keys: Arc<KeyStore>,
        pub clock: Arc<Clock>,
        pub authority: watch::Sender<bool>,
    }

    impl Harness {
        pub(crate) fn new(clock: Arc<Clock>) -> Self {
            let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let keys = Arc::new(KeyStore::load_or_create(kv.clone()).unwrap());
            let (authority, _) = watch::channel(true);
            Harness {
                kv,
                keys,
                clock,
                authority,
            }
        }

        pub(crate) fn ctx(&self) -> EngineContext {
            EngineContext {
                kv: self.kv.clone(),
                keys: self.keys.clone(),
                clock: self.clock.clone(),
                authority: self.authority.subscribe(),
                settings: EngineSettings::from(&Config::default()),
            }
        }

        pub(crate) fn open(&self, id: PttID, t: EntityType) -> EntityEngine {
            EntityEngine::open(id, t, self.ctx()).unwrap()
        }
    }

    fn clock() -> Arc<Clock> {
        Arc::new(Clock::frozen(Timestamp::from_seconds(1_700_000_000)))
    }

    fn new_board(h: &Harness) -> EntityEngine {
        let owner = h.keys.user();
        let mut engine = h.open(PttID::new_under(&owner.id), EntityType::Board);
        engine.bootstrap(&owner, vec![owner.id], b"board".to_vec()).unwrap();
        engine
    }

    fn article(lines: &[&str]) -> Vec<u8> {
        cbor_encode(&ArticleData {
            title: "t".into(),
            lines: lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
            media_ids: vec![],
        })
        .unwrap()
    }

    fn admit(owner: &mut EntityEngine, key: &UserKey) -> Oplog {
        owner
            .submit(
                Category::Member,
                MemberOp::AddMember as u32,
                key.id,
                cbor_encode(&AddMemberData {
                    member_id: key.id,
                    member_pub: key.pubkey,
                    node_id: None,
                })
                .unwrap(),
            )
            .unwrap()
            .oplog
    }

    /// Sign an oplog as `key` without the local checks `submit` runs.
    fn sign_unchecked(
        engine: &mut EntityEngine,
        key: &UserKey,
        category: Category,
        op: u32,
        obj_id: PttID,
        pre: Option<PttID>,
        data: Vec<u8>,
    ) -> Oplog {
        let now = engine.now();
        let signer = engine
            .ensure_opkey(key, now, &mut WriteBatch::new(), &mut Vec::new())
            .unwrap();
        engine.sign_oplog(key, &signer, category, op, obj_id, pre, data, now).unwrap()
    }

    /// An owner with members `b` and `c`, and `b`'s replica.
    struct Board3 {
        owner: EntityEngine,
        b: EntityEngine,
        b_key: UserKey,
        c_key: UserKey,
    }

    fn board_with_two_members() -> Board3 {
        let clock = clock();
        let owner_h = Harness::new(clock.clone());
        let b_h = Harness::new(clock.clone());
        let c_h = Harness::new(clock.clone());
        let mut owner = new_board(&owner_h);
        let b_key = b_h.keys.user();
        let c_key = c_h.keys.user();
        admit(&mut owner, &b_key);
        admit(&mut owner, &c_key);
        let mut b = b_h.open(owner.id(), EntityType::Board);
        assert_eq!(b.receive(owner.export_bundle()).unwrap().rejected, 0);
        Board3 {
            owner,
            b,
            b_key,
            c_key,
        }
    }

    #[test]
    fn test_member_cannot_delete_other_member() {
        let Board3 {
            mut owner,
            mut b,
            b_key,
            c_key,
            ..
        } = board_with_two_members();
        let data = cbor_encode(&DeleteMemberData { member_id: c_key.id }).unwrap();

        let err = b
            .submit(Category::Member, MemberOp::DeleteMember as u32, c_key.id, data.clone())
            .unwrap_err();
        assert_eq!(err, EntityError::NotMaster);
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(b.membership().is_member(&c_key.id));

        // the same op arriving from the wire is refused, not co-signed
        let head = b.chain_head(Category::Member, &c_key.id);
        let forged = sign_unchecked(&mut b, &b_key, Category::Member, MemberOp::DeleteMember as u32, c_key.id, head, data);
        let mut wire = b.own_pending();
        wire.push(forged);
        let outcome = owner.receive(wire).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.penalised, 1);
        assert!(owner.membership().is_member(&c_key.id));
    }

    #[test]
    fn test_member_cannot_add_member() {
        let Board3 { mut owner, mut b, b_key, .. } = board_with_two_members();
        let d = Harness::new(clock());
        let d_key = d.keys.user();
        let data = cbor_encode(&AddMemberData {
            member_id: d_key.id,
            member_pub: d_key.pubkey,
            node_id: None,
        })
        .unwrap();

        let err = b
            .submit(Category::Member, MemberOp::AddMember as u32, d_key.id, data.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(!b.membership().is_member(&d_key.id));

        let forged = sign_unchecked(&mut b, &b_key, Category::Member, MemberOp::AddMember as u32, d_key.id, None, data);
        let mut wire = b.own_pending();
        wire.push(forged);
        let outcome = owner.receive(wire).unwrap();
        assert_eq!(outcome.rejected, 1);
        assert!(!owner.membership().is_member(&d_key.id));
    }

    #[test]
    fn test_member_can_leave() {
        let Board3 {
            mut owner,
            mut b,
            b_key,
            c_key,
            ..
        } = board_with_two_members();
        let leave = b
            .submit(
                Category::Member,
                MemberOp::DeleteMember as u32,
                b_key.id,
                cbor_encode(&DeleteMemberData { member_id: b_key.id }).unwrap(),
            )
            .unwrap();
        assert!(leave.oplog.master_signs.is_empty());

        let outcome = owner.receive(leave.gossip).unwrap();
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.accepted, 2);
        assert!(!owner.membership().is_member(&b_key.id));
        assert!(owner.membership().is_member(&c_key.id));
    }

    #[test]
    fn test_cosign_requires_applicable_op() {
        let Board3 {
            mut owner,
            mut b,
            b_key,
            ..
        } = board_with_two_members();
        let owner_id = owner.local_master().unwrap().id;
        let a1 = PttID::new_under(&owner.id());
        let art = owner
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article(&["owner"]))
            .unwrap();
        b.receive(art.gossip).unwrap();

        // a second root for the owner's article
        let rival = sign_unchecked(&mut b, &b_key, Category::Board, BoardOp::CreateArticle as u32, a1, None, article(&["mine"]));
        // an update with nothing to update
        let stray = sign_unchecked(
            &mut b,
            &b_key,
            Category::Board,
            BoardOp::UpdateArticle as u32,
            PttID::new_under(&owner.id()),
            None,
            article(&["x"]),
        );
        let mut wire = b.own_pending();
        wire.push(rival.clone());
        wire.push(stray);
        let outcome = owner.receive(wire).unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected, 2);
        assert!(owner.oplog_list(Category::Board).iter().all(|o| o.id != rival.id));

        let head = owner.object(&a1).unwrap();
        assert_eq!(head.creator_id, owner_id);
        assert_eq!(head.head_log_id, art.oplog.id);
        assert_eq!(board::article_list(&owner).len(), 1);
    }

    #[test]
    fn test_bootstrap_and_first_write_issues_one_opkey() {
        let h = Harness::new(clock());
        let mut engine = new_board(&h);
        assert!(engine.record().is_writable());
        assert_eq!(engine.membership().masters().len(), 1);

        let a1 = PttID::new_under(&engine.id());
        let submitted = engine
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article(&["hello"]))
            .unwrap();
        assert_eq!(submitted.gossip.len(), 2);
        assert_eq!(submitted.gossip[0].category, Category::OpKey);
        assert_eq!(engine.opkey_infos().len(), 1);

        let a2 = PttID::new_under(&engine.id());
        let second = engine
            .submit(Category::Board, BoardOp::CreateArticle as u32, a2, article(&["again"]))
            .unwrap();
        assert_eq!(second.gossip.len(), 1);
        assert_eq!(engine.opkey_infos().len(), 1);
        assert_eq!(board::article_list(&engine).len(), 2);
    }

    #[test]
    fn test_no_authority_no_key() {
        let h = Harness::new(clock());
        let mut engine = new_board(&h);
        h.authority.send_replace(false);
        let err = engine
            .submit(Category::Board, BoardOp::CreateArticle as u32, PttID::random(), article(&["x"]))
            .unwrap_err();
        assert_eq!(err, EntityError::NoAuthority);
        assert!(engine.oplog_list(Category::OpKey).is_empty());
        assert!(engine.oplog_list(Category::Board).is_empty());
    }

    #[test]
    fn test_reopen_restores_state() {
        let h = Harness::new(clock());
        let mut engine = new_board(&h);
        let a1 = PttID::new_under(&engine.id());
        engine
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article(&["hello"]))
            .unwrap();
        let id = engine.id();
        let root = engine.merkle_index(Category::Board).unwrap().root();
        drop(engine);

        let mut again = h.open(id, EntityType::Board);
        assert!(again.record().is_writable());
        assert_eq!(again.opkey_infos().len(), 1);
        assert_eq!(board::article_list(&again).len(), 1);
        assert_eq!(again.merkle_index(Category::Board).unwrap().root(), root);

        // a second write after restart reuses the key
        let a2 = PttID::new_under(&id);
        let submitted = again
            .submit(Category::Board, BoardOp::CreateArticle as u32, a2, article(&["x"]))
            .unwrap();
        assert_eq!(submitted.gossip.len(), 1);
    }

    #[test]
    fn test_member_write_pending_until_cosigned() {
        let clock = clock();
        let owner_h = Harness::new(clock.clone());
        let member_h = Harness::new(clock.clone());
        let mut owner = new_board(&owner_h);
        let id = owner.id();

        // owner admits the member
        let member_key = member_h.keys.user();
        let add = owner
            .submit(
                Category::Member,
                MemberOp::AddMember as u32,
                member_key.id,
                cbor_encode(&AddMemberData {
                    member_id: member_key.id,
                    member_pub: member_key.pubkey,
                    node_id: Some(member_h.keys.node_id()),
                })
                .unwrap(),
            )
            .unwrap();
        assert!(owner.membership().is_member(&member_key.id));

        let mut member = member_h.open(id, EntityType::Board);
        let outcome = member.receive(owner.export_bundle()).unwrap();
        assert_eq!(outcome.rejected, 0);
        assert!(member.membership().is_member(&member_key.id));
        assert!(add.oplog.master_signs.len() == 1);

        // the member comments; pending on its side, visible to itself
        let a1 = PttID::new_under(&id);
        let art = owner
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article(&["body"]))
            .unwrap();
        member.receive(art.gossip.clone()).unwrap();
        let c1 = PttID::new_under(&member_key.id);
        let comment = member
            .submit(
                Category::Board,
                BoardOp::CreateComment as u32,
                c1,
                cbor_encode(&CommentData {
                    article_id: a1,
                    comment_type: CommentType::Push,
                    line: b"push".to_vec(),
                    media_id: None,
                })
                .unwrap(),
            )
            .unwrap();
        assert!(comment.oplog.master_signs.is_empty());
        assert_eq!(member.own_pending().len(), 2);
        assert!(member.object(&c1).is_some());

        // the owner co-signs; the signatures flow back
        let outcome = owner.receive(comment.gossip.clone()).unwrap();
        assert_eq!(outcome.accepted, 2);
        assert!(owner.object(&c1).is_some());
        let back = member.receive(outcome.gossip).unwrap();
        assert_eq!(back.accepted, 2);
        assert!(member.own_pending().is_empty());
        assert_eq!(
            member.merkle_index(Category::Board).unwrap().root(),
            owner.merkle_index(Category::Board).unwrap().root()
        );
    }

    #[test]
    fn test_receive_is_order_independent() {
        let h = Harness::new(clock());
        let mut source = new_board(&h);
        let id = source.id();
        for i in 0..3 {
            source
                .submit(Category::Board, BoardOp::CreateArticle as u32, PttID::new_under(&id), article(&[&format!("{}", i)]))
                .unwrap();
        }
        let mut bundle = source.export_bundle();
        bundle.reverse();

        let other = Harness::new(h.clock.clone());
        let mut replica = other.open(id, EntityType::Board);
        let outcome = replica.receive(bundle).unwrap();
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.deferred, 0);
        assert_eq!(board::article_list(&replica).len(), 3);
        for c in EntityType::Board.categories() {
            assert_eq!(
                replica.merkle_index(c).map(|m| m.root()),
                source.merkle_index(c).map(|m| m.root())
            );
        }

        // a second delivery is all duplicates
        let again = replica.receive(source.export_bundle()).unwrap();
        assert_eq!(again.accepted, 0);
        assert!(again.duplicates > 0);
    }

    #[test]
    fn test_tampered_oplog_penalised() {
        let h = Harness::new(clock());
        let mut source = new_board(&h);
        let id = source.id();
        let mut bundle = source.export_bundle();
        bundle[0].data.push(0);

        let other = Harness::new(h.clock.clone());
        let mut replica = other.open(id, EntityType::Board);
        let outcome = replica.receive(bundle).unwrap();
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.penalised, 1);
        assert!(!replica.membership().is_created());
    }

    #[test]
    fn test_pending_expires() {
        let clock = clock();
        let owner_h = Harness::new(clock.clone());
        let member_h = Harness::new(clock.clone());
        let mut owner = new_board(&owner_h);
        let id = owner.id();
        let member_key = member_h.keys.user();
        owner
            .submit(
                Category::Member,
                MemberOp::AddMember as u32,
                member_key.id,
                cbor_encode(&AddMemberData {
                    member_id: member_key.id,
                    member_pub: member_key.pubkey,
                    node_id: None,
                })
                .unwrap(),
            )
            .unwrap();
        let mut member = member_h.open(id, EntityType::Board);
        member.receive(owner.export_bundle()).unwrap();

        let a1 = PttID::new_under(&member_key.id);
        member
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article(&["lonely"]))
            .unwrap();
        assert!(member.object(&a1).is_some());

        clock.advance(member.settings().expire_oplog_secs + 1);
        let hk = member.housekeeping().unwrap();
        assert_eq!(hk.expired_oplogs, 2);
        assert!(member.object(&a1).is_none());
        assert!(member.own_pending().is_empty());
    }

    #[test]
    fn test_identify_roundtrip() {
        let h = Harness::new(clock());
        let engine = new_board(&h);
        let nonce = [9u8; 32];
        let sign = engine.identify_sign(&nonce).unwrap();
        assert_eq!(engine.verify_identify(&nonce, &sign), Some(h.keys.user_id()));
        assert_eq!(engine.verify_identify(&[0u8; 32], &sign), None);
    }

    #[test]
    fn test_submit_rejects_invalid_update() {
        let h = Harness::new(clock());
        let mut engine = new_board(&h);
        let err = engine
            .submit(Category::Board, BoardOp::DeleteArticle as u32, PttID::random(), cbor_encode(&()).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ptt_protocol::ErrorKind::BadInput);
        assert!(engine.oplog_list(Category::Board).is_empty());
    }
}
