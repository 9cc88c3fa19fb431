/// Membership: masters and members of one entity, replayed from oplogs.
///
/// The master category holds one chain (`objID = entityID`) rooted at the
/// bootstrap `CreateEntity`. Every master oplog in the DAG gets a snapshot of
/// the masters in force right after it, so oplogs signed under an older
/// `masterLogID` keep verifying after later changes.
///
/// The member category holds one chain per member (`objID = memberID`).
/// - Re-adding a deleted member appends to its chain; history is never rewritten.
/// - A `DeleteMember` only takes effect if its `masterLogID` is on the applied
///   master path.
/// - Only a master at the op's `masterLogID` adds a member; a delete comes
///   from such a master or from the member itself.
/// - Two members deleting each other: the lower op id wins, the other op is
///   recorded as overruled and not applied.
///
/// Replay is a pure function of the accepted oplogs: the same set in any
/// arrival order produces the same state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use ptt_protocol::oplog::chain::{ChainLink, ObjectChain};
use ptt_protocol::oplog::{
    AddMasterData, AddMemberData, Category, CreateEntityData, DeleteMemberData, MasterOp,
    MasterView, MemberOp, MigrateEntityData, MigrateMemberData, Oplog, RemoveMasterData,
    TransferMasterData,
};
use ptt_protocol::{PttID, Status, Timestamp};

use super::{EntityError, EntityRecord, EntityType, Result};

/// Creator timestamps may run this far ahead of the member's admission.
pub const MEMBER_TS_SLACK_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MasterInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "EntityID")]
    pub entity_id: PttID,
    #[serde(skip)]
    pub pubkey: [u8; 32],
    #[serde(rename = "LogID")]
    pub log_id: PttID,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    pub status: Status,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MemberInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "EntityID")]
    pub entity_id: PttID,
    #[serde(skip)]
    pub pubkey: [u8; 32],
    #[serde(rename = "LogID")]
    pub log_id: PttID,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    pub status: Status,
}

// ---------------------------------------------------------------------------
// Master state
// ---------------------------------------------------------------------------

/// Everything the master chain decides, as of one master oplog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterState {
    pub masters: BTreeMap<PttID, MasterInfo>,
    pub status: Status,
    pub owner_ids: Vec<PttID>,
    pub merged_into: Option<PttID>,
    pub updater_id: PttID,
    pub update_ts: Timestamp,
}

impl MasterState {
    pub fn alive_masters(&self) -> impl Iterator<Item = &MasterInfo> {
        self.masters.values().filter(|m| m.status == Status::Alive)
    }

    fn alive_count(&self) -> usize {
        self.alive_masters().count()
    }

    fn pubkeys(&self) -> BTreeMap<PttID, [u8; 32]> {
        self.alive_masters().map(|m| (m.id, m.pubkey)).collect()
    }

    fn promote(&mut self, entity_id: PttID, id: PttID, pubkey: [u8; 32], oplog: &Oplog) {
        self.masters.insert(
            id,
            MasterInfo {
                id,
                entity_id,
                pubkey,
                log_id: oplog.id,
                update_ts: oplog.update_ts,
                status: Status::Alive,
            },
        );
    }

    fn demote(&mut self, id: &PttID, oplog: &Oplog) {
        if let Some(m) = self.masters.get_mut(id) {
            m.status = Status::Deleted;
            m.log_id = oplog.id;
            m.update_ts = oplog.update_ts;
        }
    }
}

/// Apply one master oplog on top of `prev` (`None` only for the bootstrap).
///
/// Pure: used both for replay and for validating a local submission.
pub fn apply_master(prev: Option<&MasterState>, oplog: &Oplog) -> Result<MasterState> {
    let op = MasterOp::from_u32(oplog.op).ok_or_else(|| invalid(oplog))?;
    let entity_id = oplog.entity_id;

    let Some(prev) = prev else {
        if op != MasterOp::CreateEntity {
            return Err(EntityError::InvalidOp(format!(
                "{} without CreateEntity",
                op.as_str()
            )));
        }
        let data: CreateEntityData = oplog.decode_data()?;
        let mut state = MasterState {
            masters: BTreeMap::new(),
            status: Status::Alive,
            owner_ids: if data.owner_ids.is_empty() {
                vec![oplog.creator_id]
            } else {
                data.owner_ids
            },
            merged_into: None,
            updater_id: oplog.creator_id,
            update_ts: oplog.update_ts,
        };
        state.promote(entity_id, data.master_id, data.master_pub, oplog);
        return Ok(state);
    };

    let mut state = prev.clone();
    if !state.masters.get(&oplog.creator_id).is_some_and(|m| m.status == Status::Alive) {
        return Err(EntityError::NotMaster);
    }

    match op {
        MasterOp::CreateEntity => {
            return Err(EntityError::InvalidOp("CreateEntity after bootstrap".into()));
        }
        MasterOp::AddMaster => {
            let data: AddMasterData = oplog.decode_data()?;
            let already = state
                .masters
                .get(&data.master_id)
                .is_some_and(|m| m.status == Status::Alive);
            if !already {
                state.promote(entity_id, data.master_id, data.master_pub, oplog);
            }
        }
        MasterOp::RemoveMaster => {
            let data: RemoveMasterData = oplog.decode_data()?;
            let alive = state
                .masters
                .get(&data.master_id)
                .is_some_and(|m| m.status == Status::Alive);
            if !alive {
                return Err(EntityError::InvalidOp(format!(
                    "{} is not a master",
                    data.master_id.short()
                )));
            }
            if state.alive_count() <= 1 {
                return Err(EntityError::LastMaster);
            }
            state.demote(&data.master_id, oplog);
        }
        MasterOp::TransferMaster => {
            let data: TransferMasterData = oplog.decode_data()?;
            let alive = state
                .masters
                .get(&data.from_id)
                .is_some_and(|m| m.status == Status::Alive);
            if !alive {
                return Err(EntityError::InvalidOp(format!(
                    "{} is not a master",
                    data.from_id.short()
                )));
            }
            state.promote(entity_id, data.to_id, data.to_pub, oplog);
            if data.from_id != data.to_id {
                state.demote(&data.from_id, oplog);
            }
        }
        MasterOp::MigrateEntity => {
            let data: MigrateEntityData = oplog.decode_data()?;
            // owners are Me ids; authority goes to the new owner's user key
            let new_master = PttID::from_pubkey(&data.new_owner_pub);
            state.promote(entity_id, new_master, data.new_owner_pub, oplog);
            state.owner_ids = vec![data.new_owner, data.legacy_owner];
            state.merged_into = data.merged_into;
            state.status = Status::Migrated;
        }
        MasterOp::DeleteEntity => {
            state.status = Status::Deleted;
        }
    }

    state.updater_id = oplog.creator_id;
    state.update_ts = oplog.update_ts;
    Ok(state)
}

fn invalid(oplog: &Oplog) -> EntityError {
    EntityError::InvalidOp(format!(
        "unknown opcode {} in {}",
        oplog.op,
        oplog.category.as_str()
    ))
}

// ---------------------------------------------------------------------------
// Member state
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
struct MemberHistory {
    info: MemberInfo,
    /// `(ts, status, pubkey)` after each applied op, oldest first.
    history: Vec<(Timestamp, Status, [u8; 32])>,
}

impl MemberHistory {
    fn new(entity_id: PttID, id: PttID) -> Self {
        MemberHistory {
            info: MemberInfo {
                id,
                entity_id,
                pubkey: [0u8; 32],
                log_id: PttID::ZERO,
                update_ts: Timestamp::ZERO,
                status: Status::Pending,
            },
            history: Vec::new(),
        }
    }

    fn set(&mut self, status: Status, pubkey: [u8; 32], oplog: &Oplog) {
        self.info.status = status;
        self.info.pubkey = pubkey;
        self.info.log_id = oplog.id;
        self.info.update_ts = oplog.update_ts;
        self.history.push((oplog.create_ts, status, pubkey));
    }

    fn pubkey_at(&self, at: Timestamp) -> Option<[u8; 32]> {
        let limit = at.plus_seconds(MEMBER_TS_SLACK_SECS);
        self.history
            .iter()
            .rev()
            .find(|(ts, _, _)| *ts <= limit)
            .and_then(|(_, status, pk)| (*status == Status::Alive).then_some(*pk))
    }
}

/// A path `DeleteMember`: `creator` deletes `target` via op `id`.
#[derive(Clone, Copy, Debug)]
struct Deletion {
    id: PttID,
    creator: PttID,
    target: PttID,
}

/// Ops that lose a mutual delete. The higher id of each pair is overruled.
fn overruled_deletions(deletions: &[Deletion]) -> BTreeSet<PttID> {
    let mut overruled = BTreeSet::new();
    for a in deletions {
        for b in deletions {
            if a.id < b.id && a.creator == b.target && a.target == b.creator {
                overruled.insert(b.id);
            }
        }
    }
    overruled
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Bootstrap facts that never change after creation.
#[derive(Clone, Debug)]
struct Genesis {
    log_id: PttID,
    entity_type: EntityType,
    creator_id: PttID,
    create_ts: Timestamp,
    body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Membership {
    entity_id: PttID,
    genesis: Option<Genesis>,
    /// Master state after each master oplog, keyed by its id.
    snapshots: BTreeMap<PttID, MasterState>,
    /// Applied master path, root first.
    master_path: Vec<PttID>,
    members: BTreeMap<PttID, MemberHistory>,
    overruled: BTreeSet<PttID>,
}

impl Membership {
    pub fn new(entity_id: PttID) -> Self {
        Membership {
            entity_id,
            genesis: None,
            snapshots: BTreeMap::new(),
            master_path: Vec::new(),
            members: BTreeMap::new(),
            overruled: BTreeSet::new(),
        }
    }

    /// Replay from the accepted master and member oplogs.
    pub fn rebuild<'a, M, N>(&mut self, master_ops: M, member_ops: N)
    where
        M: IntoIterator<Item = &'a Oplog>,
        N: IntoIterator<Item = &'a Oplog>,
    {
        self.replay_masters(master_ops);
        self.replay_members(member_ops);
    }

    fn replay_masters<'a, I: IntoIterator<Item = &'a Oplog>>(&mut self, master_ops: I) {
        self.genesis = None;
        self.snapshots.clear();
        self.master_path.clear();

        let by_id: BTreeMap<PttID, &Oplog> = master_ops
            .into_iter()
            .filter(|o| o.category == Category::Master && o.obj_id == self.entity_id)
            .map(|o| (o.id, o))
            .collect();
        let chain = ObjectChain::from_links(by_id.values().map(|o| ChainLink::of(o)));

        // snapshot every node reachable from a valid bootstrap
        let mut stack: Vec<(PttID, Option<MasterState>)> = chain
            .roots()
            .iter()
            .filter(|l| by_id.get(&l.id).is_some_and(|o| o.is_bootstrap()))
            .map(|l| (l.id, None))
            .collect();
        let mut visited = BTreeSet::new();
        while let Some((id, parent)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(oplog) = by_id.get(&id) else { continue };
            let state = match apply_master(parent.as_ref(), oplog) {
                Ok(state) => state,
                Err(e) => match parent {
                    Some(parent) => {
                        log::debug!(
                            "Membership {}: skipping master op {}: {}",
                            self.entity_id.short(),
                            id.short(),
                            e
                        );
                        parent
                    }
                    None => continue,
                },
            };
            for child in chain.children_of(&id) {
                stack.push((child.id, Some(state.clone())));
            }
            self.snapshots.insert(id, state);
        }

        let resolution = chain.resolve();
        let Some(root) = resolution.root().and_then(|r| by_id.get(r)) else {
            return;
        };
        if !self.snapshots.contains_key(&root.id) {
            return;
        }
        let Ok(data) = root.decode_data::<CreateEntityData>() else {
            return;
        };
        let Some(entity_type) = EntityType::from_u8(data.entity_type) else {
            log::warn!(
                "Membership {}: unknown entity type {}",
                self.entity_id.short(),
                data.entity_type
            );
            return;
        };
        self.genesis = Some(Genesis {
            log_id: root.id,
            entity_type,
            creator_id: root.creator_id,
            create_ts: root.create_ts,
            body: data.body,
        });
        self.master_path = resolution
            .path
            .into_iter()
            .filter(|id| self.snapshots.contains_key(id))
            .collect();
    }

    fn replay_members<'a, I: IntoIterator<Item = &'a Oplog>>(&mut self, member_ops: I) {
        self.members.clear();
        self.overruled.clear();

        let mut by_member: BTreeMap<PttID, BTreeMap<PttID, &Oplog>> = BTreeMap::new();
        for oplog in member_ops {
            if oplog.category == Category::Member && oplog.entity_id == self.entity_id {
                by_member.entry(oplog.obj_id).or_default().insert(oplog.id, oplog);
            }
        }

        let on_path: BTreeSet<PttID> = self.master_path.iter().copied().collect();
        let paths: Vec<(PttID, Vec<&Oplog>)> = by_member
            .iter()
            .map(|(member_id, ops)| {
                let chain = ObjectChain::from_links(ops.values().map(|o| ChainLink::of(o)));
                let path = chain
                    .resolve()
                    .path
                    .iter()
                    .filter_map(|id| ops.get(id).copied())
                    .collect();
                (*member_id, path)
            })
            .collect();

        let deletions: Vec<Deletion> = paths
            .iter()
            .flat_map(|(_, path)| path.iter())
            .filter(|o| o.op == MemberOp::DeleteMember as u32 && on_path.contains(&o.master_log_id))
            .filter(|o| self.authorize_member_op(o).is_ok())
            .filter_map(|o| {
                let data: DeleteMemberData = o.decode_data().ok()?;
                Some(Deletion {
                    id: o.id,
                    creator: o.creator_id,
                    target: data.member_id,
                })
            })
            .collect();
        self.overruled = overruled_deletions(&deletions);

        for (member_id, path) in paths {
            for oplog in path {
                if let Err(e) = self.apply_member(&member_id, oplog, &on_path) {
                    log::debug!(
                        "Membership {}: skipping member op {}: {}",
                        self.entity_id.short(),
                        oplog.id.short(),
                        e
                    );
                }
            }
        }
    }

    fn apply_member(&mut self, member_id: &PttID, oplog: &Oplog, on_path: &BTreeSet<PttID>) -> Result<()> {
        let op = MemberOp::from_u32(oplog.op).ok_or_else(|| invalid(oplog))?;
        let entity_id = self.entity_id;
        self.authorize_member_op(oplog)?;
        match op {
            MemberOp::AddMember => {
                let data: AddMemberData = oplog.decode_data()?;
                if data.member_id != *member_id {
                    return Err(EntityError::InvalidOp("AddMember on another chain".into()));
                }
                self.members
                    .entry(data.member_id)
                    .or_insert_with(|| MemberHistory::new(entity_id, data.member_id))
                    .set(Status::Alive, data.member_pub, oplog);
            }
            MemberOp::DeleteMember => {
                let data: DeleteMemberData = oplog.decode_data()?;
                if data.member_id != *member_id {
                    return Err(EntityError::InvalidOp("DeleteMember on another chain".into()));
                }
                if !on_path.contains(&oplog.master_log_id) {
                    return Err(EntityError::InvalidOp("DeleteMember under a stale master".into()));
                }
                if self.overruled.contains(&oplog.id) {
                    return Err(EntityError::InvalidOp("DeleteMember overruled".into()));
                }
                let entry = self
                    .members
                    .get_mut(&data.member_id)
                    .ok_or_else(|| EntityError::NotFound(data.member_id.to_string()))?;
                let pubkey = entry.info.pubkey;
                entry.set(Status::Deleted, pubkey, oplog);
            }
            MemberOp::MigrateMember => {
                let data: MigrateMemberData = oplog.decode_data()?;
                let entry = self
                    .members
                    .get_mut(&data.from_id)
                    .ok_or_else(|| EntityError::NotFound(data.from_id.to_string()))?;
                let pubkey = entry.info.pubkey;
                entry.set(Status::Migrated, pubkey, oplog);
                self.members
                    .entry(data.to_id)
                    .or_insert_with(|| MemberHistory::new(entity_id, data.to_id))
                    .set(Status::Alive, data.to_pub, oplog);
            }
        }
        Ok(())
    }

    /// Who may write a member op.
    ///
    /// Masters are those alive at the op's `masterLogID`. Adds and
    /// migrations need one; a delete is also open to the member leaving.
    pub fn authorize_member_op(&self, oplog: &Oplog) -> Result<()> {
        let op = MemberOp::from_u32(oplog.op).ok_or_else(|| invalid(oplog))?;
        let by_master = self
            .snapshots
            .get(&oplog.master_log_id)
            .and_then(|s| s.masters.get(&oplog.creator_id))
            .is_some_and(|m| m.status == Status::Alive);
        let allowed = match op {
            MemberOp::AddMember | MemberOp::MigrateMember => by_master,
            MemberOp::DeleteMember => by_master || oplog.creator_id == oplog.obj_id,
        };
        if allowed {
            Ok(())
        } else {
            Err(EntityError::NotMaster)
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_created(&self) -> bool {
        self.genesis.is_some()
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        self.genesis.as_ref().map(|g| g.entity_type)
    }

    /// Master oplog new oplogs are signed under.
    pub fn head_log_id(&self) -> Option<PttID> {
        self.master_path.last().copied()
    }

    pub fn master_path(&self) -> &[PttID] {
        &self.master_path
    }

    pub fn current(&self) -> Option<&MasterState> {
        self.head_log_id().and_then(|id| self.snapshots.get(&id))
    }

    pub fn snapshot(&self, master_log_id: &PttID) -> Option<&MasterState> {
        self.snapshots.get(master_log_id)
    }

    /// Alive masters at the head.
    pub fn masters(&self) -> Vec<MasterInfo> {
        self.current()
            .map(|s| s.alive_masters().cloned().collect())
            .unwrap_or_default()
    }

    /// Every master ever recorded at the head, removed ones included.
    pub fn master_history(&self) -> Vec<MasterInfo> {
        self.current()
            .map(|s| s.masters.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_master(&self, id: &PttID) -> bool {
        self.current()
            .and_then(|s| s.masters.get(id))
            .is_some_and(|m| m.status == Status::Alive)
    }

    pub fn master_pubkey(&self, id: &PttID) -> Option<[u8; 32]> {
        self.current()
            .and_then(|s| s.masters.get(id))
            .filter(|m| m.status == Status::Alive)
            .map(|m| m.pubkey)
    }

    /// Members including masters; masters first.
    pub fn members(&self) -> Vec<MemberInfo> {
        let mut out: Vec<MemberInfo> = self
            .masters()
            .into_iter()
            .map(|m| MemberInfo {
                id: m.id,
                entity_id: m.entity_id,
                pubkey: m.pubkey,
                log_id: m.log_id,
                update_ts: m.update_ts,
                status: m.status,
            })
            .collect();
        let seen: BTreeSet<PttID> = out.iter().map(|m| m.id).collect();
        out.extend(
            self.members
                .values()
                .filter(|m| !seen.contains(&m.info.id))
                .map(|m| m.info.clone()),
        );
        out
    }

    pub fn member(&self, id: &PttID) -> Option<MemberInfo> {
        self.members.get(id).map(|m| m.info.clone())
    }

    pub fn is_member(&self, id: &PttID) -> bool {
        self.is_master(id)
            || self
                .members
                .get(id)
                .is_some_and(|m| m.info.status == Status::Alive)
    }

    pub fn overruled(&self) -> impl Iterator<Item = &PttID> {
        self.overruled.iter()
    }

    /// Derived `{entityID}/meta`; `None` until the bootstrap is accepted.
    pub fn record(&self) -> Option<EntityRecord> {
        let genesis = self.genesis.as_ref()?;
        let head = self.head_log_id()?;
        let state = self.snapshots.get(&head)?;
        Some(EntityRecord {
            id: self.entity_id,
            entity_type: genesis.entity_type,
            status: state.status,
            create_ts: genesis.create_ts,
            update_ts: state.update_ts,
            creator_id: genesis.creator_id,
            updater_id: state.updater_id,
            log_id: genesis.log_id,
            owner_ids: state.owner_ids.clone(),
            merged_into: state.merged_into,
            body: genesis.body.clone(),
        })
    }
}

impl MasterView for Membership {
    fn entity_id(&self) -> PttID {
        self.entity_id
    }

    fn masters_at(&self, master_log_id: &PttID) -> Option<BTreeMap<PttID, [u8; 32]>> {
        self.snapshots.get(master_log_id).map(|s| s.pubkeys())
    }

    fn member_pubkey(&self, member_id: &PttID, at: Timestamp) -> Option<[u8; 32]> {
        self.members.get(member_id).and_then(|m| m.pubkey_at(at))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ptt_protocol::crypto::generate_keypair;
    use ptt_protocol::oplog::{cbor_encode, NewOplog, OpSigner};

    pub(crate) struct User {
        pub id: PttID,
        pub pubkey: [u8; 32],
        pub signer: OpSigner,
    }

    pub(crate) fn user() -> User {
        let (pubkey, private) = generate_keypair();
        let id = PttID::from_pubkey(&pubkey);
        User {
            id,
            pubkey,
            signer: OpSigner::direct(id, private).unwrap(),
        }
    }

    fn ts(s: i64) -> Timestamp {
        Timestamp::from_seconds(1_700_000_000 + s)
    }

    pub(crate) fn create_entity(master: &User, entity_id: PttID, entity_type: EntityType, at: i64) -> Oplog {
        let data = cbor_encode(&CreateEntityData {
            entity_type: entity_type as u8,
            master_id: master.id,
            master_pub: master.pubkey,
            owner_ids: vec![master.id],
            body: b"title".to_vec(),
        })
        .unwrap();
        let new = NewOplog {
            entity_id,
            category: Category::Master,
            op: MasterOp::CreateEntity as u32,
            obj_id: entity_id,
            pre_log_id: None,
            master_log_id: PttID::ZERO,
            data,
            extra: Vec::new(),
        };
        Oplog::create(new, &master.signer, ts(at)).unwrap()
    }

    fn master_op<T: Serialize>(by: &User, entity_id: PttID, pre: &Oplog, op: MasterOp, data: &T, at: i64) -> Oplog {
        let new = NewOplog {
            entity_id,
            category: Category::Master,
            op: op as u32,
            obj_id: entity_id,
            pre_log_id: Some(pre.id),
            master_log_id: pre.id,
            data: cbor_encode(data).unwrap(),
            extra: Vec::new(),
        };
        Oplog::create(new, &by.signer, ts(at)).unwrap()
    }

    fn member_op<T: Serialize>(
        by: &User,
        entity_id: PttID,
        member_id: PttID,
        pre: Option<&Oplog>,
        master_log_id: PttID,
        op: MemberOp,
        data: &T,
        at: i64,
    ) -> Oplog {
        let new = NewOplog {
            entity_id,
            category: Category::Member,
            op: op as u32,
            obj_id: member_id,
            pre_log_id: pre.map(|p| p.id),
            master_log_id,
            data: cbor_encode(data).unwrap(),
            extra: Vec::new(),
        };
        Oplog::create(new, &by.signer, ts(at)).unwrap()
    }

    #[test]
    fn test_bootstrap_record() {
        let a = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);

        let mut m = Membership::new(e);
        m.rebuild([&create], []);

        let record = m.record().unwrap();
        assert_eq!(record.status, Status::Alive);
        assert_eq!(record.entity_type, EntityType::Board);
        assert_eq!(record.log_id, create.id);
        assert_eq!(record.owner_ids, vec![a.id]);
        assert!(m.is_master(&a.id));
        assert_eq!(m.masters_at(&create.id).unwrap().get(&a.id), Some(&a.pubkey));
    }

    #[test]
    fn test_remove_last_master_skipped() {
        let a = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Friend, 0);
        let remove = master_op(&a, e, &create, MasterOp::RemoveMaster, &RemoveMasterData { master_id: a.id }, 1);

        let state = m_state(&create);
        assert_eq!(apply_master(Some(&state), &remove), Err(EntityError::LastMaster));

        let mut m = Membership::new(e);
        m.rebuild([&create, &remove], []);
        assert!(m.is_master(&a.id));
        // the skipped op still gets a snapshot so later ops can reference it
        assert!(m.masters_at(&remove.id).is_some());
    }

    fn m_state(create: &Oplog) -> MasterState {
        apply_master(None, create).unwrap()
    }

    #[test]
    fn test_transfer_is_atomic_and_snapshots_persist() {
        let a = user();
        let b = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Profile, 0);
        let transfer = master_op(
            &a,
            e,
            &create,
            MasterOp::TransferMaster,
            &TransferMasterData {
                from_id: a.id,
                to_id: b.id,
                to_pub: b.pubkey,
            },
            1,
        );

        let mut m = Membership::new(e);
        m.rebuild([&transfer, &create], []);
        assert!(!m.is_master(&a.id));
        assert!(m.is_master(&b.id));
        assert_eq!(m.masters().len(), 1);
        // oplogs signed under the bootstrap still see `a`
        assert!(m.masters_at(&create.id).unwrap().contains_key(&a.id));
    }

    #[test]
    fn test_migrate_entity() {
        let legacy = user();
        let new_owner = user();
        let e = PttID::new_under(&legacy.id);
        let create = create_entity(&legacy, e, EntityType::Me, 0);
        let new_me = PttID::new_under(&new_owner.id);
        let migrate = master_op(
            &legacy,
            e,
            &create,
            MasterOp::MigrateEntity,
            &MigrateEntityData {
                legacy_owner: e,
                new_owner: new_me,
                new_owner_pub: new_owner.pubkey,
                merged_into: Some(new_me),
            },
            5,
        );
        let mut m = Membership::new(e);
        m.rebuild([&create, &migrate], []);
        let record = m.record().unwrap();
        assert_eq!(record.status, Status::Migrated);
        assert_eq!(record.owner_ids, vec![new_me, e]);
        assert!(!record.is_writable());
        assert!(m.is_master(&new_owner.id));
    }

    #[test]
    fn test_rejoin_appends_history() {
        let a = user();
        let b = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let add = AddMemberData {
            member_id: b.id,
            member_pub: b.pubkey,
            node_id: None,
        };
        let add1 = member_op(&a, e, b.id, None, create.id, MemberOp::AddMember, &add, 10);
        let del = member_op(&b, e, b.id, Some(&add1), create.id, MemberOp::DeleteMember, &DeleteMemberData { member_id: b.id }, 20);
        let add2 = member_op(&a, e, b.id, Some(&del), create.id, MemberOp::AddMember, &add, 30);

        let mut m = Membership::new(e);
        m.rebuild([&create], [&add2, &del, &add1]);
        assert!(m.is_member(&b.id));
        assert_eq!(m.member(&b.id).unwrap().log_id, add2.id);
        assert_eq!(m.members().len(), 2);
        // key unknown while deleted, known again after the re-add
        let slack = MEMBER_TS_SLACK_SECS;
        assert_eq!(m.member_pubkey(&b.id, ts(-60)), None);
        assert_eq!(m.member_pubkey(&b.id, ts(15 - slack)), Some(b.pubkey));
        assert_eq!(m.member_pubkey(&b.id, ts(25 - slack)), None);
        assert_eq!(m.member_pubkey(&b.id, ts(35 - slack)), Some(b.pubkey));
    }

    #[test]
    fn test_delete_under_stale_master_ignored() {
        let a = user();
        let b = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let add = member_op(
            &a,
            e,
            b.id,
            None,
            create.id,
            MemberOp::AddMember,
            &AddMemberData {
                member_id: b.id,
                member_pub: b.pubkey,
                node_id: None,
            },
            1,
        );
        let del = member_op(&a, e, b.id, Some(&add), PttID::random(), MemberOp::DeleteMember, &DeleteMemberData { member_id: b.id }, 2);

        let mut m = Membership::new(e);
        m.rebuild([&create], [&add, &del]);
        assert!(m.is_member(&b.id));
    }

    fn add_member(by: &User, e: PttID, u: &User, master_log_id: PttID, at: i64) -> Oplog {
        member_op(
            by,
            e,
            u.id,
            None,
            master_log_id,
            MemberOp::AddMember,
            &AddMemberData {
                member_id: u.id,
                member_pub: u.pubkey,
                node_id: None,
            },
            at,
        )
    }

    fn delete_member(by: &User, e: PttID, target: &User, pre: &Oplog, master_log_id: PttID, at: i64) -> Oplog {
        member_op(
            by,
            e,
            target.id,
            Some(pre),
            master_log_id,
            MemberOp::DeleteMember,
            &DeleteMemberData { member_id: target.id },
            at,
        )
    }

    #[test]
    fn test_mutual_delete_lower_id_wins() {
        let a = user();
        let b = user();
        let c = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let master_b = master_op(&a, e, &create, MasterOp::AddMaster, &AddMasterData { master_id: b.id, master_pub: b.pubkey }, 1);
        let master_c = master_op(&a, e, &master_b, MasterOp::AddMaster, &AddMasterData { master_id: c.id, master_pub: c.pubkey }, 2);
        let add_b = add_member(&a, e, &b, create.id, 3);
        let add_c = add_member(&a, e, &c, create.id, 4);
        let b_del_c = delete_member(&b, e, &c, &add_c, master_c.id, 5);
        let c_del_b = delete_member(&c, e, &b, &add_b, master_c.id, 5);

        let mut m = Membership::new(e);
        m.rebuild([&create, &master_b, &master_c], [&add_b, &add_c, &b_del_c, &c_del_b]);

        let (winner, loser) = if b_del_c.id < c_del_b.id {
            (&b_del_c, &c_del_b)
        } else {
            (&c_del_b, &b_del_c)
        };
        assert_eq!(m.overruled().collect::<Vec<_>>(), vec![&loser.id]);
        let survivor = if winner.creator_id == b.id { b.id } else { c.id };
        let removed = if survivor == b.id { c.id } else { b.id };
        assert_eq!(m.member(&survivor).unwrap().status, Status::Alive);
        assert_eq!(m.member(&removed).unwrap().status, Status::Deleted);
    }

    #[test]
    fn test_non_master_cannot_delete_other_member() {
        let a = user();
        let b = user();
        let c = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let add_b = add_member(&a, e, &b, create.id, 1);
        let add_c = add_member(&a, e, &c, create.id, 2);
        let b_del_c = delete_member(&b, e, &c, &add_c, create.id, 3);

        let mut m = Membership::new(e);
        m.rebuild([&create], [&add_b, &add_c, &b_del_c]);
        assert_eq!(m.authorize_member_op(&b_del_c), Err(EntityError::NotMaster));
        assert!(m.is_member(&c.id));
        assert_eq!(m.member(&c.id).unwrap().log_id, add_c.id);
    }

    #[test]
    fn test_member_can_delete_self() {
        let a = user();
        let b = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let add_b = add_member(&a, e, &b, create.id, 1);
        let leave = delete_member(&b, e, &b, &add_b, create.id, 2);

        let mut m = Membership::new(e);
        m.rebuild([&create], [&add_b, &leave]);
        assert_eq!(m.authorize_member_op(&leave), Ok(()));
        assert!(!m.is_member(&b.id));
    }

    #[test]
    fn test_non_master_cannot_add_member() {
        let a = user();
        let b = user();
        let d = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Board, 0);
        let add_b = add_member(&a, e, &b, create.id, 1);
        let b_adds_d = add_member(&b, e, &d, create.id, 2);

        let mut m = Membership::new(e);
        m.rebuild([&create], [&add_b, &b_adds_d]);
        assert_eq!(m.authorize_member_op(&b_adds_d), Err(EntityError::NotMaster));
        assert!(!m.is_member(&d.id));
        assert!(m.member(&d.id).is_none());
    }

    #[test]
    fn test_replay_is_order_independent() {
        let a = user();
        let b = user();
        let e = PttID::new_under(&a.id);
        let create = create_entity(&a, e, EntityType::Friend, 0);
        let add_b = master_op(&a, e, &create, MasterOp::AddMaster, &AddMasterData { master_id: b.id, master_pub: b.pubkey }, 1);
        let fork = master_op(&a, e, &create, MasterOp::DeleteEntity, &ptt_protocol::oplog::DeleteEntityData { reason: String::new() }, 1);

        let mut m1 = Membership::new(e);
        m1.rebuild([&create, &add_b, &fork], []);
        let mut m2 = Membership::new(e);
        m2.rebuild([&fork, &add_b, &create], []);
        assert_eq!(m1.record(), m2.record());
        assert_eq!(m1.master_path(), m2.master_path());
        assert_eq!(m1.master_path().len(), 2);
    }
}
