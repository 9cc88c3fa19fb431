//! Weighted raft among the devices of one Me.
//!
//! The replicated state is only the group configuration: which devices are
//! voters and how much each weighs. Everything else a device needs about the
//! Me travels as entity oplogs. What raft adds is a single leader, and the
//! leader is the device allowed to issue OpKeys and co-sign master oplogs.
//!
//! Consensus is openraft. [`store::MeStore`] keeps its log and state machine
//! in the node's store, [`network`] carries its RPCs over the peer links.
//! Weight enters in three places: a heavier voter gets a shorter election
//! timeout, a leader hands over to a strictly heavier caught-up voter, and a
//! lead request is granted only to a voter at least as heavy as every other.

pub mod network;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ChangeMembershipError, ClientWriteError, RaftError as ConsensusError};
use openraft::storage::Adaptor;
use openraft::{ChangeMembers, Raft, RaftMetrics, ServerState, TokioRuntime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ptt_protocol::ErrorKind;

use crate::me::WEIGHT_SERVER;
use crate::storage::StorageError;

pub use network::{Calls, LeadAnswer, MessageBody, RaftMessage, RaftReply, RaftRpc, RaftTransport};
pub use store::MeStore;

pub type RaftId = u64;

/// How long callers wait for a conf change to commit or a lead to move.
const CALL_DEADLINE: Duration = Duration::from_secs(10);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Per-device metadata carried in the raft membership.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceNode {
    pub weight: u32,
}

impl fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weight {}", self.weight)
    }
}

// The group replicates nothing but its own membership.
openraft::declare_raft_types!(
    pub MeTypeConfig:
        D = (),
        R = (),
        NodeId = RaftId,
        Node = DeviceNode,
        Entry = openraft::Entry<MeTypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime
);

pub type MeRaft = Raft<MeTypeConfig>;

/// Voters and their weights.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfState {
    voters: BTreeMap<RaftId, u32>,
}

impl ConfState {
    pub fn contains(&self, id: &RaftId) -> bool {
        self.voters.contains_key(id)
    }

    pub fn weight(&self, id: &RaftId) -> Option<u32> {
        self.voters.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn ids(&self) -> impl Iterator<Item = RaftId> + '_ {
        self.voters.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RaftId, u32)> + '_ {
        self.voters.iter().map(|(id, w)| (*id, *w))
    }

    pub fn total_weight(&self) -> u32 {
        self.voters.values().sum()
    }

    /// Heaviest voter, lowest id first among equals.
    pub fn heaviest(&self) -> Option<(RaftId, u32)> {
        self.iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }

    /// Whether `id` is a voter no other voter outweighs.
    pub fn may_lead(&self, id: RaftId) -> bool {
        match self.weight(&id) {
            Some(weight) => self.iter().all(|(other, w)| other == id || w <= weight),
            None => false,
        }
    }
}

impl FromIterator<(RaftId, u32)> for ConfState {
    fn from_iter<I: IntoIterator<Item = (RaftId, u32)>>(iter: I) -> Self {
        ConfState {
            voters: iter.into_iter().collect(),
        }
    }
}

/// JSON shape of a configuration: parallel `Nodes`/`Weights` plus the lead.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfView {
    #[serde(rename = "Nodes")]
    pub nodes: Vec<RaftId>,
    #[serde(rename = "Weights")]
    pub weights: Vec<u32>,
    #[serde(rename = "Lead")]
    pub lead: RaftId,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Learner,
    Follower,
    Candidate,
    Leader,
    Stopped,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Learner => "learner",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Stopped => "stopped",
        }
    }
}

impl From<ServerState> for Role {
    fn from(state: ServerState) -> Self {
        match state {
            ServerState::Learner => Role::Learner,
            ServerState::Follower => Role::Follower,
            ServerState::Candidate => Role::Candidate,
            ServerState::Leader => Role::Leader,
            ServerState::Shutdown => Role::Stopped,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: RaftId,
    pub term: u64,
    pub role: Role,
    pub lead: Option<RaftId>,
    /// Highest applied index; everything up to it is committed.
    pub commit: u64,
    pub applied: u64,
    pub last_index: u64,
    pub conf: ConfState,
}

impl RaftStatus {
    fn initial(id: RaftId) -> Self {
        RaftStatus {
            id,
            term: 0,
            role: Role::Learner,
            lead: None,
            commit: 0,
            applied: 0,
            last_index: 0,
            conf: ConfState::default(),
        }
    }

    fn from_metrics(m: &RaftMetrics<RaftId, DeviceNode>) -> Self {
        let membership = m.membership_config.membership();
        let conf = membership
            .voter_ids()
            .map(|id| (id, membership.get_node(&id).map_or(0, |n| n.weight)))
            .collect();
        let applied = m.last_applied.map_or(0, |l| l.index);
        RaftStatus {
            id: m.id,
            term: m.current_term,
            role: m.state.into(),
            lead: m.current_leader,
            commit: applied,
            applied,
            last_index: m.last_log_index.unwrap_or(0),
            conf,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader && self.lead == Some(self.id)
    }

    pub fn conf_view(&self) -> ConfView {
        ConfView {
            nodes: self.conf.ids().collect(),
            weights: self.conf.iter().map(|(_, w)| w).collect(),
            lead: self.lead.unwrap_or(0),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RaftError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Raft message encoding failed: {0}")]
    Encoding(String),

    #[error("no leader")]
    NotLeader(Option<RaftId>),

    #[error("{0:x} is not a member of the group")]
    NotMember(RaftId),

    #[error("no link to {0:x}")]
    Unreachable(RaftId),

    #[error("A configuration change is still in flight")]
    ConfChangePending,

    #[error("Raft node stopped")]
    Stopped,

    #[error("Raft call timed out")]
    DeadlineExceeded,

    #[error("Refused: {0}")]
    Refused(String),

    #[error("Bad raft configuration: {0}")]
    Config(String),

    #[error("Raft core failed: {0}")]
    Fatal(String),
}

impl RaftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::Storage(e) => e.kind(),
            RaftError::Encoding(_) => ErrorKind::Corruption,
            RaftError::NotLeader(_) => ErrorKind::NoLeader,
            RaftError::NotMember(_) => ErrorKind::NotFound,
            RaftError::Unreachable(_)
            | RaftError::ConfChangePending
            | RaftError::Stopped
            | RaftError::DeadlineExceeded => ErrorKind::Transient,
            RaftError::Refused(_) => ErrorKind::Unauthorized,
            RaftError::Config(_) => ErrorKind::BadInput,
            RaftError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

impl From<ConsensusError<RaftId, ClientWriteError<RaftId, DeviceNode>>> for RaftError {
    fn from(e: ConsensusError<RaftId, ClientWriteError<RaftId, DeviceNode>>) -> Self {
        match e {
            ConsensusError::APIError(ClientWriteError::ForwardToLeader(f)) => RaftError::NotLeader(f.leader_id),
            ConsensusError::APIError(ClientWriteError::ChangeMembershipError(
                ChangeMembershipError::InProgress(_),
            )) => RaftError::ConfChangePending,
            ConsensusError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
                RaftError::Refused(e.to_string())
            }
            ConsensusError::Fatal(e) => RaftError::Fatal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    /// Heartbeat period; election timeouts are multiples of it.
    pub tick: Duration,
    /// This device's weight.
    pub weight: u32,
}

impl RaftConfig {
    /// Election timeouts shrink as the weight grows, so the heaviest voter
    /// is the first to campaign once a leader goes quiet.
    fn openraft(&self) -> Result<openraft::Config> {
        let tick = (self.tick.as_millis() as u64).max(1);
        let lighter = u64::from(WEIGHT_SERVER.saturating_sub(self.weight));
        let election_timeout_min = tick * (10 + 5 * lighter);
        openraft::Config {
            cluster_name: "me".into(),
            heartbeat_interval: tick,
            election_timeout_min,
            election_timeout_max: election_timeout_min + tick * 5,
            install_snapshot_timeout: tick * 20,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(64),
            max_in_snapshot_log_to_keep: 16,
            ..Default::default()
        }
        .validate()
        .map_err(|e| RaftError::Config(e.to_string()))
    }

    fn election_timeout_min(&self) -> Duration {
        let lighter = WEIGHT_SERVER.saturating_sub(self.weight);
        self.tick * (10 + 5 * lighter)
    }
}

/// How a node enters its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Continue from storage; found a new group if storage is empty.
    Resume,
    /// Drop stored state and wait to be added by an existing leader.
    Join,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

struct Shared {
    id: RaftId,
    config: RaftConfig,
    raft: MeRaft,
    transport: Arc<dyn RaftTransport>,
    calls: Arc<Calls>,
    /// Set while this leader is handing over.
    transferring: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct RaftHandle {
    shared: Arc<Shared>,
    status: watch::Receiver<RaftStatus>,
    authority: watch::Receiver<bool>,
}

impl RaftHandle {
    pub fn id(&self) -> RaftId {
        self.shared.id
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.authority.borrow()
    }

    /// Leader flag for the entity engines.
    pub fn authority(&self) -> watch::Receiver<bool> {
        self.authority.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Hand an inbound frame to the group: replies complete pending calls,
    /// calls are served on their own task.
    pub fn step(&self, msg: RaftMessage) {
        let RaftMessage { from, to, body } = msg;
        if to != self.id() {
            log::trace!("raft {:x}: frame for {:x} dropped", self.id(), to);
            return;
        }
        match body {
            MessageBody::Reply { call, reply } => self.shared.calls.complete(call, reply),
            MessageBody::Call { call, rpc } => {
                let handle = self.clone();
                tokio::spawn(async move {
                    let reply = handle.serve(from, rpc).await;
                    if call == 0 {
                        return;
                    }
                    let answer = RaftMessage {
                        from: handle.id(),
                        to: from,
                        body: MessageBody::Reply { call, reply },
                    };
                    if let Err(e) = handle.shared.transport.send(answer) {
                        log::debug!("raft {:x}: cannot answer {:x}: {}", handle.id(), from, e);
                    }
                });
            }
        }
    }

    async fn serve(&self, from: RaftId, rpc: RaftRpc) -> RaftReply {
        let raft = &self.shared.raft;
        match rpc {
            RaftRpc::AppendEntries(req) => RaftReply::AppendEntries(raft.append_entries(req).await),
            RaftRpc::Vote(req) => RaftReply::Vote(raft.vote(req).await),
            RaftRpc::InstallSnapshot(req) => RaftReply::InstallSnapshot(raft.install_snapshot(req).await),
            RaftRpc::RequestLead => RaftReply::Lead(self.grant_lead(from)),
            RaftRpc::TimeoutNow => {
                self.campaign();
                RaftReply::Ack
            }
        }
    }

    /// Send `rpc` to `to` without waiting for an answer.
    fn notify(&self, to: RaftId, rpc: RaftRpc) {
        let msg = RaftMessage {
            from: self.id(),
            to,
            body: MessageBody::Call { call: 0, rpc },
        };
        if let Err(e) = self.shared.transport.send(msg) {
            log::debug!("raft {:x}: cannot reach {:x}: {}", self.id(), to, e);
        }
    }

    fn leader_status(&self) -> Result<RaftStatus> {
        let status = self.status();
        if !status.is_leader() {
            return Err(RaftError::NotLeader(status.lead));
        }
        Ok(status)
    }

    /// Add or reweigh a voter and wait until the change commits.
    pub async fn add_node(&self, id: RaftId, weight: u32) -> Result<()> {
        let status = self.leader_status()?;
        let node = DeviceNode { weight };
        match status.conf.weight(&id) {
            Some(w) if w == weight => return Ok(()),
            Some(_) => {
                self.shared
                    .raft
                    .change_membership(ChangeMembers::SetNodes(BTreeMap::from([(id, node)])), false)
                    .await?;
            }
            None => {
                // blocks until the learner has caught up with the log
                tokio::time::timeout(CALL_DEADLINE, self.shared.raft.add_learner(id, node, true))
                    .await
                    .map_err(|_| RaftError::DeadlineExceeded)??;
                self.shared
                    .raft
                    .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                    .await?;
            }
        }
        log::info!("raft {:x}: voter {:x} at weight {}", self.id(), id, weight);
        self.wait_for(move |s| s.conf.weight(&id) == Some(weight)).await.map(|_| ())
    }

    pub async fn remove_node(&self, id: RaftId) -> Result<()> {
        let status = self.leader_status()?;
        if !status.conf.contains(&id) {
            return Err(RaftError::NotMember(id));
        }
        self.shared
            .raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
            .await?;
        log::info!("raft {:x}: voter {:x} removed", self.id(), id);
        self.wait_for(move |s| !s.conf.contains(&id)).await.map(|_| ())
    }

    /// Become leader, if our weight allows it; returns the status after.
    pub async fn request_lead(&self) -> Result<RaftStatus> {
        let status = self.status();
        if status.is_leader() {
            return Ok(status);
        }
        let lead = status.lead.ok_or(RaftError::NotLeader(None))?;
        let reply = self
            .shared
            .calls
            .call(self.shared.transport.as_ref(), self.id(), lead, RaftRpc::RequestLead, CALL_DEADLINE)
            .await?;
        match reply {
            RaftReply::Lead(answer) => answer.into_result(self.id())?,
            _ => return Err(RaftError::Encoding("reply does not match the call".into())),
        }
        self.wait_for(RaftStatus::is_leader).await
    }

    /// Leader side of a lead request.
    fn grant_lead(&self, asker: RaftId) -> LeadAnswer {
        let status = match self.leader_status() {
            Ok(status) => status,
            Err(_) => return LeadAnswer::NotLeader(self.status().lead),
        };
        if !status.conf.contains(&asker) {
            return LeadAnswer::NotMember;
        }
        if asker == self.id() {
            return LeadAnswer::Granted;
        }
        if !status.conf.may_lead(asker) {
            return LeadAnswer::Refused("another device outweighs this one".into());
        }
        self.hand_over(asker);
        LeadAnswer::Granted
    }

    /// Go quiet so `to` can win an election, then resume once someone else
    /// leads or the attempt runs out of time.
    fn hand_over(&self, to: RaftId) {
        if self.shared.transferring.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("raft {:x}: handing the lead to {:x}", self.id(), to);
        let runtime = self.shared.raft.runtime_config();
        runtime.heartbeat(false);
        runtime.elect(false);
        self.notify(to, RaftRpc::TimeoutNow);

        let handle = self.clone();
        tokio::spawn(async move {
            let id = handle.id();
            if handle.wait_for(move |s| s.lead.is_some_and(|l| l != id)).await.is_err() {
                log::warn!("raft {id:x}: hand-over to {to:x} did not complete");
            }
            let runtime = handle.shared.raft.runtime_config();
            runtime.heartbeat(true);
            runtime.elect(true);
            handle.shared.transferring.store(false, Ordering::SeqCst);
        });
    }

    /// Successor side of a hand-over: campaign until this device leads or
    /// the old leader is back.
    fn campaign(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            let pause = handle.shared.config.election_timeout_min();
            for _ in 0..10 {
                if handle.status().is_leader() || handle.shared.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = handle.shared.raft.trigger().elect().await {
                    log::debug!("raft {:x}: cannot campaign: {}", handle.id(), e);
                    return;
                }
                tokio::time::sleep(pause).await;
            }
        });
    }

    /// While leading, hand over to the heaviest voter if it outweighs us and
    /// has caught up with the log.
    fn maybe_yield_to_heavier(&self, status: &RaftStatus, metrics: &RaftMetrics<RaftId, DeviceNode>) {
        if !status.is_leader() || self.shared.transferring.load(Ordering::SeqCst) {
            return;
        }
        let own = status.conf.weight(&status.id).unwrap_or(0);
        let Some((heaviest, weight)) = status.conf.heaviest() else {
            return;
        };
        if heaviest == status.id || weight <= own {
            return;
        }
        let caught_up = metrics
            .replication
            .as_ref()
            .and_then(|r| r.get(&heaviest))
            .and_then(|matched| *matched)
            .is_some_and(|matched| Some(matched.index) == metrics.last_log_index);
        if caught_up {
            self.hand_over(heaviest);
        }
    }

    /// Wait until some node of the group leads.
    pub async fn wait_for_leader(&self) -> Result<RaftStatus> {
        self.wait_for(|s| s.lead.is_some()).await
    }

    pub async fn wait_for(&self, f: impl Fn(&RaftStatus) -> bool) -> Result<RaftStatus> {
        let mut rx = self.status.clone();
        let status = tokio::time::timeout(CALL_DEADLINE, rx.wait_for(|s| f(s)))
            .await
            .map_err(|_| RaftError::DeadlineExceeded)?
            .map_err(|_| RaftError::Stopped)?;
        Ok(status.clone())
    }

    /// Stop the group and wait until it has let go of its storage.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        if let Err(e) = self.shared.raft.shutdown().await {
            log::warn!("raft {:x}: shutdown: {:?}", self.id(), e);
        }
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }
}

// ─── Spawn ───────────────────────────────────────────────────────────────────

/// Open (or found, or reset) the group state and start the raft core.
pub async fn spawn(
    id: RaftId,
    config: RaftConfig,
    store: MeStore,
    transport: Arc<dyn RaftTransport>,
    start: Start,
) -> Result<RaftHandle> {
    let found = match start {
        Start::Join => {
            store.clear()?;
            false
        }
        Start::Resume => store.is_fresh()?,
    };

    let calls = Arc::new(Calls::default());
    let network = network::MeNetwork::new(id, transport.clone(), calls.clone());
    let (log_store, state_machine) = Adaptor::new(store);
    let raft = Raft::new(id, Arc::new(config.openraft()?), network, log_store, state_machine)
        .await
        .map_err(|e| RaftError::Fatal(e.to_string()))?;
    if found {
        let founders = BTreeMap::from([(id, DeviceNode { weight: config.weight })]);
        raft.initialize(founders)
            .await
            .map_err(|e| RaftError::Fatal(e.to_string()))?;
        log::info!("raft {id:x}: founded a group at weight {}", config.weight);
    }

    let (status, status_rx) = watch::channel(RaftStatus::initial(id));
    let (authority, authority_rx) = watch::channel(false);
    let handle = RaftHandle {
        shared: Arc::new(Shared {
            id,
            config,
            raft,
            transport,
            calls,
            transferring: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }),
        status: status_rx,
        authority: authority_rx,
    };
    tokio::spawn(watch_metrics(handle.clone(), status, authority));
    Ok(handle)
}

/// Mirror openraft's metrics into [`RaftStatus`] and the leader flag, and
/// yield to heavier voters while leading.
async fn watch_metrics(handle: RaftHandle, status: watch::Sender<RaftStatus>, authority: watch::Sender<bool>) {
    let id = handle.id();
    let mut metrics = handle.shared.raft.metrics();
    log::debug!("raft {id:x}: started");
    loop {
        let current = metrics.borrow_and_update().clone();
        let next = RaftStatus::from_metrics(&current);
        let leader = next.is_leader();
        handle.maybe_yield_to_heavier(&next, &current);
        status.send_if_modified(|s| {
            if *s != next {
                *s = next;
                true
            } else {
                false
            }
        });
        authority.send_if_modified(|a| {
            let changed = *a != leader;
            *a = leader;
            changed
        });
        tokio::select! {
            changed = metrics.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = handle.shared.cancel.cancelled() => break,
        }
    }
    authority.send_replace(false);
    log::debug!("raft {id:x}: stopped");
}
