//! Entity worker: one task per entity, the only place its engine is touched.
//!
//! The worker owns the [`EntityEngine`] and the entity's view of its peers.
//! It consumes [`EntityEvent`]s from a bounded queue, runs each handler to
//! completion, and only then polls again; merkle sync rounds and
//! housekeeping run off two timers inside the same loop.
//!
//! A peer is *identified* on the entity once it signed our nonce with a key
//! the membership knows. Oplogs, pulls and merkle queries are exchanged only
//! with identified peers.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use rand::{Rng, RngCore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use ptt_protocol::limits::MAX_SYNC_OPLOG_ACK;
use ptt_protocol::merkle::SyncPlanner;
use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{MerkleIndex, NodeID, PttID};

use super::engine::{EntityEngine, Submitted};
use super::reputation::{Reputation, ReputationConfig, Verdict};
use super::{EntityError, EntityType, Health, Result};
use crate::config::Config;
use crate::peer::message::{
    IdentifyAck, IdentifyRequest, KeyAdvert, MerkleReply, MerkleRequest, OplogPull, OplogPush,
};
use crate::peer::{LinkHandle, Message, PeerClass, PeerCounts, PeerInfo, PeerManager, Pushed};

/// Deadline given to calls made through an [`EntityHandle`].
pub const CALL_DEADLINE: Duration = Duration::from_secs(30);

const SEEN_PER_PEER: usize = 4096;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub gossip_fanout: usize,
    pub max_sync: usize,
    pub future_tolerance_secs: i64,
    pub sync_interval: (Duration, Duration),
    pub housekeeping_interval: Duration,
    pub queue_len: usize,
    pub reputation: ReputationConfig,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        WorkerSettings {
            gossip_fanout: config.gossip_fanout.max(1),
            max_sync: config.max_sync,
            future_tolerance_secs: config.future_tolerance_secs,
            sync_interval: config.sync_interval(),
            housekeeping_interval: config.housekeeping_interval(),
            queue_len: config.entity_queue_len.max(1),
            reputation: ReputationConfig::with_threshold(config.reputation_threshold),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

type WriteFn = Box<dyn FnOnce(&mut EntityEngine) -> Result<Submitted> + Send>;
type QueryFn = Box<dyn FnOnce(&mut EntityEngine) + Send>;

pub enum EntityEvent {
    /// A local write; the reply carries the new oplog after local apply.
    LocalOp {
        write: WriteFn,
        reply: oneshot::Sender<Result<Oplog>>,
    },
    Inbound {
        from: NodeID,
        message: Message,
    },
    MerkleReply {
        from: NodeID,
        reply: MerkleReply,
    },
    /// Run a sync round now.
    Tick,
    /// Re-index and run a full round with every peer.
    ForceSync,
    PeerUp {
        link: LinkHandle,
    },
    PeerDown {
        node_id: NodeID,
    },
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Query(QueryFn),
    Shutdown,
}

impl std::fmt::Debug for EntityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityEvent::LocalOp { .. } => "LocalOp",
            EntityEvent::Inbound { .. } => "Inbound",
            EntityEvent::MerkleReply { .. } => "MerkleReply",
            EntityEvent::Tick => "Tick",
            EntityEvent::ForceSync => "ForceSync",
            EntityEvent::PeerUp { .. } => "PeerUp",
            EntityEvent::PeerDown { .. } => "PeerDown",
            EntityEvent::Peers(_) => "Peers",
            EntityEvent::Query(_) => "Query",
            EntityEvent::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

struct Envelope {
    event: EntityEvent,
    deadline: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable address of a running entity worker.
#[derive(Clone)]
pub struct EntityHandle {
    id: PttID,
    entity_type: EntityType,
    tx: mpsc::Sender<Envelope>,
    health: watch::Receiver<Health>,
}

impl EntityHandle {
    pub fn id(&self) -> PttID {
        self.id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn health(&self) -> Health {
        self.health.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an event without a deadline, waiting for room.
    pub async fn send(&self, event: EntityEvent) -> Result<()> {
        self.tx
            .send(Envelope { event, deadline: None })
            .await
            .map_err(|_| EntityError::WorkerGone)
    }

    /// Queue an event if there is room; inbound traffic is dropped otherwise.
    pub fn try_send(&self, event: EntityEvent) -> bool {
        match self.tx.try_send(Envelope { event, deadline: None }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(env)) => {
                log::debug!("EntityHandle {}: queue full, dropping {:?}", self.id.short(), env.event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn call<R>(&self, event: EntityEvent, rx: oneshot::Receiver<R>) -> Result<R> {
        let deadline = Instant::now() + CALL_DEADLINE;
        tokio::time::timeout_at(deadline, self.tx.send(Envelope { event, deadline: Some(deadline) }))
            .await
            .map_err(|_| EntityError::DeadlineExceeded)?
            .map_err(|_| EntityError::WorkerGone)?;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(_)) if Instant::now() >= deadline => Err(EntityError::DeadlineExceeded),
            Ok(Err(_)) => Err(EntityError::WorkerGone),
            Err(_) => Err(EntityError::DeadlineExceeded),
        }
    }

    /// Run a write on the worker; returns after local apply.
    pub async fn write<F>(&self, write: F) -> Result<Oplog>
    where
        F: FnOnce(&mut EntityEngine) -> Result<Submitted> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let event = EntityEvent::LocalOp {
            write: Box::new(write),
            reply,
        };
        self.call(event, rx).await?
    }

    /// `SubmitOp`.
    pub async fn submit(&self, category: Category, op: u32, obj_id: PttID, data: Vec<u8>) -> Result<Oplog> {
        self.write(move |engine| engine.submit(category, op, obj_id, data)).await
    }

    /// Read (or mutate) engine state on the worker.
    pub async fn query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EntityEngine) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let event = EntityEvent::Query(Box::new(move |engine| {
            let _ = tx.send(f(engine));
        }));
        self.call(event, rx).await
    }

    /// Identified peers of this entity.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let (tx, rx) = oneshot::channel();
        self.call(EntityEvent::Peers(tx), rx).await
    }

    /// `CountPeers`.
    pub async fn count_peers(&self) -> Result<PeerCounts> {
        let mut counts = PeerCounts::default();
        for peer in self.peers().await? {
            counts.add(peer.class);
        }
        Ok(counts)
    }

    pub async fn force_sync(&self) -> Result<()> {
        self.send(EntityEvent::ForceSync).await
    }

    /// Stop the worker and wait until it dropped its engine.
    pub async fn shutdown(&self) {
        let _ = self.send(EntityEvent::Shutdown).await;
        let mut health = self.health.clone();
        while health.changed().await.is_ok() {}
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct PeerState {
    link: LinkHandle,
    /// Member this peer proved to be.
    member: Option<PttID>,
    /// Outstanding identify nonce.
    nonce: Option<[u8; 32]>,
    /// `(oplog id, master signature count)` already exchanged with the peer.
    seen: LruCache<(PttID, usize), ()>,
    planners: HashMap<Category, SyncPlanner>,
    /// Oplogs were refused by its queue; sync at the next chance.
    force: bool,
}

impl PeerState {
    fn new(link: LinkHandle) -> Self {
        PeerState {
            link,
            member: None,
            nonce: None,
            seen: LruCache::new(NonZeroUsize::new(SEEN_PER_PEER).unwrap_or(NonZeroUsize::MIN)),
            planners: HashMap::new(),
            force: false,
        }
    }

    fn mark_seen(&mut self, oplog: &Oplog) {
        self.seen.put((oplog.id, oplog.master_signs.len()), ());
    }

    fn has_seen(&self, oplog: &Oplog) -> bool {
        self.seen.contains(&(oplog.id, oplog.master_signs.len()))
    }

    fn send(&self, entity_id: PttID, message: &Message) -> Pushed {
        self.link.send(entity_id, message)
    }
}

pub struct EntityWorker {
    engine: EntityEngine,
    settings: WorkerSettings,
    manager: PeerManager,
    peers: HashMap<NodeID, PeerState>,
    reputation: Reputation,
    health: watch::Sender<Health>,
    rx: mpsc::Receiver<Envelope>,
}

/// Start the worker of `engine`; links already up are announced to it first.
pub fn spawn(engine: EntityEngine, manager: PeerManager, settings: WorkerSettings) -> EntityHandle {
    let (tx, rx) = mpsc::channel(settings.queue_len);
    let (health, health_rx) = watch::channel(Health::Healthy);
    let handle = EntityHandle {
        id: engine.id(),
        entity_type: engine.entity_type(),
        tx,
        health: health_rx,
    };
    let links = manager.links();
    let mut worker = EntityWorker {
        reputation: Reputation::new(settings.reputation.clone()),
        engine,
        settings,
        manager,
        peers: HashMap::new(),
        health,
        rx,
    };
    for link in links {
        worker.on_peer_up(link);
    }
    tokio::spawn(worker.run());
    handle
}

impl EntityWorker {
    fn id(&self) -> PttID {
        self.engine.id()
    }

    fn next_sync(&self) -> Instant {
        let (min, max) = self.settings.sync_interval;
        let (min, max) = (min.as_millis() as u64, max.as_millis().max(min.as_millis()) as u64);
        Instant::now() + Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(self.settings.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_at = self.next_sync();
        log::debug!("EntityWorker {}: started", self.id().short());

        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if !self.handle(envelope) {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(sync_at) => {
                    self.sync_round(false);
                    sync_at = self.next_sync();
                }
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }
        log::debug!("EntityWorker {}: stopped", self.id().short());
    }

    fn is_healthy(&self) -> bool {
        *self.health.borrow() == Health::Healthy
    }

    /// Pause on store errors; other errors belong to the caller.
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(EntityError::Storage(e)) = &result {
            log::error!("EntityWorker {}: store failed, pausing: {}", self.id().short(), e);
            self.health.send_replace(Health::Unhealthy(e.to_string()));
        }
        result
    }

    fn handle(&mut self, envelope: Envelope) -> bool {
        let expired = envelope.deadline.is_some_and(|d| Instant::now() >= d);
        match envelope.event {
            EntityEvent::LocalOp { write, reply } => {
                if expired {
                    let _ = reply.send(Err(EntityError::DeadlineExceeded));
                    return true;
                }
                let _ = reply.send(self.local_op(write));
            }
            EntityEvent::Query(f) => {
                if !expired {
                    f(&mut self.engine);
                }
            }
            EntityEvent::Peers(reply) => {
                let _ = reply.send(self.peer_infos());
            }
            EntityEvent::Inbound { from, message } => self.on_message(from, message),
            EntityEvent::MerkleReply { from, reply } => self.on_merkle_reply(from, reply),
            EntityEvent::Tick => self.sync_round(false),
            EntityEvent::ForceSync => {
                self.engine.reindex();
                self.sync_round(true);
            }
            EntityEvent::PeerUp { link } => self.on_peer_up(link),
            EntityEvent::PeerDown { node_id } => {
                if self.peers.remove(&node_id).is_some() {
                    log::debug!("EntityWorker {}: peer {} down", self.id().short(), node_id.short());
                }
            }
            EntityEvent::Shutdown => return false,
        }
        true
    }

    fn local_op(&mut self, write: WriteFn) -> Result<Oplog> {
        if let Health::Unhealthy(reason) = self.health.borrow().clone() {
            return Err(EntityError::Unhealthy(reason));
        }
        let submitted = write(&mut self.engine);
        let submitted = self.check(submitted)?;
        self.gossip(submitted.gossip, None, false);
        Ok(submitted.oplog)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    fn on_peer_up(&mut self, link: LinkHandle) {
        let node_id = link.node_id;
        if self.reputation.is_banned(&node_id) {
            return;
        }
        let mut peer = PeerState::new(link);
        self.request_identify(&mut peer);
        self.peers.insert(node_id, peer);
    }

    fn request_identify(&self, peer: &mut PeerState) {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        peer.nonce = Some(nonce);
        peer.send(self.id(), &Message::IdentifyRequest(IdentifyRequest { nonce }));
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .values()
            .filter_map(|p| {
                Some(PeerInfo {
                    node_id: p.link.node_id,
                    user_id: Some(p.member?),
                    addr: Some(p.link.addr.to_string()),
                    class: PeerClass::Member,
                    connected: !p.link.is_closed(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    fn penalise(&mut self, from: &NodeID, count: usize) {
        if count == 0 {
            return;
        }
        if self.reputation.penalise(from, count) == Verdict::Evict {
            log::warn!("EntityWorker {}: evicting peer {}", self.id().short(), from.short());
            self.peers.remove(from);
        }
    }

    fn identified(&mut self, from: &NodeID) -> Option<&mut PeerState> {
        self.peers.get_mut(from).filter(|p| p.member.is_some())
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn on_message(&mut self, from: NodeID, message: Message) {
        if self.reputation.is_banned(&from) {
            return;
        }
        match message {
            Message::IdentifyRequest(req) => self.on_identify_request(from, req),
            Message::IdentifyAck(ack) => self.on_identify_ack(from, ack),
            Message::OplogPush(push) => self.on_push(from, push.oplogs),
            Message::OplogPull(pull) => self.on_pull(from, pull),
            Message::MerkleRequest(req) => self.on_merkle_request(from, req),
            Message::MerkleReply(reply) => self.on_merkle_reply(from, reply),
            Message::KeyAdvert(advert) => self.on_key_advert(from, advert),
            other => log::debug!(
                "EntityWorker {}: unexpected {:?} from {}",
                self.id().short(),
                other.msg_type(),
                from.short()
            ),
        }
    }

    fn on_identify_request(&mut self, from: NodeID, req: IdentifyRequest) {
        let id = self.id();
        let Some(sign) = self.engine.identify_sign(&req.nonce) else {
            return;
        };
        let Some(mut peer) = self.peers.remove(&from) else {
            return;
        };
        peer.send(id, &Message::IdentifyAck(IdentifyAck { nonce: req.nonce, sign }));
        // the peer may have asked before we hosted the entity
        if peer.member.is_none() {
            self.request_identify(&mut peer);
        }
        self.peers.insert(from, peer);
    }

    fn on_identify_ack(&mut self, from: NodeID, ack: IdentifyAck) {
        let id = self.id();
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        if peer.nonce != Some(ack.nonce) {
            return;
        }
        peer.nonce = None;
        let Some(member) = self.engine.verify_identify(&ack.nonce, &ack.sign) else {
            log::debug!("EntityWorker {}: {} failed to identify", id.short(), from.short());
            return;
        };
        let first = peer.member.replace(member).is_none();
        if !first {
            return;
        }
        log::info!(
            "EntityWorker {}: peer {} identified as {}",
            id.short(),
            from.short(),
            member.short()
        );
        self.manager.mark_member(&from);
        let log_ids: Vec<PttID> = self.engine.opkey_infos().iter().filter_map(|k| k.log_id).collect();
        let pending = self.engine.own_pending();
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.send(id, &Message::KeyAdvert(KeyAdvert { log_ids }));
            peer.force = true;
        }
        self.push_to(&from, pending, true);
        self.sync_round(false);
    }

    fn on_push(&mut self, from: NodeID, oplogs: Vec<Oplog>) {
        if oplogs.is_empty() {
            return;
        }
        let Some(peer) = self.identified(&from) else {
            return;
        };
        for oplog in &oplogs {
            peer.mark_seen(oplog);
        }
        if !self.is_healthy() {
            return;
        }
        let received = self.engine.receive(oplogs);
        let outcome = match self.check(received) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("EntityWorker {}: receive failed: {}", self.id().short(), e);
                return;
            }
        };
        if outcome.accepted + outcome.pending > 0 {
            log::debug!(
                "EntityWorker {}: from {}: {} accepted, {} pending, {} deferred, {} rejected",
                self.id().short(),
                from.short(),
                outcome.accepted,
                outcome.pending,
                outcome.deferred,
                outcome.rejected
            );
        }
        self.penalise(&from, outcome.penalised);
        self.gossip(outcome.gossip, Some(from), false);
    }

    fn on_pull(&mut self, from: NodeID, pull: OplogPull) {
        let mut oplogs = Vec::new();
        if let Some(window) = pull.window {
            oplogs.extend(self.engine.oplogs_in_window(pull.category, window.start, window.end, MAX_SYNC_OPLOG_ACK));
        }
        if !pull.ids.is_empty() {
            let ids: Vec<PttID> = pull.ids.into_iter().take(MAX_SYNC_OPLOG_ACK).collect();
            oplogs.extend(self.engine.oplogs_by_ids(pull.category, &ids));
        }
        if self.identified(&from).is_some() {
            self.push_to(&from, oplogs, true);
        }
    }

    fn on_merkle_request(&mut self, from: NodeID, req: MerkleRequest) {
        let id = self.id();
        let q = req.query;
        let nodes = match self.engine.merkle_nodes(q.category, q.level, q.start, q.end) {
            Ok(nodes) => nodes,
            Err(e) => {
                log::debug!("EntityWorker {}: bad merkle query from {}: {}", id.short(), from.short(), e);
                self.penalise(&from, 1);
                return;
            }
        };
        if let Some(peer) = self.identified(&from) {
            peer.send(id, &Message::MerkleReply(MerkleReply { query: q, nodes }));
        }
    }

    fn on_merkle_reply(&mut self, from: NodeID, reply: MerkleReply) {
        let id = self.id();
        let category = reply.query.category;
        let empty = MerkleIndex::default();
        let local = self.engine.merkle_index(category).unwrap_or(&empty);
        let Some(peer) = self.peers.get_mut(&from).filter(|p| p.member.is_some()) else {
            return;
        };
        let Some(planner) = peer.planners.get_mut(&category) else {
            return;
        };
        if let Err(e) = planner.on_reply(&reply.query, &reply.nodes, local) {
            log::debug!("EntityWorker {}: bad merkle reply from {}: {}", id.short(), from.short(), e);
            peer.planners.remove(&category);
            self.penalise(&from, 1);
            return;
        }
        let pulls = planner.take_pulls();
        let queries = planner.next_queries();
        if planner.is_done() {
            peer.planners.remove(&category);
        }
        for window in pulls {
            peer.send(
                id,
                &Message::OplogPull(OplogPull {
                    category,
                    window: Some(window),
                    ids: Vec::new(),
                }),
            );
        }
        for query in queries {
            peer.send(id, &Message::MerkleRequest(MerkleRequest { query }));
        }
    }

    fn on_key_advert(&mut self, from: NodeID, advert: KeyAdvert) {
        let known: Vec<PttID> = self
            .engine
            .oplogs_by_ids(Category::OpKey, &advert.log_ids)
            .iter()
            .map(|o| o.id)
            .collect();
        let missing: Vec<PttID> = advert.log_ids.into_iter().filter(|id| !known.contains(id)).collect();
        if missing.is_empty() {
            return;
        }
        let id = self.id();
        if let Some(peer) = self.identified(&from) {
            peer.send(
                id,
                &Message::OplogPull(OplogPull {
                    category: Category::OpKey,
                    window: None,
                    ids: missing,
                }),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Push oplogs to one peer; `again` skips the per-peer dedupe.
    fn push_to(&mut self, node_id: &NodeID, oplogs: Vec<Oplog>, again: bool) {
        let id = self.id();
        let Some(peer) = self.peers.get_mut(node_id) else {
            return;
        };
        let fresh: Vec<Oplog> = oplogs.into_iter().filter(|o| again || !peer.has_seen(o)).collect();
        if fresh.is_empty() {
            return;
        }
        for oplog in &fresh {
            peer.mark_seen(oplog);
        }
        match peer.send(id, &Message::OplogPush(OplogPush { oplogs: fresh })) {
            Pushed::Backlogged => {
                log::debug!("EntityWorker {}: {} backlogged, forcing sync", id.short(), node_id.short());
                peer.force = true;
            }
            Pushed::Closed => {
                self.peers.remove(node_id);
            }
            _ => {}
        }
    }

    /// Forward to up to `gossip_fanout` identified peers other than `except`.
    fn gossip(&mut self, oplogs: Vec<Oplog>, except: Option<NodeID>, again: bool) {
        if oplogs.is_empty() {
            return;
        }
        let mut targets: Vec<NodeID> = self
            .peers
            .iter()
            .filter(|(node_id, p)| p.member.is_some() && Some(**node_id) != except)
            .map(|(node_id, _)| *node_id)
            .collect();
        if targets.len() > self.settings.gossip_fanout {
            let mut rng = rand::thread_rng();
            for i in 0..self.settings.gossip_fanout {
                let j = rng.gen_range(i..targets.len());
                targets.swap(i, j);
            }
            targets.truncate(self.settings.gossip_fanout);
        }
        for node_id in targets {
            self.push_to(&node_id, oplogs.clone(), again);
        }
    }

    /// Start a merkle round with every identified peer that has none running.
    fn sync_round(&mut self, force: bool) {
        let id = self.id();
        let now = self.engine.now();
        let categories = self.engine.entity_type().categories();
        let (tolerance, max_sync) = (self.settings.future_tolerance_secs, self.settings.max_sync);
        for peer in self.peers.values_mut().filter(|p| p.member.is_some()) {
            if force || peer.force {
                peer.planners.clear();
                peer.force = false;
            }
            for category in &categories {
                if peer.planners.contains_key(category) {
                    continue;
                }
                let mut planner = SyncPlanner::start(*category, now, tolerance, max_sync);
                for query in planner.next_queries() {
                    peer.send(id, &Message::MerkleRequest(MerkleRequest { query }));
                }
                peer.planners.insert(*category, planner);
            }
        }
    }

    fn housekeeping(&mut self) {
        self.reputation.cleanup();
        self.peers.retain(|_, p| !p.link.is_closed());
        // rounds whose replies never came are restarted on the next tick
        for peer in self.peers.values_mut() {
            peer.planners.retain(|_, planner| !planner.is_done());
        }
        if !self.is_healthy() {
            return;
        }
        let hk = self.engine.housekeeping();
        match self.check(hk) {
            Ok(hk) => {
                if hk.expired_oplogs > 0 {
                    log::info!(
                        "EntityWorker {}: {} pending oplogs expired",
                        self.id().short(),
                        hk.expired_oplogs
                    );
                }
                self.gossip(hk.gossip, None, true);
            }
            Err(e) => log::warn!("EntityWorker {}: housekeeping failed: {}", self.id().short(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::engine::tests::Harness;
    use crate::node::identity::UserKey;
    use crate::peer::{PeerEvent, PeerSettings};
    use crate::service::ObjectSource;
    use crate::service::board::{self, ArticleData, BoardOp};
    use ptt_protocol::oplog::{cbor_encode, AddMemberData, MemberOp};
    use ptt_protocol::{Clock, Timestamp};
    use std::sync::Arc;

    fn settings() -> WorkerSettings {
        WorkerSettings::from(&Config::ephemeral("test"))
    }

    fn article(text: &str) -> Vec<u8> {
        cbor_encode(&ArticleData {
            title: text.into(),
            lines: vec![text.as_bytes().to_vec()],
            media_ids: vec![],
        })
        .unwrap()
    }

    /// Forward peer events into one entity worker, the way the node does.
    fn route(mut events: mpsc::Receiver<PeerEvent>, handle: EntityHandle) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let event = match event {
                    PeerEvent::Up { link, .. } => EntityEvent::PeerUp { link },
                    PeerEvent::Down { node_id } => EntityEvent::PeerDown { node_id },
                    PeerEvent::Message { from, entity_id, message } if entity_id == handle.id() => {
                        EntityEvent::Inbound { from, message }
                    }
                    PeerEvent::Message { .. } => continue,
                };
                if handle.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn manager(key: UserKey) -> (PeerManager, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (PeerManager::new(key, PeerSettings::default(), tx), rx)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_submit_then_read_your_write() {
        let h = Harness::new(Arc::new(Clock::new(0)));
        let owner = h.keys.user();
        let mut engine = h.open(PttID::new_under(&owner.id), EntityType::Board);
        engine.bootstrap(&owner, vec![owner.id], Vec::new()).unwrap();
        let (mgr, _rx) = manager(h.keys.node_key().clone());
        let handle = spawn(engine, mgr, settings());

        let a1 = PttID::new_under(&handle.id());
        let oplog = handle
            .submit(Category::Board, BoardOp::CreateArticle as u32, a1, article("hi"))
            .await
            .unwrap();
        assert_eq!(oplog.obj_id, a1);
        let n = handle.query(|e| board::article_list(&*e).len()).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(handle.count_peers().await.unwrap(), PeerCounts::default());
        assert_eq!(handle.health(), Health::Healthy);

        let err = handle
            .submit(Category::Friend, 1, PttID::random(), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ptt_protocol::ErrorKind::BadInput);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.query(|e| e.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_two_workers_converge() {
        let clock = Arc::new(Clock::frozen(Timestamp::from_seconds(1_700_000_000)));
        let ha = Harness::new(clock.clone());
        let hb = Harness::new(clock.clone());

        // A owns the board and admits B's user
        let owner = ha.keys.user();
        let board_id = PttID::new_under(&owner.id);
        let mut a = ha.open(board_id, EntityType::Board);
        a.bootstrap(&owner, vec![owner.id], Vec::new()).unwrap();
        let member = hb.keys.user();
        a.submit(
            Category::Member,
            MemberOp::AddMember as u32,
            member.id,
            cbor_encode(&AddMemberData {
                member_id: member.id,
                member_pub: member.pubkey,
                node_id: Some(hb.keys.node_id()),
            })
            .unwrap(),
        )
        .unwrap();
        let early = PttID::new_under(&board_id);
        a.submit(Category::Board, BoardOp::CreateArticle as u32, early, article("early"))
            .unwrap();

        // B starts from the membership only; the article comes by merkle sync
        let mut b = hb.open(board_id, EntityType::Board);
        let mut membership = a.oplog_list(Category::Master);
        membership.extend(a.oplog_list(Category::Member));
        b.receive(membership).unwrap();

        let (mgr_a, rx_a) = manager(ha.keys.node_key().clone());
        let (mgr_b, rx_b) = manager(hb.keys.node_key().clone());
        let addr_a = mgr_a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handle_a = spawn(a, mgr_a.clone(), settings());
        let handle_b = spawn(b, mgr_b.clone(), settings());
        route(rx_a, handle_a.clone());
        route(rx_b, handle_b.clone());
        mgr_b.connect(&addr_a.to_string(), PeerClass::Explicit).await.unwrap();

        eventually(|| {
            let h = handle_b.clone();
            async move { h.query(move |e| e.object(&early).is_some()).await.unwrap() }
        })
        .await;
        assert_eq!(handle_a.count_peers().await.unwrap().member, 1);
        assert_eq!(handle_b.count_peers().await.unwrap().member, 1);

        // a new article reaches B by gossip
        let late = PttID::new_under(&board_id);
        handle_a
            .submit(Category::Board, BoardOp::CreateArticle as u32, late, article("late"))
            .await
            .unwrap();
        eventually(|| {
            let h = handle_b.clone();
            async move { h.query(move |e| e.object(&late).is_some()).await.unwrap() }
        })
        .await;

        let root_a = handle_a
            .query(|e| e.merkle_index(Category::Board).map(|m| m.root()))
            .await
            .unwrap();
        let root_b = handle_b
            .query(|e| e.merkle_index(Category::Board).map(|m| m.root()))
            .await
            .unwrap();
        assert_eq!(root_a, root_b);
    }
}
