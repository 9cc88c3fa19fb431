//! Node context.
//!
//! A [`Node`] is the one value every surface works through: it owns the
//! store, the keys, the clock, the peer manager, the Me raft handle and the
//! registry of running entity workers. Nothing in the crate is global; the
//! RPC server and the CLI hold a `Node` and nothing else.
//!
//! Teardown runs in reverse dependency order: dispatcher, entity workers,
//! raft, peer links.

pub mod actions;
mod dispatch;
pub mod identity;
pub mod join;
pub mod registry;
#[cfg(test)]
mod scenarios;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ptt_protocol::crypto::JoinKeyError;
use ptt_protocol::oplog::{cbor_encode, Category};
use ptt_protocol::{Clock, ErrorKind, JoinUrlError, NodeID, OplogError, PttID};

use crate::config::Config;
use crate::entity::engine::{EngineContext, EngineSettings};
use crate::entity::worker::{self, WorkerSettings};
use crate::entity::{EntityEngine, EntityError, EntityHandle, EntityType};
use crate::me::raft::{self, MeStore, RaftConfig, RaftMessage, RaftTransport, Start};
use crate::me::{JoinKeyRing, MeError, RaftError, RaftHandle};
use crate::peer::message::JoinResponse;
use crate::peer::{Message, PeerError, PeerManager, PeerSettings};
use crate::service::board::{self, BoardBody, BoardOp, BoardType, TitleData};
use crate::service::me_domain::{self, MeBody, MeOp, MyNodeData};
use crate::service::profile::{self, UserNodeData, UserOp};
use crate::service::{self, ServiceError};
use crate::storage::{self, keys, KvStore, MemoryStore, RedbStore, StorageError};
use identity::{KeyError, KeyStore};
use registry::Registry;

/// File name of the store under the data dir.
pub const DB_FILE: &str = "ptt.redb";

const EVENT_QUEUE: usize = 1024;
const AUTHORITY_DEADLINE: Duration = Duration::from_secs(10);

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Me(#[from] MeError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    JoinUrl(#[from] JoinUrlError),

    #[error(transparent)]
    JoinKey(#[from] JoinKeyError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Malformed join payload: {0}")]
    Malformed(String),

    #[error("Join refused: {0}")]
    JoinRefused(String),

    #[error("No answer to the join request")]
    JoinTimeout,
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Entity(e) => e.kind(),
            NodeError::Me(e) => e.kind(),
            NodeError::Raft(e) => e.kind(),
            NodeError::Peer(e) => e.kind(),
            NodeError::Key(e) => e.kind(),
            NodeError::Storage(e) => e.kind(),
            NodeError::Service(e) => e.kind(),
            NodeError::Oplog(e) => e.kind(),
            NodeError::JoinUrl(e) => e.kind(),
            NodeError::JoinKey(e) => e.kind(),
            NodeError::NotFound(_) => ErrorKind::NotFound,
            NodeError::BadInput(_) | NodeError::Malformed(_) => ErrorKind::BadInput,
            NodeError::JoinRefused(_) => ErrorKind::Unauthorized,
            NodeError::JoinTimeout => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Raft transport ──────────────────────────────────────────────────────────

/// Raft traffic rides the peer links, on the frame channel of the Me.
struct PeerRaftTransport {
    peers: PeerManager,
    me_id: Arc<RwLock<PttID>>,
}

impl RaftTransport for PeerRaftTransport {
    fn send(&self, msg: RaftMessage) -> std::result::Result<(), RaftError> {
        let Some(link) = self.peers.links().into_iter().find(|l| l.node_id.raft_id() == msg.to) else {
            log::trace!("raft: no link to {:x}", msg.to);
            return Err(RaftError::Unreachable(msg.to));
        };
        let me_id = *self.me_id.read().unwrap_or_else(|e| e.into_inner());
        let bytes = msg.encode()?;
        link.send(me_id, &Message::Raft(bytes));
        Ok(())
    }
}

/// Mirror one raft driver's leader flag into the node-wide flag.
fn forward_authority(handle: &RaftHandle, to: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
    let mut rx = handle.authority();
    tokio::spawn(async move {
        loop {
            let leader = *rx.borrow_and_update();
            to.send_replace(leader);
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

// ─── Node ────────────────────────────────────────────────────────────────────

pub(crate) struct NodeInner {
    config: Config,
    kv: Arc<dyn KvStore>,
    keys: Arc<KeyStore>,
    clock: Arc<Clock>,
    join_keys: JoinKeyRing,
    registry: Registry,
    peers: PeerManager,
    raft: RwLock<RaftHandle>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// True while this device leads the Me raft group.
    authority: Arc<watch::Sender<bool>>,
    me_id: Arc<RwLock<PttID>>,
    /// `host:port` written into join URLs.
    peer_addr: String,
    /// Join requests we sent, keyed by inviter and entity.
    pending: Mutex<HashMap<(NodeID, PttID), oneshot::Sender<JoinResponse>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    restart: AtomicBool,
}

/// Handle to a running node; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Open the store, bring up peers and raft, then create or reopen the
    /// node's entities.
    pub async fn start(config: Config) -> Result<Node> {
        let kv: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(StorageError::from)?;
                Arc::new(RedbStore::open(dir.join(DB_FILE))?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let keys = Arc::new(KeyStore::load_or_create(kv.clone())?);
        let clock = Arc::new(Clock::new(config.offset_second));
        let join_keys = JoinKeyRing::load(kv.clone(), config.renew_join_key_secs)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let peers = PeerManager::new(keys.node_key().clone(), PeerSettings::from(&config), events_tx);
        let mut bound = None;
        for addr in config.peer_listen_addrs() {
            let parsed: SocketAddr = addr
                .parse()
                .map_err(|e| NodeError::BadInput(format!("listen address {addr}: {e}")))?;
            bound = Some(peers.listen(parsed).await?);
        }
        let bound = bound.ok_or_else(|| NodeError::BadInput("no peer listen address".into()))?;
        let peer_addr = config.advertised_peer_addr(bound.port());

        let stored_me: Option<PttID> = storage::load(kv.as_ref(), keys::NODE_ME_ID)?;
        let me_id = Arc::new(RwLock::new(stored_me.unwrap_or_else(|| keys.user_id())));

        let authority = Arc::new(watch::channel(false).0);
        let raft = spawn_raft(
            &config,
            &kv,
            &keys,
            &peers,
            &me_id,
            Start::Resume,
        )
        .await?;
        let forwarder = forward_authority(&raft, authority.clone());

        let node = Node {
            inner: Arc::new(NodeInner {
                registry: Registry::new(kv.clone()),
                config,
                kv,
                keys,
                clock,
                join_keys,
                peers,
                raft: RwLock::new(raft),
                forwarder: Mutex::new(Some(forwarder)),
                authority,
                me_id,
                peer_addr,
                pending: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(None),
                cancel: CancellationToken::new(),
                restart: AtomicBool::new(false),
            }),
        };
        let dispatcher = tokio::spawn(dispatch::run(node.clone(), events_rx));
        *lock(&node.inner.dispatcher) = Some(dispatcher);

        let opened = match stored_me {
            None => node.bootstrap().await,
            Some(_) => node.reopen(),
        };
        if let Err(e) = opened {
            node.shutdown().await;
            return Err(e);
        }
        log::info!(
            "Node: {} up, me {} node {} peers at {}",
            node.inner.config.node_name,
            node.me_id().short(),
            node.node_id().short(),
            node.inner.peer_addr
        );
        Ok(node)
    }

    /// First start: the Me, its profile and the personal board.
    async fn bootstrap(&self) -> Result<()> {
        self.raft().wait_for_leader().await?;
        self.wait_for_authority().await?;

        let user = self.inner.keys.user();
        let me_id = user.id;
        let node_id = self.node_id();
        let config = &self.inner.config;
        let body = MeBody {
            user_id: me_id,
            profile_id: PttID::new_under(&me_id),
            board_id: PttID::new_under(&me_id),
            merged_into: None,
        };

        let mut me = self.open_engine(me_id, EntityType::Me)?;
        me.bootstrap(&user, vec![me_id], service::encode_body(&body)?)?;
        me.submit(Category::Me, MeOp::CreateMe as u32, me_id, cbor_encode(&body)?)?;
        me.submit(
            Category::Me,
            MeOp::CreateMyNode as u32,
            me_domain::my_node_id(&me_id, &node_id),
            cbor_encode(&MyNodeData {
                node_id,
                node_type: config.node_type,
                name: config.node_name.clone(),
            })?,
        )?;

        let mut profile = self.open_engine(body.profile_id, EntityType::Profile)?;
        profile.bootstrap(&user, vec![me_id], Vec::new())?;
        profile.submit(
            Category::User,
            UserOp::AddUserNode as u32,
            profile::user_node_id(&body.profile_id, &node_id),
            cbor_encode(&UserNodeData { node_id })?,
        )?;

        let mut board = self.open_engine(body.board_id, EntityType::Board)?;
        board.bootstrap(
            &user,
            vec![me_id],
            service::encode_body(&BoardBody {
                title: config.node_name.clone(),
                board_type: BoardType::Personal,
            })?,
        )?;
        board.submit(
            Category::Board,
            BoardOp::SetTitle as u32,
            board::title_id(&body.board_id),
            cbor_encode(&TitleData {
                title: config.node_name.clone(),
            })?,
        )?;

        storage::save(self.inner.kv.as_ref(), keys::NODE_ME_ID, &me_id)?;
        for engine in [me, profile, board] {
            self.host(engine, None)?;
        }
        log::info!("Node: created me {}", me_id.short());
        Ok(())
    }

    /// Restart: every entity on record comes back, stored dial targets too.
    fn reopen(&self) -> Result<()> {
        for record in self.inner.registry.records()? {
            let engine = self.open_engine(record.entity_id, record.entity_type)?;
            self.host(engine, None)?;
            if let Some(addr) = record.dial {
                self.inner.peers.dial(addr, crate::peer::PeerClass::Explicit);
            }
        }
        Ok(())
    }

    async fn wait_for_authority(&self) -> Result<()> {
        let mut rx = self.inner.authority.subscribe();
        tokio::time::timeout(AUTHORITY_DEADLINE, rx.wait_for(|leader| *leader))
            .await
            .map_err(|_| RaftError::DeadlineExceeded)?
            .map_err(|_| RaftError::Stopped)?;
        Ok(())
    }

    // ─── Entities ────────────────────────────────────────────────────────────

    pub(crate) fn engine_ctx(&self) -> EngineContext {
        EngineContext {
            kv: self.inner.kv.clone(),
            keys: self.inner.keys.clone(),
            clock: self.inner.clock.clone(),
            authority: self.inner.authority.subscribe(),
            settings: EngineSettings::from(&self.inner.config),
        }
    }

    pub(crate) fn open_engine(&self, id: PttID, entity_type: EntityType) -> Result<EntityEngine> {
        Ok(EntityEngine::open(id, entity_type, self.engine_ctx())?)
    }

    /// Start the worker of `engine` and put it on record.
    pub(crate) fn host(&self, engine: EntityEngine, dial: Option<String>) -> Result<EntityHandle> {
        let handle = worker::spawn(
            engine,
            self.inner.peers.clone(),
            WorkerSettings::from(&self.inner.config),
        );
        self.inner.registry.insert(handle.clone(), dial)?;
        log::debug!("Node: hosting {} {}", handle.entity_type().as_str(), handle.id().short());
        Ok(handle)
    }

    /// Running worker of `id`.
    pub fn entity(&self, id: &PttID) -> Result<EntityHandle> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| NodeError::NotFound(format!("entity {id}")))
    }

    /// Running worker of `id`, which must be of `entity_type`.
    pub fn entity_of(&self, id: &PttID, entity_type: EntityType) -> Result<EntityHandle> {
        let handle = self.entity(id)?;
        if handle.entity_type() != entity_type {
            return Err(NodeError::NotFound(format!("{} {id}", entity_type.as_str())));
        }
        Ok(handle)
    }

    pub fn entities(&self, entity_type: EntityType) -> Vec<EntityHandle> {
        self.inner.registry.by_type(entity_type)
    }

    pub fn me(&self) -> Result<EntityHandle> {
        self.entity_of(&self.me_id(), EntityType::Me)
    }

    /// The Me object: user, profile and personal board ids.
    pub async fn me_body(&self) -> Result<MeBody> {
        let me_id = self.me_id();
        self.me()?
            .query(move |engine| me_domain::me_body(&*engine, &me_id))
            .await?
            .ok_or_else(|| NodeError::NotFound(format!("me {me_id}")))
    }

    pub async fn profile(&self) -> Result<EntityHandle> {
        let body = self.me_body().await?;
        self.entity_of(&body.profile_id, EntityType::Profile)
    }

    pub async fn personal_board(&self) -> Result<EntityHandle> {
        let body = self.me_body().await?;
        self.entity_of(&body.board_id, EntityType::Board)
    }

    // ─── Raft ────────────────────────────────────────────────────────────────

    pub fn raft(&self) -> RaftHandle {
        self.inner.raft.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.authority.borrow()
    }

    /// Replace the raft driver, e.g. to enter another Me's group.
    pub(crate) async fn respawn_raft(&self, start: Start) -> Result<()> {
        self.raft().shutdown().await;
        if let Some(old) = lock(&self.inner.forwarder).take() {
            old.abort();
        }
        self.inner.authority.send_replace(false);
        let raft = spawn_raft(
            &self.inner.config,
            &self.inner.kv,
            &self.inner.keys,
            &self.inner.peers,
            &self.inner.me_id,
            start,
        )
        .await?;
        *lock(&self.inner.forwarder) = Some(forward_authority(&raft, self.inner.authority.clone()));
        *self.inner.raft.write().unwrap_or_else(|e| e.into_inner()) = raft;
        Ok(())
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn join_keys(&self) -> &JoinKeyRing {
        &self.inner.join_keys
    }

    pub fn peers(&self) -> &PeerManager {
        &self.inner.peers
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn node_id(&self) -> NodeID {
        self.inner.keys.node_id()
    }

    pub fn me_id(&self) -> PttID {
        *self.inner.me_id.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_me_id(&self, id: PttID) -> Result<()> {
        storage::save(self.inner.kv.as_ref(), keys::NODE_ME_ID, &id)?;
        *self.inner.me_id.write().unwrap_or_else(|e| e.into_inner()) = id;
        Ok(())
    }

    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Ask whoever runs the node to stop it (`ptt_shutdown`).
    pub fn request_shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Stop the node and have the runner start it again (`ptt_restart`).
    pub fn request_restart(&self) {
        self.inner.restart.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }

    pub fn restart_requested(&self) -> bool {
        self.inner.restart.load(Ordering::SeqCst)
    }

    /// Resolves once a shutdown was requested.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stop everything; the store is released when the last clone drops.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let dispatcher = lock(&self.inner.dispatcher).take();
        if let Some(task) = dispatcher {
            let _ = task.await;
        }
        self.inner.registry.shutdown().await;
        self.raft().shutdown().await;
        if let Some(task) = lock(&self.inner.forwarder).take() {
            task.abort();
        }
        self.inner.authority.send_replace(false);
        self.inner.peers.shutdown();
        log::info!("Node: {} stopped", self.inner.config.node_name);
    }
}

async fn spawn_raft(
    config: &Config,
    kv: &Arc<dyn KvStore>,
    keys: &KeyStore,
    peers: &PeerManager,
    me_id: &Arc<RwLock<PttID>>,
    start: Start,
) -> Result<RaftHandle> {
    let transport = Arc::new(PeerRaftTransport {
        peers: peers.clone(),
        me_id: me_id.clone(),
    });
    let raft_config = RaftConfig {
        tick: config.raft_tick,
        weight: config.node_type.weight(),
    };
    Ok(raft::spawn(
        keys.node_id().raft_id(),
        raft_config,
        MeStore::new(kv.clone()),
        transport,
        start,
    )
    .await?)
}
