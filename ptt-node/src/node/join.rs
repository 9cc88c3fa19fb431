//! Join flows: friend, board and me.
//!
//! The joiner reads a [`JoinUrl`], links to the inviting node, derives a
//! session key against the join key published in the URL and sends one
//! sealed [`JoinRequest`] on the channel of the entity it joins. The inviter
//! opens it with its own half of the join key, admits the joiner and answers
//! with a sealed [`JoinResponse`] carrying the oplogs the joiner needs.
//!
//! | kind   | joiner sends                       | inviter answers               |
//! |--------|------------------------------------|-------------------------------|
//! | friend | friend entity + own personal board | own personal board            |
//! | board  | who it is                          | the board, joiner a member    |
//! | me     | proof over the join key (`myKey`)  | Me, profile, board, raft peers|
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use ptt_protocol::crypto::{joiner_session, open, seal};
use ptt_protocol::oplog::{
    cbor_encode, AddMasterData, AddMemberData, Category, MasterOp, MemberOp, MigrateEntityData,
};
use ptt_protocol::{JoinKind, JoinUrl, NodeID, PttID, Timestamp};

use super::{lock, Node, NodeError, Result};
use crate::entity::{EntityHandle, EntityType};
use crate::me::join::EntityBundle;
use crate::me::raft::Start;
use crate::me::{JoinMeAccept, JoinMeRequest};
use crate::node::identity::UserKey;
use crate::peer::message::{JoinRequest, JoinResponse};
use crate::peer::{Message, PeerClass};
use crate::service::friend::{friend_id, FriendBody};
use crate::service::me_domain::{self, MeOp, MigrateMeData, MyNodeData};
use crate::service::profile::{self, UserNodeData, UserOp};
use crate::service::ptt_oplog::PttOp;
use crate::service;

const JOIN_DEADLINE: Duration = Duration::from_secs(30);

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug)]
struct FriendJoinRequest {
    user_id: PttID,
    user_pub: [u8; 32],
    node_id: NodeID,
    name: String,
    /// The friend entity, already naming the inviter as a master.
    friend: EntityBundle,
    /// Joiner's personal board, the inviter already a member.
    board: EntityBundle,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct FriendJoinAccept {
    board: EntityBundle,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct BoardJoinRequest {
    user_id: PttID,
    user_pub: [u8; 32],
    node_id: NodeID,
    name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct BoardJoinAccept {
    board: EntityBundle,
}

/// Answer of `me_joinFriend`, `me_joinBoard` and `me_joinMe`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Entity joined (or created, for friends).
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "C")]
    pub creator_id: PttID,
    #[serde(rename = "n")]
    pub node_id: NodeID,
    #[serde(rename = "H")]
    pub hash: String,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "S")]
    pub status: String,
}

impl JoinOutcome {
    fn accepted(entity_id: PttID, url: &JoinUrl) -> Self {
        JoinOutcome {
            entity_id,
            creator_id: url.inviter_id,
            node_id: url.node_id,
            hash: hex::encode(url.join_key_hash),
            name: url.name.clone(),
            status: "accepted".into(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| NodeError::Malformed(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| NodeError::Malformed(e.to_string()))
}

fn check_user(user_id: &PttID, user_pub: &[u8; 32]) -> Result<()> {
    if PttID::from_pubkey(user_pub) != *user_id {
        return Err(NodeError::JoinRefused("user key does not match its id".into()));
    }
    Ok(())
}

fn add_member_data(member: PttID, member_pub: [u8; 32], node_id: NodeID) -> Result<Vec<u8>> {
    Ok(cbor_encode(&AddMemberData {
        member_id: member,
        member_pub,
        node_id: Some(node_id),
    })?)
}

impl Node {
    // ─── URLs ────────────────────────────────────────────────────────────────

    /// Join URL for `entity_id` carrying the current join key.
    pub fn join_url(&self, kind: JoinKind, entity_id: PttID, name: String) -> Result<JoinUrl> {
        let now = self.clock().now();
        let key = self.join_keys().current(now)?;
        let user = self.keys().user();
        Ok(JoinUrl {
            kind,
            entity_id,
            inviter_id: user.id,
            inviter_pub: user.pubkey,
            node_id: self.node_id(),
            join_key_pub: key.public,
            join_key_hash: key.hash,
            signalling_addr: self.peer_addr().to_string(),
            name,
            expire_ts: key.expire_ts,
        })
    }

    // ─── Adoption ────────────────────────────────────────────────────────────

    /// Take in the oplogs of an entity, hosting it if it is new here.
    pub(crate) async fn adopt(&self, bundle: EntityBundle, dial: Option<String>) -> Result<EntityHandle> {
        if let Some(handle) = self.registry().get(&bundle.entity_id) {
            let oplogs = bundle.oplogs;
            handle.query(move |engine| engine.receive(oplogs)).await??;
            if dial.is_some() {
                self.registry().insert(handle.clone(), dial)?;
            }
            return Ok(handle);
        }
        let mut engine = self.open_engine(bundle.entity_id, bundle.entity_type)?;
        let outcome = engine.receive(bundle.oplogs)?;
        if !engine.membership().is_created() {
            return Err(NodeError::Malformed(format!(
                "bundle of {} does not create it ({} rejected)",
                bundle.entity_id, outcome.rejected
            )));
        }
        self.host(engine, dial)
    }

    async fn export(&self, handle: &EntityHandle) -> Result<EntityBundle> {
        let oplogs = handle.query(|engine| engine.export_bundle()).await?;
        Ok(EntityBundle {
            entity_id: handle.id(),
            entity_type: handle.entity_type(),
            oplogs,
        })
    }

    /// Make `user` a member of `board` unless it already is.
    async fn admit(&self, board: &EntityHandle, user: PttID, user_pub: [u8; 32], node_id: NodeID) -> Result<()> {
        let known = board
            .query(move |engine| engine.membership().is_member(&user) || engine.membership().is_master(&user))
            .await?;
        if !known {
            board
                .submit(
                    Category::Member,
                    MemberOp::AddMember as u32,
                    user,
                    add_member_data(user, user_pub, node_id)?,
                )
                .await?;
        }
        Ok(())
    }

    // ─── Joiner ──────────────────────────────────────────────────────────────

    /// Link to the inviter, send the sealed request and wait for the answer.
    async fn request_join(&self, url: &JoinUrl, entity_id: PttID, payload: Vec<u8>) -> Result<Vec<u8>> {
        let node_id = self.peers().connect(&url.signalling_addr, PeerClass::Explicit).await?;
        if node_id != url.node_id {
            return Err(NodeError::JoinRefused(format!(
                "{} answered for {}",
                node_id.short(),
                url.node_id.short()
            )));
        }
        let (ephemeral_pub, session) = joiner_session(&url.join_key_pub)?;
        let request = JoinRequest {
            kind: url.kind,
            entity_id,
            join_key_hash: url.join_key_hash,
            ephemeral_pub,
            sealed: seal(&payload, &session)?,
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert((node_id, entity_id), tx);
        self.peers().send(&node_id, entity_id, &Message::JoinRequest(request))?;
        log::info!(
            "join: asked {} to join {} {}",
            node_id.short(),
            url.kind.as_str(),
            entity_id.short()
        );

        let answer = tokio::time::timeout(JOIN_DEADLINE, rx).await;
        lock(&self.inner.pending).remove(&(node_id, entity_id));
        let response = match answer {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => return Err(NodeError::JoinTimeout),
        };
        match (response.sealed, response.error) {
            (Some(sealed), None) => Ok(open(&sealed, &session)?),
            (_, Some(reason)) => Err(NodeError::JoinRefused(reason)),
            (None, None) => Err(NodeError::JoinRefused("empty answer".into())),
        }
    }

    /// `me_joinFriend`.
    pub async fn join_friend(&self, text: &str) -> Result<JoinOutcome> {
        let url = JoinUrl::decode_for(text, JoinKind::Friend, self.clock().now())?;
        let user = self.keys().user();
        if url.inviter_id == user.id {
            return Err(NodeError::BadInput("cannot befriend yourself".into()));
        }
        let id = friend_id(&user.id, &url.inviter_id);
        if self.registry().contains(&id) {
            return Ok(JoinOutcome::accepted(id, &url));
        }

        let mut friend = self.open_engine(id, EntityType::Friend)?;
        if !friend.membership().is_created() {
            let mut user_ids = [user.id, url.inviter_id];
            user_ids.sort();
            friend.bootstrap(&user, user_ids.to_vec(), service::encode_body(&FriendBody { user_ids })?)?;
            friend.submit(
                Category::Master,
                MasterOp::AddMaster as u32,
                url.inviter_id,
                cbor_encode(&AddMasterData {
                    master_id: url.inviter_id,
                    master_pub: url.inviter_pub,
                })?,
            )?;
        }
        let board = self.personal_board().await?;
        self.admit(&board, url.inviter_id, url.inviter_pub, url.node_id).await?;

        let request = FriendJoinRequest {
            user_id: user.id,
            user_pub: user.pubkey,
            node_id: self.node_id(),
            name: self.config().node_name.clone(),
            friend: EntityBundle {
                entity_id: id,
                entity_type: EntityType::Friend,
                oplogs: friend.export_bundle(),
            },
            board: self.export(&board).await?,
        };
        let answer: FriendJoinAccept = decode(&self.request_join(&url, id, encode(&request)?).await?)?;
        if answer.board.entity_type != EntityType::Board {
            return Err(NodeError::Malformed("friend answer without a board".into()));
        }

        let dial = Some(url.signalling_addr.clone());
        self.adopt(answer.board, dial.clone()).await?;
        self.host(friend, dial)?;
        self.record_event(PttOp::CreateFriend, id, None).await;
        log::info!("join: befriended {}", url.inviter_id.short());
        Ok(JoinOutcome::accepted(id, &url))
    }

    /// `me_joinBoard`.
    pub async fn join_board(&self, text: &str) -> Result<JoinOutcome> {
        let url = JoinUrl::decode_for(text, JoinKind::Board, self.clock().now())?;
        if self.registry().contains(&url.entity_id) {
            return Ok(JoinOutcome::accepted(url.entity_id, &url));
        }
        let user = self.keys().user();
        let request = BoardJoinRequest {
            user_id: user.id,
            user_pub: user.pubkey,
            node_id: self.node_id(),
            name: self.config().node_name.clone(),
        };
        let answer: BoardJoinAccept = decode(&self.request_join(&url, url.entity_id, encode(&request)?).await?)?;
        if answer.board.entity_id != url.entity_id || answer.board.entity_type != EntityType::Board {
            return Err(NodeError::Malformed("answer is not the requested board".into()));
        }
        self.adopt(answer.board, Some(url.signalling_addr.clone())).await?;
        self.record_event(PttOp::JoinBoard, url.entity_id, None).await;
        Ok(JoinOutcome::accepted(url.entity_id, &url))
    }

    /// `me_joinMe`: become another device of the Me behind `text`.
    ///
    /// The local Me is migrated into the joined one and the raft driver
    /// restarts as a member of the joined group.
    pub async fn join_me(&self, text: &str, my_key: &str) -> Result<JoinOutcome> {
        let url = JoinUrl::decode_for(text, JoinKind::Me, self.clock().now())?;
        let new_user = UserKey::from_my_key(my_key)?;
        if new_user.id != url.inviter_id {
            return Err(NodeError::BadInput("myKey does not belong to the url".into()));
        }
        let legacy_me = self.me_id();
        if legacy_me == url.entity_id {
            return Err(NodeError::BadInput("already a device of this me".into()));
        }

        let request = JoinMeRequest::new(
            &new_user,
            &url.join_key_hash,
            self.node_id(),
            self.config().node_type,
            self.config().node_name.clone(),
        )?;
        let answer: JoinMeAccept = decode(&self.request_join(&url, url.entity_id, encode(&request)?).await?)?;
        if answer.me_id != url.entity_id || answer.bundles.first().map(|b| b.entity_type) != Some(EntityType::Me) {
            return Err(NodeError::Malformed("answer is not the requested me".into()));
        }

        let legacy_user = self.keys().switch_user(new_user.clone())?;
        let dial = Some(url.signalling_addr.clone());
        for bundle in answer.bundles {
            self.adopt(bundle, dial.clone()).await?;
        }
        self.migrate_legacy_me(legacy_me, &legacy_user, &new_user, answer.me_id)
            .await?;
        self.set_me_id(answer.me_id)?;
        self.respawn_raft(Start::Join).await?;

        for (node_id, addr) in answer.peers {
            if node_id == self.node_id() || self.peers().is_connected(&node_id) {
                continue;
            }
            if let Some(addr) = addr {
                self.peers().dial(addr, PeerClass::Member);
            }
        }
        log::info!("join: now a device of me {}", answer.me_id.short());
        Ok(JoinOutcome::accepted(answer.me_id, &url))
    }

    /// Mark the pre-join Me as merged into `new_me`; the legacy owner stays
    /// listed so its old signatures keep verifying.
    async fn migrate_legacy_me(&self, legacy_me: PttID, legacy: &UserKey, new_user: &UserKey, new_me: PttID) -> Result<()> {
        let handle = self.entity_of(&legacy_me, EntityType::Me)?;
        handle
            .submit(
                Category::Me,
                MeOp::MigrateMe as u32,
                legacy_me,
                cbor_encode(&MigrateMeData { new_me_id: new_me })?,
            )
            .await?;
        handle
            .submit(
                Category::Master,
                MasterOp::MigrateEntity as u32,
                legacy_me,
                cbor_encode(&MigrateEntityData {
                    legacy_owner: legacy.id,
                    new_owner: new_user.id,
                    new_owner_pub: new_user.pubkey,
                    merged_into: Some(new_me),
                })?,
            )
            .await?;
        log::info!("join: me {} migrated into {}", legacy_me.short(), new_me.short());
        Ok(())
    }

    // ─── Inviter ─────────────────────────────────────────────────────────────

    async fn accept_friend(&self, from: NodeID, request: FriendJoinRequest) -> Result<Vec<u8>> {
        check_user(&request.user_id, &request.user_pub)?;
        let user = self.keys().user();
        let id = friend_id(&request.user_id, &user.id);
        if request.friend.entity_id != id || request.friend.entity_type != EntityType::Friend {
            return Err(NodeError::Malformed("friend entity does not match the pair".into()));
        }
        if request.board.entity_type != EntityType::Board {
            return Err(NodeError::Malformed("friend request without a board".into()));
        }
        let friend = self.adopt(request.friend, None).await?;
        let user_id = user.id;
        if !friend.query(move |engine| engine.membership().is_master(&user_id)).await? {
            return Err(NodeError::JoinRefused("friend entity does not name us".into()));
        }
        self.adopt(request.board, None).await?;

        let board = self.personal_board().await?;
        self.admit(&board, request.user_id, request.user_pub, from).await?;
        let answer = FriendJoinAccept {
            board: self.export(&board).await?,
        };
        self.record_event(PttOp::CreateFriend, id, None).await;
        log::info!("join: {} ({}) is now a friend", request.user_id.short(), request.name);
        encode(&answer)
    }

    async fn accept_board(&self, from: NodeID, board_id: PttID, request: BoardJoinRequest) -> Result<Vec<u8>> {
        check_user(&request.user_id, &request.user_pub)?;
        let board = self.entity_of(&board_id, EntityType::Board)?;
        if board.query(|engine| engine.local_master().is_none()).await? {
            return Err(NodeError::JoinRefused("not a master of the board".into()));
        }
        self.admit(&board, request.user_id, request.user_pub, from).await?;
        log::info!(
            "join: {} ({}) joined board {}",
            request.user_id.short(),
            request.name,
            board_id.short()
        );
        encode(&BoardJoinAccept {
            board: self.export(&board).await?,
        })
    }

    /// Admit a new device; returns the answer and the raft voter to add.
    async fn accept_me(&self, from: NodeID, me_id: PttID, hash: &[u8; 32], request: JoinMeRequest) -> Result<(Vec<u8>, u64, u32)> {
        if me_id != self.me_id() {
            return Err(NodeError::NotFound(format!("me {me_id}")));
        }
        if request.node_id != from {
            return Err(NodeError::JoinRefused("request names another node".into()));
        }
        request.verify(&self.keys().user_id(), hash)?;
        if !self.is_leader() {
            return Err(NodeError::JoinRefused("not the raft leader".into()));
        }

        let me = self.me()?;
        let profile = self.profile().await?;
        let board = self.personal_board().await?;
        me.submit(
            Category::Me,
            MeOp::CreateMyNode as u32,
            me_domain::my_node_id(&me_id, &request.node_id),
            cbor_encode(&MyNodeData {
                node_id: request.node_id,
                node_type: request.node_type,
                name: request.name.clone(),
            })?,
        )
        .await?;
        let profile_id = profile.id();
        profile
            .submit(
                Category::User,
                UserOp::AddUserNode as u32,
                profile::user_node_id(&profile_id, &request.node_id),
                cbor_encode(&UserNodeData {
                    node_id: request.node_id,
                })?,
            )
            .await?;

        let known = self.peers().peers();
        let mut peers = vec![(self.node_id(), Some(self.peer_addr().to_string()))];
        let nodes = me.query(|engine| me_domain::my_node_list(&*engine)).await?;
        for node in nodes {
            if node.node_id == self.node_id() || node.node_id == request.node_id || !node.status.is_alive() {
                continue;
            }
            let addr = known.iter().find(|p| p.node_id == node.node_id).and_then(|p| p.addr.clone());
            peers.push((node.node_id, addr));
        }
        let answer = JoinMeAccept {
            me_id,
            bundles: vec![
                self.export(&me).await?,
                self.export(&profile).await?,
                self.export(&board).await?,
            ],
            peers,
        };
        log::info!("join: {} ({}) joins me {}", request.node_id.short(), request.name, me_id.short());
        Ok((encode(&answer)?, request.node_id.raft_id(), request.node_type.weight()))
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Append a PttOplog entry; only the raft leader writes them.
    pub(crate) async fn record_event(&self, op: PttOp, entity_id: PttID, object_id: Option<PttID>) {
        if !self.is_leader() {
            return;
        }
        if let Err(e) = self.write_event(op, entity_id, object_id).await {
            log::warn!("Node: cannot record {:?} on {}: {}", op, entity_id.short(), e);
        }
    }

    async fn write_event(&self, op: PttOp, entity_id: PttID, object_id: Option<PttID>) -> Result<()> {
        use crate::service::ptt_oplog::{event_id, PttEventData};
        let me_id = self.me_id();
        let data = PttEventData { entity_id, object_id };
        let id = event_id(&me_id, op, &data);
        self.me()?.submit(Category::Ptt, op as u32, id, cbor_encode(&data)?).await?;
        Ok(())
    }
}

// ─── Inviter entry ───────────────────────────────────────────────────────────

/// Answer a join request that arrived from `from`.
pub(super) async fn handle_request(node: Node, from: NodeID, request: JoinRequest) {
    let entity_id = request.entity_id;
    let now: Timestamp = node.clock().now();
    let Some(key) = node.join_keys().find(&request.join_key_hash, now) else {
        refuse(&node, from, entity_id, "unknown or expired join key");
        return;
    };
    let session = match key.session_key(&request.ephemeral_pub) {
        Ok(session) => session,
        Err(e) => {
            refuse(&node, from, entity_id, &e.to_string());
            return;
        }
    };
    let accepted = match open(&request.sealed, &session) {
        Ok(plain) => answer(&node, from, &request, &plain).await,
        Err(e) => Err(e.into()),
    };
    match accepted {
        Ok((body, voter)) => {
            let sealed = match seal(&body, &session) {
                Ok(sealed) => sealed,
                Err(e) => {
                    refuse(&node, from, entity_id, &e.to_string());
                    return;
                }
            };
            let response = JoinResponse {
                entity_id,
                sealed: Some(sealed),
                error: None,
            };
            if let Err(e) = node.peers().send(&from, entity_id, &Message::JoinResponse(response)) {
                log::warn!("join: cannot answer {}: {}", from.short(), e);
                return;
            }
            if let Some((raft_id, weight)) = voter {
                node.peers().mark_member(&from);
                let raft = node.raft();
                tokio::spawn(async move {
                    if let Err(e) = raft.add_node(raft_id, weight).await {
                        log::warn!("join: cannot add raft voter {:x}: {}", raft_id, e);
                    }
                });
            }
        }
        Err(e) => {
            log::info!("join: refused {} from {}: {}", request.kind.as_str(), from.short(), e);
            refuse(&node, from, entity_id, &e.to_string());
        }
    }
}

async fn answer(node: &Node, from: NodeID, request: &JoinRequest, plain: &[u8]) -> Result<(Vec<u8>, Option<(u64, u32)>)> {
    match request.kind {
        JoinKind::Friend => Ok((node.accept_friend(from, decode(plain)?).await?, None)),
        JoinKind::Board => Ok((node.accept_board(from, request.entity_id, decode(plain)?).await?, None)),
        JoinKind::Me => {
            let (body, raft_id, weight) = node
                .accept_me(from, request.entity_id, &request.join_key_hash, decode(plain)?)
                .await?;
            Ok((body, Some((raft_id, weight))))
        }
    }
}

fn refuse(node: &Node, from: NodeID, entity_id: PttID, reason: &str) {
    let response = JoinResponse {
        entity_id,
        sealed: None,
        error: Some(reason.to_string()),
    };
    if let Err(e) = node.peers().send(&from, entity_id, &Message::JoinResponse(response)) {
        log::debug!("join: cannot refuse {}: {}", from.short(), e);
    }
}

/// Hand an answer to the join waiting for it.
pub(super) fn complete(node: &Node, from: NodeID, response: JoinResponse) {
    match lock(&node.inner.pending).remove(&(from, response.entity_id)) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => log::debug!("join: unexpected answer from {}", from.short()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_user_key_must_match_id() {
        let key = UserKey::generate();
        check_user(&key.id, &key.pubkey).unwrap();
        assert!(matches!(
            check_user(&UserKey::generate().id, &key.pubkey),
            Err(NodeError::JoinRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_join_url_carries_current_key() {
        let node = Node::start(Config::ephemeral("t0")).await.unwrap();
        let url = node
            .join_url(JoinKind::Friend, node.me_id(), "t0".into())
            .unwrap();
        let decoded = JoinUrl::decode_for(&url.encode().unwrap(), JoinKind::Friend, node.clock().now()).unwrap();
        assert_eq!(decoded.inviter_id, node.keys().user_id());
        assert_eq!(decoded.signalling_addr, node.peer_addr());
        assert!(node.join_keys().find(&decoded.join_key_hash, node.clock().now()).is_some());

        // a url of ours cannot befriend ourselves
        assert!(matches!(
            node.join_friend(&url.encode().unwrap()).await,
            Err(NodeError::BadInput(_))
        ));
        node.shutdown().await;
    }
}
