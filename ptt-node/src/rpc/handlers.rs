//! Method table.
//!
//! `account_`, `content_` and `friend_` methods take the entity id first;
//! `me_` methods work on the node's own Me. Membership, oplog and peer
//! listings are shared by every prefix through [`entity_common`].
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use ptt_protocol::oplog::{cbor_decode, Category, Oplog};
use ptt_protocol::{JoinKind, JoinUrl, MerkleNode, PttID, Status, Timestamp};

use super::params::{encode_base64, page, Params};
use super::{Result, RpcError};
use crate::entity::{EntityEngine, EntityHandle, EntityRecord, EntityType};
use crate::me::RaftStatus;
use crate::node::Node;
use crate::service::board::{
    self, article_block_list, article_list, article_view, media_view, page_blocks, BoardBody, CommentType,
    ContentType, TitleData,
};
use crate::service::friend::{message_block_list, message_list, FriendBody};
use crate::service::me_domain::{me_body, my_node_list};
use crate::service::profile::{user_img, user_name, user_node_list};
use crate::service::ptt_oplog::event_list;
use crate::service::ObjectSource;

/// Run `method` with `params` against `node`.
pub async fn handle_call(node: &Node, method: &str, params: Params) -> Result<Value> {
    let unknown = || RpcError::UnknownMethod(method.to_string());
    let (prefix, name) = method.split_once('_').ok_or_else(unknown)?;
    let answer = match prefix {
        "me" => me(node, name, &params).await?,
        "account" => account(node, name, &params).await?,
        "content" => content(node, name, &params).await?,
        "friend" => friend(node, name, &params).await?,
        "ptt" => ptt(node, name, &params).await?,
        _ => None,
    };
    answer.ok_or_else(unknown)
}

fn to_json<T: Serialize>(value: T) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(value)?))
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct OplogView {
    #[serde(rename = "ID")]
    id: PttID,
    #[serde(rename = "EntityID")]
    entity_id: PttID,
    #[serde(rename = "CreatorID")]
    creator_id: PttID,
    #[serde(rename = "ObjID")]
    obj_id: PttID,
    #[serde(rename = "PreLogID")]
    pre_log_id: Option<PttID>,
    #[serde(rename = "MasterLogID")]
    master_log_id: PttID,
    #[serde(rename = "CreateTS")]
    create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    update_ts: Timestamp,
    #[serde(rename = "C")]
    category: &'static str,
    #[serde(rename = "O")]
    op: u32,
    op_name: &'static str,
    hash: String,
    #[serde(rename = "D")]
    data: String,
    #[serde(rename = "NMasterSigns")]
    n_master_signs: usize,
    is_sync: bool,
}

impl OplogView {
    fn of(engine: &EntityEngine, oplog: &Oplog) -> Self {
        OplogView {
            id: oplog.id,
            entity_id: oplog.entity_id,
            creator_id: oplog.creator_id,
            obj_id: oplog.obj_id,
            pre_log_id: oplog.pre_log_id,
            master_log_id: oplog.master_log_id,
            create_ts: oplog.create_ts,
            update_ts: oplog.update_ts,
            category: oplog.category.as_str(),
            op: oplog.op,
            op_name: engine.op_name(oplog),
            hash: hex::encode(oplog.hash),
            data: encode_base64(&oplog.data),
            n_master_signs: oplog.master_signs.len(),
            is_sync: oplog.is_sync,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct MerkleNodeView {
    level: u8,
    #[serde(rename = "StartTS")]
    start_ts: i64,
    #[serde(rename = "EndTS")]
    end_ts: i64,
    hash: String,
    #[serde(rename = "N")]
    count: u32,
}

impl From<MerkleNode> for MerkleNodeView {
    fn from(node: MerkleNode) -> Self {
        MerkleNodeView {
            level: node.level,
            start_ts: node.start,
            end_ts: node.end(),
            hash: hex::encode(node.hash),
            count: node.count,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct BoardView {
    #[serde(rename = "ID")]
    id: PttID,
    title: String,
    status: Status,
    #[serde(rename = "BT")]
    board_type: String,
    #[serde(rename = "CreatorID")]
    creator_id: PttID,
    #[serde(rename = "CreateTS")]
    create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    update_ts: Timestamp,
    #[serde(rename = "NArticle")]
    n_article: usize,
}

fn board_view(engine: &EntityEngine) -> BoardView {
    let record = engine.record();
    let body: Option<BoardBody> = cbor_decode(&record.body).ok();
    let title = engine
        .object(&board::title_id(&record.id))
        .and_then(|o| o.decode_body::<TitleData>().ok())
        .map(|t| t.title)
        .or_else(|| body.as_ref().map(|b| b.title.clone()))
        .unwrap_or_default();
    BoardView {
        id: record.id,
        title,
        status: record.status,
        board_type: body.map(|b| format!("{:?}", b.board_type)).unwrap_or_default(),
        creator_id: record.creator_id,
        create_ts: record.create_ts,
        update_ts: record.update_ts,
        n_article: article_list(engine).len(),
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct FriendView {
    #[serde(rename = "ID")]
    id: PttID,
    #[serde(rename = "FriendID")]
    friend_id: Option<PttID>,
    status: Status,
    #[serde(rename = "CreateTS")]
    create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    update_ts: Timestamp,
    #[serde(rename = "NMessage")]
    n_message: usize,
}

fn friend_view(engine: &EntityEngine, me: &PttID) -> FriendView {
    let record = engine.record();
    let body: Option<FriendBody> = cbor_decode(&record.body).ok();
    FriendView {
        id: record.id,
        friend_id: body.and_then(|b| b.other(me)),
        status: record.status,
        create_ts: record.create_ts,
        update_ts: record.update_ts,
        n_message: message_list(engine).len(),
    }
}

fn raft_status(status: &RaftStatus) -> Value {
    json!({
        "ID": status.id,
        "Term": status.term,
        "Role": status.role.as_str(),
        "Lead": status.lead.unwrap_or(0),
        "Commit": status.commit,
        "Applied": status.applied,
        "LastIndex": status.last_index,
        "ConfState": status.conf_view(),
        "TotalWeight": status.conf.total_weight(),
    })
}

fn join_url(url: &JoinUrl) -> Result<Option<Value>> {
    Ok(Some(json!({
        "C": url.inviter_id,
        "ID": url.entity_id,
        "Pn": url.name,
        "URL": url.encode()?,
        "ExpireTS": url.expire_ts,
    })))
}

/// Block lists with their `Buf` lines as base64.
fn with_base64_bufs<T: Serialize>(blocks: Vec<T>) -> Result<Option<Value>> {
    let mut value = serde_json::to_value(blocks)?;
    if let Value::Array(items) = &mut value {
        for item in items {
            if let Some(Value::Array(lines)) = item.get("Buf").cloned() {
                let encoded: Vec<Value> = lines
                    .iter()
                    .map(|line| {
                        let bytes: Vec<u8> = serde_json::from_value(line.clone()).unwrap_or_default();
                        Value::String(encode_base64(&bytes))
                    })
                    .collect();
                item["Buf"] = Value::Array(encoded);
            }
        }
    }
    Ok(Some(value))
}

async fn record_of(handle: &EntityHandle) -> Result<EntityRecord> {
    Ok(handle.query(|engine| engine.record().clone()).await?)
}

// ---------------------------------------------------------------------------
// Shared entity methods
// ---------------------------------------------------------------------------

async fn oplog_list(handle: &EntityHandle, category: Category, p: &Params, base: usize) -> Result<Option<Value>> {
    let start = p.opt_id(base)?;
    let limit = p.or::<usize>(base + 1, 0)?;
    let descending = p.descending(base + 2)?;
    let views = handle
        .query(move |engine| {
            let engine: &EntityEngine = engine;
            engine
                .oplog_list(category)
                .iter()
                .map(|o| OplogView::of(engine, o))
                .collect::<Vec<_>>()
        })
        .await?;
    to_json(page(views, start, limit, descending, |v| v.id))
}

async fn merkle_node_list(handle: &EntityHandle, category: Category, p: &Params, base: usize) -> Result<Option<Value>> {
    let level = p.or::<u8>(base, 0)?;
    let start = p.or::<i64>(base + 1, i64::MIN)?;
    let limit = p.or::<usize>(base + 2, 0)?;
    let descending = p.descending(base + 3)?;
    let mut nodes = handle
        .query(move |engine| engine.merkle_nodes(category, level, start, i64::MAX))
        .await??;
    if descending {
        nodes.reverse();
    }
    if limit != 0 {
        nodes.truncate(limit);
    }
    to_json(nodes.into_iter().map(MerkleNodeView::from).collect::<Vec<_>>())
}

/// Methods every entity answers; params start at `base`.
async fn entity_common(node: &Node, handle: &EntityHandle, name: &str, p: &Params, base: usize) -> Result<Option<Value>> {
    match name {
        "getMasterListFromCache" => to_json(handle.query(|e| e.membership().masters()).await?),
        "getMasterList" => {
            let masters = handle.query(|e| e.membership().master_history()).await?;
            to_json(page(
                masters,
                p.opt_id(base)?,
                p.or(base + 1, 0)?,
                p.descending(base + 2)?,
                |m| m.id,
            ))
        }
        "getMemberList" => {
            let members = handle.query(|e| e.membership().members()).await?;
            to_json(page(
                members,
                p.opt_id(base)?,
                p.or(base + 1, 0)?,
                p.descending(base + 2)?,
                |m| m.id,
            ))
        }
        "getMasterOplogList" => oplog_list(handle, Category::Master, p, base).await,
        "getMemberOplogList" => oplog_list(handle, Category::Member, p, base).await,
        "getOpKeyOplogList" => oplog_list(handle, Category::OpKey, p, base).await,
        "getMasterOplogMerkleNodeList" => merkle_node_list(handle, Category::Master, p, base).await,
        "getMemberOplogMerkleNodeList" => merkle_node_list(handle, Category::Member, p, base).await,
        "getOpKeyInfos" => to_json(handle.query(|e| e.opkey_infos()).await?),
        "getOpKeyInfosFromDB" => to_json(handle.query(|e| e.opkey_history()).await?),
        "getPeers" => to_json(handle.peers().await?),
        "countPeers" => to_json(handle.count_peers().await?.total()),
        "forceSync" => {
            handle.force_sync().await?;
            to_json(true)
        }
        "deleteMember" => {
            node.delete_member(&handle.id(), p.id(base)?).await?;
            to_json(true)
        }
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// me_
// ---------------------------------------------------------------------------

async fn me(node: &Node, name: &str, p: &Params) -> Result<Option<Value>> {
    let config = node.config();
    match name {
        "get" => {
            let record = record_of(&node.me()?).await?;
            Ok(Some(json!({
                "ID": record.id,
                "Status": record.status,
                "NodeID": node.node_id(),
                "RaftID": node.node_id().raft_id(),
                "NodeName": config.node_name,
                "NodeType": config.node_type.as_str(),
                "IsLeader": node.is_leader(),
            })))
        }
        "getRawMe" => {
            let id = p.opt_id(0)?.unwrap_or_else(|| node.me_id());
            let handle = node.entity_of(&id, EntityType::Me)?;
            let (record, body) = handle
                .query(move |e| (e.record().clone(), me_body(&*e, &id)))
                .await?;
            Ok(Some(json!({ "Record": record, "Me": body })))
        }
        "getRaftStatus" => Ok(Some(raft_status(&node.raft().status()))),
        "getTotalWeight" => to_json(node.raft().status().conf.total_weight()),
        "requestRaftLead" => Ok(Some(raft_status(&node.request_raft_lead().await?))),
        "showMyKey" => to_json(node.keys().user().my_key()),
        "validateMyKey" => {
            let key: String = p.req(0)?;
            to_json(key == node.keys().user().my_key())
        }
        "showURL" => join_url(&node.join_url(JoinKind::Friend, node.me_id(), config.node_name.clone())?),
        "showMeURL" => join_url(&node.join_url(JoinKind::Me, node.me_id(), config.node_name.clone())?),
        "joinFriend" => to_json(node.join_friend(&p.req::<String>(0)?).await?),
        "joinBoard" => to_json(node.join_board(&p.req::<String>(0)?).await?),
        "joinMe" => {
            let url: String = p.req(0)?;
            let my_key: String = p.req(1)?;
            to_json(node.join_me(&url, &my_key).await?)
        }
        "getMyNodes" => to_json(node.me()?.query(|e| my_node_list(&*e)).await?),
        "getJoinKeyInfos" => to_json(node.join_keys().infos()),
        "revokeOpKey" => {
            let text: String = p.req(0)?;
            let my_key: String = p.req(1)?;
            if my_key != node.keys().user().my_key() {
                return Err(RpcError::Unauthorized("myKey does not match".into()));
            }
            let bytes = hex::decode(&text).map_err(|e| RpcError::BadParams(format!("param 0: {e}")))?;
            let hash: [u8; 32] = bytes
                .try_into()
                .map_err(|_| RpcError::BadParams("param 0: opkey hash must be 32 bytes".into()))?;
            node.revoke_opkey(hash).await?;
            to_json(true)
        }
        "getMyMasterOplogList" => oplog_list(&node.me()?, Category::Master, p, 0).await,
        "getMeOplogList" => oplog_list(&node.me()?, Category::Me, p, 0).await,
        "setMyName" => {
            node.set_my_name(p.bytes(0)?).await?;
            let profile = node.profile().await?;
            let owner = node.keys().user_id();
            to_json(profile.query(move |e| user_name(&*e, &e.id(), &owner)).await?)
        }
        "setMyImage" => {
            node.set_my_image(p.bytes(0)?).await?;
            let profile = node.profile().await?;
            let owner = node.keys().user_id();
            to_json(profile.query(move |e| user_img(&*e, &e.id(), &owner)).await?)
        }
        other => entity_common(node, &node.me()?, other, p, 0).await,
    }
}

// ---------------------------------------------------------------------------
// account_
// ---------------------------------------------------------------------------

async fn account(node: &Node, name: &str, p: &Params) -> Result<Option<Value>> {
    let handle = match p.opt_id(0)? {
        Some(id) => node.entity_of(&id, EntityType::Profile)?,
        None => node.profile().await?,
    };
    match name {
        "getRawProfile" => to_json(record_of(&handle).await?),
        "getRawUserName" => {
            let name = handle
                .query(|e| {
                    let owner = e.record().creator_id;
                    user_name(&*e, &e.id(), &owner)
                })
                .await?;
            to_json(name.ok_or_else(|| not_found("user name"))?)
        }
        "getRawUserImg" => {
            let img = handle
                .query(|e| {
                    let owner = e.record().creator_id;
                    user_img(&*e, &e.id(), &owner)
                })
                .await?;
            to_json(img.ok_or_else(|| not_found("user image"))?)
        }
        "getUserNodeList" => {
            to_json(
                handle
                    .query(|e| {
                        let owner = e.record().creator_id;
                        user_node_list(&*e, &owner)
                    })
                    .await?,
            )
        }
        "getUserOplogList" => oplog_list(&handle, Category::User, p, 1).await,
        other => entity_common(node, &handle, other, p, 1).await,
    }
}

fn not_found(what: &str) -> RpcError {
    RpcError::Node(crate::node::NodeError::NotFound(what.to_string()))
}

// ---------------------------------------------------------------------------
// content_
// ---------------------------------------------------------------------------

fn comment_type(v: u8) -> Result<CommentType> {
    match v {
        0 => Ok(CommentType::None),
        1 => Ok(CommentType::Push),
        2 => Ok(CommentType::Boo),
        other => Err(RpcError::BadParams(format!("unknown comment type {other}"))),
    }
}

fn content_type(v: u8) -> Result<ContentType> {
    match v {
        0 => Ok(ContentType::Article),
        1 => Ok(ContentType::Comment),
        other => Err(RpcError::BadParams(format!("unknown content type {other}"))),
    }
}

fn text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn content(node: &Node, name: &str, p: &Params) -> Result<Option<Value>> {
    match name {
        "getBoardList" => {
            let mut boards = Vec::new();
            for handle in node.entities(EntityType::Board) {
                boards.push(handle.query(|e| board_view(&*e)).await?);
            }
            boards.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
            return to_json(page(boards, p.opt_id(0)?, p.or(1, 0)?, p.descending(2)?, |b| b.id));
        }
        "createBoard" => {
            let board_id = node.create_board(text(p.bytes(0)?), p.or(1, false)?).await?;
            let handle = node.entity_of(&board_id, EntityType::Board)?;
            return to_json(handle.query(|e| board_view(&*e)).await?);
        }
        _ => {}
    }

    let board_id = p.id(0)?;
    let handle = node.entity_of(&board_id, EntityType::Board)?;
    match name {
        "getRawBoard" => {
            let record = record_of(&handle).await?;
            let body: Option<BoardBody> = cbor_decode(&record.body).ok();
            Ok(Some(json!({ "Record": record, "Board": body })))
        }
        "showBoardURL" => {
            let title = handle.query(|e| board_view(&*e).title).await?;
            join_url(&node.join_url(JoinKind::Board, board_id, title)?)
        }
        "setTitle" => {
            node.set_title(&board_id, text(p.bytes(1)?)).await?;
            to_json(handle.query(|e| board_view(&*e)).await?)
        }
        "getRawTitle" => {
            let title_id = board::title_id(&board_id);
            let title = handle
                .query(move |e| e.object(&title_id))
                .await?
                .ok_or_else(|| not_found("title"))?;
            let data: TitleData = title.decode_body()?;
            Ok(Some(json!({
                "ID": title.id,
                "Title": data.title,
                "Status": title.status,
                "UpdateTS": title.update_ts,
            })))
        }
        "createArticle" => {
            let lines = p.lines(2)?;
            let n_block = lines.len();
            let oplog = node
                .create_article(&board_id, text(p.bytes(1)?), lines, p.ids(3)?)
                .await?;
            Ok(Some(json!({
                "BoardID": board_id,
                "ArticleID": oplog.obj_id,
                "CreateTS": oplog.create_ts,
                "NBlock": n_block,
            })))
        }
        "updateArticle" => {
            let article_id = p.id(1)?;
            let title = handle
                .query(move |e| e.object(&article_id).map(|a| article_view(&*e, &a).title))
                .await?
                .ok_or_else(|| not_found("article"))?;
            let oplog = node
                .update_article(&board_id, article_id, title, p.lines(2)?, p.ids(3)?)
                .await?;
            Ok(Some(json!({
                "BoardID": board_id,
                "ArticleID": article_id,
                "UpdateTS": oplog.update_ts,
            })))
        }
        "deleteArticle" => {
            let article_id = p.id(1)?;
            node.delete_article(&board_id, article_id).await?;
            Ok(Some(json!({ "BoardID": board_id, "ArticleID": article_id })))
        }
        "createComment" => {
            let article_id = p.id(1)?;
            let oplog = node
                .create_comment(
                    &board_id,
                    article_id,
                    comment_type(p.req(2)?)?,
                    p.bytes(3)?,
                    p.opt_id(4)?,
                )
                .await?;
            Ok(Some(json!({
                "BoardID": board_id,
                "ArticleID": article_id,
                "CommentID": oplog.obj_id,
                "CreateTS": oplog.create_ts,
            })))
        }
        "deleteComment" => {
            let article_id = p.id(1)?;
            let comment_id = p.id(2)?;
            node.delete_comment(&board_id, comment_id).await?;
            Ok(Some(json!({
                "BoardID": board_id,
                "ArticleID": article_id,
                "CommentID": comment_id,
            })))
        }
        "getArticleList" => {
            let articles = handle.query(|e| article_list(&*e)).await?;
            to_json(page(articles, p.opt_id(1)?, p.or(2, 0)?, p.descending(3)?, |a| a.id))
        }
        "getArticleBlockList" => {
            let article_id = p.id(1)?;
            let kind = content_type(p.or(3, 0)?)?;
            let block_id: u32 = p.or(4, 0)?;
            let limit: usize = p.or(5, 0)?;
            let descending = p.descending(6)?;
            let blocks = handle
                .query(move |e| article_block_list(&*e, &article_id))
                .await??;
            with_base64_bufs(page_blocks(blocks, kind, block_id, limit, descending))
        }
        "uploadFile" => {
            let file_name: String = p.req(1)?;
            let oplog = node.upload_media(&board_id, file_name, p.bytes(2)?).await?;
            let media_id = oplog.obj_id;
            let view = handle
                .query(move |e| e.object(&media_id).as_ref().and_then(media_view))
                .await?;
            to_json(view.ok_or_else(|| not_found("media"))?)
        }
        "getBoardOplogList" => oplog_list(&handle, Category::Board, p, 1).await,
        other => entity_common(node, &handle, other, p, 1).await,
    }
}

// ---------------------------------------------------------------------------
// friend_
// ---------------------------------------------------------------------------

async fn friend(node: &Node, name: &str, p: &Params) -> Result<Option<Value>> {
    let me = node.keys().user_id();
    if name == "getFriendList" {
        let mut friends = Vec::new();
        for handle in node.entities(EntityType::Friend) {
            friends.push(handle.query(move |e| friend_view(&*e, &me)).await?);
        }
        friends.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
        return to_json(page(friends, p.opt_id(0)?, p.or(1, 0)?, false, |f| f.id));
    }

    let friend_id = p.id(0)?;
    let handle = node.entity_of(&friend_id, EntityType::Friend)?;
    match name {
        "getRawFriend" => {
            let record = record_of(&handle).await?;
            let body: Option<FriendBody> = cbor_decode(&record.body).ok();
            Ok(Some(json!({ "Record": record, "Friend": body })))
        }
        "getMessageList" => {
            let messages = handle.query(|e| message_list(&*e)).await?;
            to_json(page(messages, p.opt_id(1)?, p.or(2, 0)?, p.descending(3)?, |m| m.id))
        }
        "getMessageBlockList" => {
            let message_id = p.id(1)?;
            let limit: usize = p.or(5, 0)?;
            let mut blocks = handle
                .query(move |e| message_block_list(&*e, &message_id))
                .await??;
            if limit != 0 {
                blocks.truncate(limit);
            }
            with_base64_bufs(blocks)
        }
        "createMessage" => {
            let lines = p.lines(1)?;
            let n_block = lines.len();
            let oplog = node.create_message(&friend_id, lines).await?;
            Ok(Some(json!({
                "FriendID": friend_id,
                "MessageID": oplog.obj_id,
                "CreateTS": oplog.create_ts,
                "NBlock": n_block,
            })))
        }
        "getFriendOplogList" => oplog_list(&handle, Category::Friend, p, 1).await,
        other => entity_common(node, &handle, other, p, 1).await,
    }
}

// ---------------------------------------------------------------------------
// ptt_
// ---------------------------------------------------------------------------

/// Key under which `ptt_getOps` lists the node's own signing key.
pub const BOOTSTRAP_OP: &str = "bootstrap";

async fn ptt(node: &Node, name: &str, p: &Params) -> Result<Option<Value>> {
    let clock = node.clock();
    match name {
        "getVersion" => to_json(crate::VERSION),
        "countPeers" => to_json(node.peers().counts()),
        "getPeers" => to_json(node.peers().peers()),
        "getOps" => {
            let mut ops: BTreeMap<String, PttID> = BTreeMap::new();
            ops.insert(BOOTSTRAP_OP.to_string(), node.me_id());
            for handle in node.registry().handles() {
                for info in handle.query(|e| e.opkey_infos()).await? {
                    ops.insert(info.hash, info.entity_id);
                }
            }
            to_json(ops)
        }
        "getPttOplogList" => {
            let mut events = node.me()?.query(|e| event_list(&*e)).await?;
            events.reverse();
            to_json(page(events, p.opt_id(0)?, p.or(1, 0)?, p.descending(2)?, |e| e.id))
        }
        "shutdown" => {
            node.request_shutdown();
            to_json(true)
        }
        "restart" => {
            node.request_restart();
            to_json(true)
        }
        "getOffsetSecond" => to_json(clock.offset_second()),
        "setOffsetSecond" => {
            let offset: i64 = p.req(0)?;
            clock.set_offset_second(offset);
            log::info!("rpc: clock offset set to {offset}s");
            to_json(offset)
        }
        "getTimestamp" => to_json(clock.now()),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::ObjectKind;

    fn count_objects(engine: &EntityEngine, kind: ObjectKind) -> usize {
        engine.objects(kind).len()
    }

    async fn call(node: &Node, method: &str, params: Value) -> Result<Value> {
        let params = Params::from_value(params)?;
        handle_call(node, method, params).await
    }

    async fn start() -> Node {
        Node::start(Config::ephemeral("rpc")).await.unwrap()
    }

    fn b64(s: &str) -> String {
        encode_base64(s.as_bytes())
    }

    #[tokio::test]
    async fn test_single_node_views() {
        let node = start().await;
        let me = call(&node, "me_get", json!([])).await.unwrap();
        assert_eq!(me["Status"], json!("alive"));
        assert_eq!(me["ID"], json!(node.me_id()));
        assert_eq!(call(&node, "me_getOpKeyInfos", json!([])).await.unwrap().as_array().unwrap().len(), 1);

        let boards = call(&node, "content_getBoardList", json!([])).await.unwrap();
        let boards = boards.as_array().unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0]["Status"], json!("alive"));
        assert_eq!(boards[0]["Title"], json!("rpc"));

        let ops = call(&node, "ptt_getOps", json!([])).await.unwrap();
        assert_eq!(ops[BOOTSTRAP_OP], json!(node.me_id()));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_article_and_comment_flow() {
        let node = start().await;
        let board = call(&node, "content_createBoard", json!([b64("b"), true])).await.unwrap();
        assert_eq!(board["BT"], json!("Private"));
        let board_id = board["ID"].clone();
        let open = call(&node, "content_createBoard", json!([b64("open"), false])).await.unwrap();
        assert_eq!(open["BT"], json!("Personal"));
        let article = call(
            &node,
            "content_createArticle",
            json!([board_id, b64("title"), [b64("l1"), b64("l2")], []]),
        )
        .await
        .unwrap();
        let article_id = article["ArticleID"].clone();
        call(&node, "content_createComment", json!([board_id, article_id, 1, b64("+"), ""]))
            .await
            .unwrap();

        let blocks = call(&node, "content_getArticleBlockList", json!([board_id, article_id, "", 0, 0, 0, 2]))
            .await
            .unwrap();
        let blocks = blocks.as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["Buf"], json!([b64("l1"), b64("l2")]));
        assert_eq!(blocks[1]["Buf"], json!([b64("+")]));

        let list = call(&node, "content_getArticleList", json!([board_id])).await.unwrap();
        assert_eq!(list[0]["NP"], json!(1));

        let oplogs = call(&node, "content_getBoardOplogList", json!([board_id, "", 0, 2])).await.unwrap();
        assert!(oplogs.as_array().unwrap().len() >= 3);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_profile_name() {
        let node = start().await;
        let view = call(&node, "me_setMyName", json!([b64("alice")])).await.unwrap();
        assert_eq!(view["Name"], json!("alice"));
        let raw = call(&node, "account_getRawUserName", json!([])).await.unwrap();
        assert_eq!(raw["Name"], json!("alice"));
        let profile = node.profile().await.unwrap();
        let names = profile.query(|e| count_objects(&*e, ObjectKind::UserName)).await.unwrap();
        assert_eq!(names, 1);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_my_key_checks() {
        let node = start().await;
        let key = call(&node, "me_showMyKey", json!([])).await.unwrap();
        assert_eq!(call(&node, "me_validateMyKey", json!([key])).await.unwrap(), json!(true));
        assert_eq!(call(&node, "me_validateMyKey", json!(["nope"])).await.unwrap(), json!(false));
        let err = call(&node, "me_revokeOpKey", json!([hex::encode([0u8; 32]), "nope"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32003);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_offset_second() {
        let node = start().await;
        let before = node.clock().now();
        call(&node, "ptt_setOffsetSecond", json!([3600])).await.unwrap();
        assert_eq!(call(&node, "ptt_getOffsetSecond", json!([])).await.unwrap(), json!(3600));
        assert!(node.clock().now().ts >= before.ts + 3600);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_and_restart_flags() {
        let node = start().await;
        assert_eq!(call(&node, "ptt_restart", json!([])).await.unwrap(), json!(true));
        assert!(node.restart_requested());
        node.stopped().await;
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let node = start().await;
        for method in ["ptt", "me_nope", "other_get"] {
            let err = call(&node, method, json!([])).await.unwrap_err();
            assert!(matches!(err, RpcError::UnknownMethod(_)), "{method}");
        }
        let err = call(&node, "content_getRawBoard", json!(["not base58 !"])).await.unwrap_err();
        assert_eq!(err.code(), -32602);
        node.shutdown().await;
    }
}
