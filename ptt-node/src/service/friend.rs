use serde::{Deserialize, Serialize};

use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{PttID, Status, Timestamp};

use super::blocks::make_blocks;
use super::{encode_body, Applied, DecodeEntry, Object, ObjectKind, ObjectSource, Result, ServiceError};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FriendOp {
    CreateMessage = 1,
}

/// Creation payload of a friend entity: the two users it joins.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FriendBody {
    pub user_ids: [PttID; 2],
}

impl FriendBody {
    /// The user on the other side of `me`.
    pub fn other(&self, me: &PttID) -> Option<PttID> {
        match self.user_ids {
            [a, b] if a == *me => Some(b),
            [a, b] if b == *me => Some(a),
            _ => None,
        }
    }
}

/// Friend entity of two users; the same pair always maps to the same id.
pub fn friend_id(a: &PttID, b: &PttID) -> PttID {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ptt-friend");
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(lo.addr(), postfix)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageData {
    pub lines: Vec<Vec<u8>>,
}

fn apply_create_message(_prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: MessageData = oplog.decode_data()?;
    if data.lines.is_empty() {
        return Err(ServiceError::Payload("empty message".into()));
    }
    let blocks = make_blocks(&oplog.obj_id, &oplog.id, &data.lines)?;
    let mut object = Object::created(oplog, ObjectKind::Message, encode_body(&())?);
    object.blocks = blocks.iter().map(|b| b.to_ref()).collect();
    Ok(Applied { object, blocks })
}

pub static TABLE: &[DecodeEntry] = &[DecodeEntry {
    category: Category::Friend,
    op: FriendOp::CreateMessage as u32,
    name: "CreateMessage",
    creates: true,
    apply: apply_create_message,
}];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MessageView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "FriendID")]
    pub friend_id: PttID,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    #[serde(rename = "ContentBlockID")]
    pub content_block_id: Option<PttID>,
    #[serde(rename = "NBlock")]
    pub n_block: usize,
    pub status: Status,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MessageBlock {
    #[serde(rename = "MessageID")]
    pub message_id: PttID,
    #[serde(rename = "BlockID")]
    pub block_id: u32,
    pub status: Status,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    pub buf: Vec<Vec<u8>>,
}

fn message_view(message: &Object) -> MessageView {
    MessageView {
        id: message.id,
        friend_id: message.entity_id,
        create_ts: message.create_ts,
        update_ts: message.update_ts,
        creator_id: message.creator_id,
        content_block_id: message.blocks.first().map(|b| b.id),
        n_block: message.blocks.len(),
        status: message.status,
    }
}

/// Messages ordered by `(createTS, id)`, oldest first.
pub fn message_list(src: &dyn ObjectSource) -> Vec<MessageView> {
    let mut messages = src.objects(ObjectKind::Message);
    messages.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
    messages.iter().map(message_view).collect()
}

pub fn message_block_list(src: &dyn ObjectSource, message_id: &PttID) -> Result<Vec<MessageBlock>> {
    let message = src
        .object(message_id)
        .filter(|m| m.kind == ObjectKind::Message)
        .ok_or_else(|| ServiceError::NotFound(message_id.to_string()))?;
    message
        .blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            Ok(MessageBlock {
                message_id: message.id,
                block_id: i as u32,
                status: message.status,
                creator_id: message.creator_id,
                buf: src.block_lines(&message.id, block)?,
            })
        })
        .collect()
}
