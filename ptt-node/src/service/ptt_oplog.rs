/// PttOplog: the user's activity feed, kept in the Me entity's `ptt`
/// category. Each event gets its own object whose id is derived from the
/// event, so the same event recorded twice collapses into one entry.
use serde::{Deserialize, Serialize};

use ptt_protocol::limits::MAX_COUNT_PTT_OPLOG;
use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{PttID, Timestamp};

use super::{encode_body, Applied, DecodeEntry, Object, ObjectKind, ObjectSource, Result, ServiceError};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PttOp {
    CreateBoard = 1,
    JoinBoard = 2,
    CreateFriend = 3,
    CreateArticle = 4,
    CreateComment = 5,
    CreateMessage = 6,
}

impl PttOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(PttOp::CreateBoard),
            2 => Some(PttOp::JoinBoard),
            3 => Some(PttOp::CreateFriend),
            4 => Some(PttOp::CreateArticle),
            5 => Some(PttOp::CreateComment),
            6 => Some(PttOp::CreateMessage),
            _ => None,
        }
    }
}

/// What an event points at.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PttEventData {
    pub entity_id: PttID,
    pub object_id: Option<PttID>,
}

/// Stored body of an event object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PttEventBody {
    pub op: PttOp,
    pub event: PttEventData,
}

/// Object id of an event recorded in Me `me_id`.
pub fn event_id(me_id: &PttID, op: PttOp, event: &PttEventData) -> PttID {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ptt-event");
    hasher.update(me_id.as_bytes());
    hasher.update(&(op as u32).to_be_bytes());
    hasher.update(event.entity_id.as_bytes());
    if let Some(obj) = &event.object_id {
        hasher.update(obj.as_bytes());
    }
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(me_id.addr(), postfix)
}

fn apply_event(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    if prev.is_some() {
        return Err(ServiceError::Payload("event already recorded".into()));
    }
    let op = PttOp::from_u32(oplog.op).ok_or(ServiceError::UnknownOp {
        category: Category::Ptt.as_str(),
        op: oplog.op,
    })?;
    let data: PttEventData = oplog.decode_data()?;
    if oplog.obj_id != event_id(&oplog.entity_id, op, &data) {
        return Err(ServiceError::Payload("event id does not match its event".into()));
    }
    let body = encode_body(&PttEventBody { op, event: data })?;
    Ok(Applied::object(Object::created(oplog, ObjectKind::PttEvent, body)))
}

macro_rules! event_entry {
    ($op:ident) => {
        DecodeEntry {
            category: Category::Ptt,
            op: PttOp::$op as u32,
            name: stringify!($op),
            creates: true,
            apply: apply_event,
        }
    };
}

pub static TABLE: &[DecodeEntry] = &[
    event_entry!(CreateBoard),
    event_entry!(JoinBoard),
    event_entry!(CreateFriend),
    event_entry!(CreateArticle),
    event_entry!(CreateComment),
    event_entry!(CreateMessage),
];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PttEventView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "CreateTS")]
    pub create_ts: Timestamp,
    #[serde(rename = "CreatorID")]
    pub creator_id: PttID,
    pub op: String,
    #[serde(rename = "EntityID")]
    pub entity_id: PttID,
    #[serde(rename = "ObjID")]
    pub object_id: Option<PttID>,
}

/// Events newest first, capped at `MAX_COUNT_PTT_OPLOG`.
pub fn event_list(src: &dyn ObjectSource) -> Vec<PttEventView> {
    let mut events = src.objects(ObjectKind::PttEvent);
    events.sort_by(|a, b| (b.create_ts, b.id).cmp(&(a.create_ts, a.id)));
    events
        .iter()
        .take(MAX_COUNT_PTT_OPLOG)
        .filter_map(|e| {
            let body: PttEventBody = e.decode_body().ok()?;
            Some(PttEventView {
                id: e.id,
                create_ts: e.create_ts,
                creator_id: e.creator_id,
                op: format!("{:?}", body.op),
                entity_id: body.event.entity_id,
                object_id: body.event.object_id,
            })
        })
        .collect()
}
