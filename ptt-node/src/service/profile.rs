/// User profile: name, image, name card and the user's node list.
///
/// Each of name, image and card is a single object whose id is derived from
/// the profile id, so every set op updates the same chain. User-node objects
/// are keyed by node.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{NodeID, PttID, Status, Timestamp};

use super::{
    apply_delete, encode_body, require_alive, Applied, DecodeEntry, Object, ObjectKind,
    ObjectSource, Result, ServiceError,
};

pub const MAX_USER_NAME_BYTES: usize = 100;
pub const MAX_USER_IMG_BYTES: usize = 1024 * 1024;
pub const MAX_NAME_CARD_BYTES: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum UserOp {
    SetUserName = 1,
    SetUserImg = 2,
    SetNameCard = 3,
    AddUserNode = 4,
    RemoveUserNode = 5,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ImgType {
    Unknown = 0,
    Jpeg = 1,
    Gif = 2,
    Png = 3,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserNameData {
    pub name: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserImgData {
    pub img_type: ImgType,
    pub width: u16,
    pub height: u16,
    pub img: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NameCardData {
    pub card: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserNodeData {
    pub node_id: NodeID,
}

fn derived_id(profile_id: &PttID, tag: &[u8], extra: &[u8]) -> PttID {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    hasher.update(profile_id.as_bytes());
    hasher.update(extra);
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(profile_id.addr(), postfix)
}

pub fn user_name_id(profile_id: &PttID) -> PttID {
    derived_id(profile_id, b"ptt-user-name", &[])
}

pub fn user_img_id(profile_id: &PttID) -> PttID {
    derived_id(profile_id, b"ptt-user-img", &[])
}

pub fn name_card_id(profile_id: &PttID) -> PttID {
    derived_id(profile_id, b"ptt-name-card", &[])
}

pub fn user_node_id(profile_id: &PttID, node_id: &NodeID) -> PttID {
    derived_id(profile_id, b"ptt-user-node", node_id.as_bytes())
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

fn set_body<T: Serialize>(prev: Option<&Object>, oplog: &Oplog, kind: ObjectKind, body: &T) -> Result<Applied> {
    let body = encode_body(body)?;
    let object = match prev {
        Some(prev) => {
            let mut next = require_alive(Some(prev))?.updated(oplog);
            next.body = body;
            next
        }
        None => Object::created(oplog, kind, body),
    };
    Ok(Applied::object(object))
}

fn apply_set_user_name(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: UserNameData = oplog.decode_data()?;
    if data.name.len() > MAX_USER_NAME_BYTES {
        return Err(ServiceError::Payload(format!("user name of {} bytes", data.name.len())));
    }
    set_body(prev, oplog, ObjectKind::UserName, &data)
}

fn apply_set_user_img(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: UserImgData = oplog.decode_data()?;
    if data.img.len() > MAX_USER_IMG_BYTES {
        return Err(ServiceError::Payload(format!("image of {} bytes", data.img.len())));
    }
    set_body(prev, oplog, ObjectKind::UserImg, &data)
}

fn apply_set_name_card(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: NameCardData = oplog.decode_data()?;
    if data.card.len() > MAX_NAME_CARD_BYTES {
        return Err(ServiceError::Payload(format!("name card of {} bytes", data.card.len())));
    }
    set_body(prev, oplog, ObjectKind::NameCard, &data)
}

fn apply_add_user_node(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: UserNodeData = oplog.decode_data()?;
    // re-adding a removed node revives it on the same chain
    let object = match prev {
        Some(prev) => {
            let mut next = prev.updated(oplog);
            next.status = Status::Alive;
            next.body = encode_body(&data)?;
            next
        }
        None => Object::created(oplog, ObjectKind::UserNode, encode_body(&data)?),
    };
    Ok(Applied::object(object))
}

pub static TABLE: &[DecodeEntry] = &[
    DecodeEntry {
        category: Category::User,
        op: UserOp::SetUserName as u32,
        name: "SetUserName",
        creates: true,
        apply: apply_set_user_name,
    },
    DecodeEntry {
        category: Category::User,
        op: UserOp::SetUserImg as u32,
        name: "SetUserImg",
        creates: true,
        apply: apply_set_user_img,
    },
    DecodeEntry {
        category: Category::User,
        op: UserOp::SetNameCard as u32,
        name: "SetNameCard",
        creates: true,
        apply: apply_set_name_card,
    },
    DecodeEntry {
        category: Category::User,
        op: UserOp::AddUserNode as u32,
        name: "AddUserNode",
        creates: true,
        apply: apply_add_user_node,
    },
    DecodeEntry {
        category: Category::User,
        op: UserOp::RemoveUserNode as u32,
        name: "RemoveUserNode",
        creates: false,
        apply: apply_delete,
    },
];

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UserNameView {
    #[serde(rename = "ID")]
    pub id: PttID,
    pub name: String,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UserImgView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "T")]
    pub img_type: ImgType,
    #[serde(rename = "W")]
    pub width: u16,
    #[serde(rename = "H")]
    pub height: u16,
    /// Base64 image bytes.
    #[serde(rename = "I")]
    pub img: String,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NameCardView {
    #[serde(rename = "ID")]
    pub id: PttID,
    pub card: String,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UserNodeView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "UserID")]
    pub user_id: PttID,
    #[serde(rename = "NodeID")]
    pub node_id: NodeID,
    pub status: Status,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
}

/// The profile's name; `user_id` is the profile owner.
pub fn user_name(src: &dyn ObjectSource, profile_id: &PttID, user_id: &PttID) -> Option<UserNameView> {
    let object = src.object(&user_name_id(profile_id))?;
    let data: UserNameData = object.decode_body().ok()?;
    Some(UserNameView {
        id: *user_id,
        name: String::from_utf8_lossy(&data.name).into_owned(),
        update_ts: object.update_ts,
    })
}

pub fn user_img(src: &dyn ObjectSource, profile_id: &PttID, user_id: &PttID) -> Option<UserImgView> {
    let object = src.object(&user_img_id(profile_id))?;
    let data: UserImgData = object.decode_body().ok()?;
    Some(UserImgView {
        id: *user_id,
        img_type: data.img_type,
        width: data.width,
        height: data.height,
        img: BASE64.encode(&data.img),
        update_ts: object.update_ts,
    })
}

pub fn name_card(src: &dyn ObjectSource, profile_id: &PttID, user_id: &PttID) -> Option<NameCardView> {
    let object = src.object(&name_card_id(profile_id))?;
    let data: NameCardData = object.decode_body().ok()?;
    Some(NameCardView {
        id: *user_id,
        card: String::from_utf8_lossy(&data.card).into_owned(),
        update_ts: object.update_ts,
    })
}

pub fn user_node_list(src: &dyn ObjectSource, user_id: &PttID) -> Vec<UserNodeView> {
    let mut nodes: Vec<UserNodeView> = src
        .objects(ObjectKind::UserNode)
        .into_iter()
        .filter_map(|o| {
            let data: UserNodeData = o.decode_body().ok()?;
            Some(UserNodeView {
                id: o.id,
                user_id: *user_id,
                node_id: data.node_id,
                status: o.status,
                update_ts: o.update_ts,
            })
        })
        .collect();
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::service::tests::{oplog_for, MemSource};
    use crate::service::DecodeTable;

    #[test]
    fn test_set_user_name_updates_one_object() {
        let table = DecodeTable::for_type(EntityType::Profile);
        let mut src = MemSource::default();
        let profile = PttID::random();
        let user = PttID::random();
        let obj = user_name_id(&profile);

        let first = oplog_for(profile, Category::User, UserOp::SetUserName as u32, obj, &UserNameData { name: b"alice".to_vec() }, 0);
        src.apply(&table, None, &first);
        let prev = src.object(&obj);
        let second = oplog_for(profile, Category::User, UserOp::SetUserName as u32, obj, &UserNameData { name: "愛麗絲".as_bytes().to_vec() }, 1);
        src.apply(&table, prev.as_ref(), &second);

        let view = user_name(&src, &profile, &user).unwrap();
        assert_eq!(view.id, user);
        assert_eq!(view.name, "愛麗絲");
        assert_eq!(src.object(&obj).unwrap().log_id, first.id);
        assert!(user_img(&src, &profile, &user).is_none());
    }

    #[test]
    fn test_oversized_name_rejected() {
        let table = DecodeTable::for_type(EntityType::Profile);
        let profile = PttID::random();
        let big = oplog_for(profile, Category::User, UserOp::SetUserName as u32, user_name_id(&profile), &UserNameData { name: vec![b'a'; MAX_USER_NAME_BYTES + 1] }, 0);
        assert!(matches!(table.apply(None, &big), Err(ServiceError::Payload(_))));
    }

    #[test]
    fn test_user_node_remove_and_readd() {
        let table = DecodeTable::for_type(EntityType::Profile);
        let mut src = MemSource::default();
        let profile = PttID::random();
        let node = NodeID([7u8; 32]);
        let obj = user_node_id(&profile, &node);

        let add = oplog_for(profile, Category::User, UserOp::AddUserNode as u32, obj, &UserNodeData { node_id: node }, 0);
        src.apply(&table, None, &add);
        let prev = src.object(&obj);
        let remove = oplog_for(profile, Category::User, UserOp::RemoveUserNode as u32, obj, &(), 1);
        src.apply(&table, prev.as_ref(), &remove);
        assert_eq!(user_node_list(&src, &PttID::ZERO)[0].status, Status::Deleted);

        let prev = src.object(&obj);
        let readd = oplog_for(profile, Category::User, UserOp::AddUserNode as u32, obj, &UserNodeData { node_id: node }, 2);
        src.apply(&table, prev.as_ref(), &readd);
        let nodes = user_node_list(&src, &PttID::ZERO);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, Status::Alive);
        assert_eq!(nodes[0].node_id, node);
    }
}
