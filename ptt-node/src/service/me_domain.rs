/// Me domain: the Me object and one MyNode per device.
use serde::{Deserialize, Serialize};

use ptt_protocol::oplog::{Category, Oplog};
use ptt_protocol::{NodeID, PttID, Status, Timestamp};

use super::{
    apply_delete, encode_body, require_alive, Applied, DecodeEntry, Object, ObjectKind,
    ObjectSource, Result, ServiceError,
};
use crate::me::NodeType;

pub const MAX_NODE_NAME_BYTES: usize = 64;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MeOp {
    CreateMe = 1,
    CreateMyNode = 2,
    RemoveMyNode = 3,
    MigrateMe = 4,
    SetNodeName = 5,
}

/// Body of the Me object (`objID = meID`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MeBody {
    pub user_id: PttID,
    pub profile_id: PttID,
    pub board_id: PttID,
    /// Set on a legacy Me once it has been merged into another.
    pub merged_into: Option<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MyNodeData {
    pub node_id: NodeID,
    pub node_type: NodeType,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MigrateMeData {
    pub new_me_id: PttID,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NodeNameData {
    pub name: String,
}

pub fn my_node_id(me_id: &PttID, node_id: &NodeID) -> PttID {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ptt-my-node");
    hasher.update(me_id.as_bytes());
    hasher.update(node_id.as_bytes());
    let mut postfix = [0u8; 16];
    postfix.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    PttID::from_parts(me_id.addr(), postfix)
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NODE_NAME_BYTES {
        return Err(ServiceError::Payload(format!("node name of {} bytes", name.len())));
    }
    Ok(())
}

fn apply_create_me(_prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let body: MeBody = oplog.decode_data()?;
    if oplog.obj_id != oplog.entity_id {
        return Err(ServiceError::Payload("Me object must carry the entity id".into()));
    }
    Ok(Applied::object(Object::created(oplog, ObjectKind::Me, encode_body(&body)?)))
}

fn apply_create_my_node(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let data: MyNodeData = oplog.decode_data()?;
    check_name(&data.name)?;
    if oplog.obj_id != my_node_id(&oplog.entity_id, &data.node_id) {
        return Err(ServiceError::Payload("MyNode id does not match its node".into()));
    }
    let object = match prev {
        // a node that left and came back continues its chain
        Some(prev) => {
            let mut next = prev.updated(oplog);
            next.status = Status::Alive;
            next.body = encode_body(&data)?;
            next
        }
        None => Object::created(oplog, ObjectKind::MyNode, encode_body(&data)?),
    };
    Ok(Applied::object(object))
}

fn apply_migrate_me(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let prev = require_alive(prev)?;
    let data: MigrateMeData = oplog.decode_data()?;
    let mut body: MeBody = prev.decode_body()?;
    body.merged_into = Some(data.new_me_id);
    let mut object = prev.updated(oplog);
    object.status = Status::Migrated;
    object.body = encode_body(&body)?;
    Ok(Applied::object(object))
}

fn apply_set_node_name(prev: Option<&Object>, oplog: &Oplog) -> Result<Applied> {
    let prev = require_alive(prev)?;
    let name: NodeNameData = oplog.decode_data()?;
    check_name(&name.name)?;
    let mut data: MyNodeData = prev.decode_body()?;
    data.name = name.name;
    let mut object = prev.updated(oplog);
    object.body = encode_body(&data)?;
    Ok(Applied::object(object))
}

pub static ME_TABLE: &[DecodeEntry] = &[
    DecodeEntry {
        category: Category::Me,
        op: MeOp::CreateMe as u32,
        name: "CreateMe",
        creates: true,
        apply: apply_create_me,
    },
    DecodeEntry {
        category: Category::Me,
        op: MeOp::CreateMyNode as u32,
        name: "CreateMyNode",
        creates: true,
        apply: apply_create_my_node,
    },
    DecodeEntry {
        category: Category::Me,
        op: MeOp::RemoveMyNode as u32,
        name: "RemoveMyNode",
        creates: false,
        apply: apply_delete,
    },
    DecodeEntry {
        category: Category::Me,
        op: MeOp::MigrateMe as u32,
        name: "MigrateMe",
        creates: false,
        apply: apply_migrate_me,
    },
    DecodeEntry {
        category: Category::Me,
        op: MeOp::SetNodeName as u32,
        name: "SetNodeName",
        creates: false,
        apply: apply_set_node_name,
    },
];

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MyNodeView {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "NodeID")]
    pub node_id: NodeID,
    #[serde(rename = "RaftID")]
    pub raft_id: u64,
    #[serde(rename = "NodeType")]
    pub node_type: NodeType,
    pub weight: u32,
    pub name: String,
    pub status: Status,
    #[serde(rename = "UpdateTS")]
    pub update_ts: Timestamp,
}

pub fn me_body(src: &dyn ObjectSource, me_id: &PttID) -> Option<MeBody> {
    src.object(me_id)?.decode_body().ok()
}

pub fn my_node(object: &Object) -> Option<MyNodeView> {
    let data: MyNodeData = object.decode_body().ok()?;
    Some(MyNodeView {
        id: object.id,
        node_id: data.node_id,
        raft_id: data.node_id.raft_id(),
        node_type: data.node_type,
        weight: data.node_type.weight(),
        name: data.name,
        status: object.status,
        update_ts: object.update_ts,
    })
}

/// Device records, sorted by raft id.
pub fn my_node_list(src: &dyn ObjectSource) -> Vec<MyNodeView> {
    let mut nodes: Vec<MyNodeView> = src
        .objects(ObjectKind::MyNode)
        .iter()
        .filter_map(my_node)
        .collect();
    nodes.sort_by_key(|n| n.raft_id);
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::service::tests::{oplog_for, MemSource};
    use crate::service::DecodeTable;

    fn me_body_for(me: &PttID) -> MeBody {
        MeBody {
            user_id: PttID::random(),
            profile_id: PttID::new_under(me),
            board_id: PttID::new_under(me),
            merged_into: None,
        }
    }

    #[test]
    fn test_create_me_and_nodes() {
        let table = DecodeTable::for_type(EntityType::Me);
        let mut src = MemSource::default();
        let me = PttID::random();

        let create = oplog_for(me, Category::Me, MeOp::CreateMe as u32, me, &me_body_for(&me), 0);
        src.apply(&table, None, &create);

        let desktop = NodeID([1u8; 32]);
        let server = NodeID([2u8; 32]);
        for (i, (node, t)) in [(desktop, NodeType::Desktop), (server, NodeType::Server)].iter().enumerate() {
            let data = MyNodeData {
                node_id: *node,
                node_type: *t,
                name: format!("node{}", i),
            };
            let op = oplog_for(me, Category::Me, MeOp::CreateMyNode as u32, my_node_id(&me, node), &data, i as i64 + 1);
            src.apply(&table, None, &op);
        }

        let nodes = my_node_list(&src);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.iter().map(|n| n.weight).sum::<u32>(), 5);
        assert!(nodes.windows(2).all(|w| w[0].raft_id <= w[1].raft_id));

        let obj = my_node_id(&me, &desktop);
        let prev = src.object(&obj);
        let rename = oplog_for(me, Category::Me, MeOp::SetNodeName as u32, obj, &NodeNameData { name: "laptop".into() }, 5);
        src.apply(&table, prev.as_ref(), &rename);
        let renamed = my_node(&src.object(&obj).unwrap()).unwrap();
        assert_eq!(renamed.name, "laptop");
        assert_eq!(renamed.node_type, NodeType::Desktop);
    }

    #[test]
    fn test_my_node_id_checked() {
        let table = DecodeTable::for_type(EntityType::Me);
        let me = PttID::random();
        let data = MyNodeData {
            node_id: NodeID([1u8; 32]),
            node_type: NodeType::Mobile,
            name: String::new(),
        };
        let op = oplog_for(me, Category::Me, MeOp::CreateMyNode as u32, PttID::random(), &data, 0);
        assert!(matches!(table.apply(None, &op), Err(ServiceError::Payload(_))));
    }

    #[test]
    fn test_migrate_me() {
        let table = DecodeTable::for_type(EntityType::Me);
        let mut src = MemSource::default();
        let legacy = PttID::random();
        let new_me = PttID::random();
        src.apply(&table, None, &oplog_for(legacy, Category::Me, MeOp::CreateMe as u32, legacy, &me_body_for(&legacy), 0));

        let prev = src.object(&legacy);
        let migrate = oplog_for(legacy, Category::Me, MeOp::MigrateMe as u32, legacy, &MigrateMeData { new_me_id: new_me }, 1);
        src.apply(&table, prev.as_ref(), &migrate);

        let object = src.object(&legacy).unwrap();
        assert_eq!(object.status, Status::Migrated);
        assert_eq!(me_body(&src, &legacy).unwrap().merged_into, Some(new_me));

        // a migrated Me takes no further updates
        let again = oplog_for(legacy, Category::Me, MeOp::MigrateMe as u32, legacy, &MigrateMeData { new_me_id: new_me }, 2);
        assert!(table.apply(Some(&object), &again).is_err());
    }
}
