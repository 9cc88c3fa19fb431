//! Logical key layout.
//!
//! ```text
//! {entityID}/{category}/id/{opID}                  -> oplog
//! {entityID}/{category}/chain/{objID}/{preLogID}/{opID} -> opID
//! {entityID}/{category}/pending/{opID}             -> ()
//! {entityID}/obj/{objID}                           -> object head
//! {entityID}/block/{objID}/{blockID}/{i}           -> bytes
//! {entityID}/merkle/{category}/{level}/{bucketTS}  -> merkle node
//! {entityID}/meta                                  -> entity record
//! me/raft/...                                      -> raft vote, log, applied state, snapshot
//! node/...                                         -> node identity and entity registry
//! ```
//!
//! Ids render as base58, which never contains `/`. Timestamps and indices
//! are fixed-width hex so byte order equals numeric order.

use ptt_protocol::oplog::Category;
use ptt_protocol::PttID;

/// Placeholder for the `preLogID` of a chain root.
const ROOT: &str = "root";

fn sortable_i64(v: i64) -> String {
    format!("{:016x}", (v as u64) ^ (1u64 << 63))
}

pub fn entity_prefix(entity_id: &PttID) -> Vec<u8> {
    format!("{}/", entity_id.to_base58()).into_bytes()
}

pub fn category_prefix(entity_id: &PttID, category: Category) -> Vec<u8> {
    format!("{}/{}/", entity_id.to_base58(), category.as_str()).into_bytes()
}

pub fn oplog_prefix(entity_id: &PttID, category: Category) -> Vec<u8> {
    format!("{}/{}/id/", entity_id.to_base58(), category.as_str()).into_bytes()
}

pub fn oplog(entity_id: &PttID, category: Category, op_id: &PttID) -> Vec<u8> {
    let mut key = oplog_prefix(entity_id, category);
    key.extend_from_slice(op_id.to_base58().as_bytes());
    key
}

pub fn chain_prefix(entity_id: &PttID, category: Category, obj_id: &PttID) -> Vec<u8> {
    format!(
        "{}/{}/chain/{}/",
        entity_id.to_base58(),
        category.as_str(),
        obj_id.to_base58()
    )
    .into_bytes()
}

pub fn chain(
    entity_id: &PttID,
    category: Category,
    obj_id: &PttID,
    pre_log_id: Option<&PttID>,
    op_id: &PttID,
) -> Vec<u8> {
    let pre = pre_log_id.map(|p| p.to_base58()).unwrap_or_else(|| ROOT.to_string());
    let mut key = chain_prefix(entity_id, category, obj_id);
    key.extend_from_slice(format!("{}/{}", pre, op_id.to_base58()).as_bytes());
    key
}

pub fn pending_prefix(entity_id: &PttID, category: Category) -> Vec<u8> {
    format!("{}/{}/pending/", entity_id.to_base58(), category.as_str()).into_bytes()
}

pub fn pending(entity_id: &PttID, category: Category, op_id: &PttID) -> Vec<u8> {
    let mut key = pending_prefix(entity_id, category);
    key.extend_from_slice(op_id.to_base58().as_bytes());
    key
}

pub fn object_prefix(entity_id: &PttID) -> Vec<u8> {
    format!("{}/obj/", entity_id.to_base58()).into_bytes()
}

pub fn object(entity_id: &PttID, obj_id: &PttID) -> Vec<u8> {
    let mut key = object_prefix(entity_id);
    key.extend_from_slice(obj_id.to_base58().as_bytes());
    key
}

pub fn block_prefix(entity_id: &PttID, obj_id: &PttID) -> Vec<u8> {
    format!("{}/block/{}/", entity_id.to_base58(), obj_id.to_base58()).into_bytes()
}

pub fn block(entity_id: &PttID, obj_id: &PttID, block_id: &PttID, index: u32) -> Vec<u8> {
    let mut key = block_prefix(entity_id, obj_id);
    key.extend_from_slice(format!("{}/{:08x}", block_id.to_base58(), index).as_bytes());
    key
}

pub fn merkle_prefix(entity_id: &PttID, category: Category, level: u8) -> Vec<u8> {
    format!(
        "{}/merkle/{}/{}/",
        entity_id.to_base58(),
        category.as_str(),
        level
    )
    .into_bytes()
}

pub fn merkle(entity_id: &PttID, category: Category, level: u8, bucket_ts: i64) -> Vec<u8> {
    let mut key = merkle_prefix(entity_id, category, level);
    key.extend_from_slice(sortable_i64(bucket_ts).as_bytes());
    key
}

pub fn meta(entity_id: &PttID) -> Vec<u8> {
    format!("{}/meta", entity_id.to_base58()).into_bytes()
}

pub const RAFT_PREFIX: &[u8] = b"me/raft/";
pub const RAFT_VOTE: &[u8] = b"me/raft/vote";
pub const RAFT_PURGED: &[u8] = b"me/raft/purged";
pub const RAFT_APPLIED: &[u8] = b"me/raft/applied";
pub const RAFT_SNAPSHOT: &[u8] = b"me/raft/snapshot";
pub const RAFT_LOG_PREFIX: &[u8] = b"me/raft/log/";

pub fn raft_log(index: u64) -> Vec<u8> {
    let mut key = RAFT_LOG_PREFIX.to_vec();
    key.extend_from_slice(format!("{:016x}", index).as_bytes());
    key
}

pub const NODE_KEY: &[u8] = b"node/key";
pub const NODE_MY_KEY: &[u8] = b"node/mykey";
pub const NODE_ME_ID: &[u8] = b"node/me";
pub const NODE_JOIN_KEYS: &[u8] = b"node/joinkeys";
pub const NODE_REGISTRY_PREFIX: &[u8] = b"node/registry/";

pub fn registry(entity_id: &PttID) -> Vec<u8> {
    let mut key = NODE_REGISTRY_PREFIX.to_vec();
    key.extend_from_slice(entity_id.to_base58().as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let e = PttID::from_bytes([1u8; 32]);
        let o = PttID::from_bytes([2u8; 32]);
        let k = String::from_utf8(oplog(&e, Category::Board, &o)).unwrap();
        assert_eq!(k, format!("{}/board/id/{}", e.to_base58(), o.to_base58()));
        let root = String::from_utf8(chain(&e, Category::Board, &o, None, &o)).unwrap();
        assert!(root.contains("/chain/") && root.contains("/root/"));
        assert_eq!(String::from_utf8(meta(&e)).unwrap(), format!("{}/meta", e.to_base58()));
        assert!(oplog(&e, Category::Board, &o).starts_with(&category_prefix(&e, Category::Board)));
    }

    #[test]
    fn test_sortable_keys_follow_numeric_order() {
        let e = PttID::from_bytes([1u8; 32]);
        let a = merkle(&e, Category::User, 0, -60);
        let b = merkle(&e, Category::User, 0, 0);
        let c = merkle(&e, Category::User, 0, 3_600);
        assert!(a < b && b < c);
        assert!(raft_log(9) < raft_log(10));
    }
}
