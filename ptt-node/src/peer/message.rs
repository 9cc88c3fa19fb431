/// Peer message bodies and their frame type codes.
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use ptt_protocol::merkle::{LeafWindow, MerkleNode, MerkleQuery};
use ptt_protocol::oplog::{Category, Oplog, SignInfo};
use ptt_protocol::{JoinKind, NodeID, PttID};

use super::frame::Frame;
use super::PeerError;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Hello = 1,
    HelloAck = 2,
    HelloDone = 3,
    Disconnect = 4,
    AddressBook = 5,
    JoinRequest = 6,
    JoinResponse = 7,
    Raft = 8,
    IdentifyRequest = 16,
    IdentifyAck = 17,
    OplogPush = 18,
    OplogPull = 19,
    MerkleRequest = 20,
    MerkleReply = 21,
    KeyAdvert = 22,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MsgType::*;
        [
            Hello, HelloAck, HelloDone, Disconnect, AddressBook, JoinRequest, JoinResponse, Raft,
            IdentifyRequest, IdentifyAck, OplogPush, OplogPull, MerkleRequest, MerkleReply,
            KeyAdvert,
        ]
        .into_iter()
        .find(|t| *t as u8 == v)
    }
}

// ---------------------------------------------------------------------------
// Management channel
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub node_id: NodeID,
    pub nonce: [u8; 32],
    /// Port this node accepts links on, for the address book.
    pub listen_port: Option<u16>,
}

/// Reply to `Hello`: the responder's own hello plus its signature over the
/// initiator's nonce.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub hello: Hello,
    pub sig: Vec<u8>,
}

/// Initiator's signature over the responder's nonce.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HelloDone {
    pub sig: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub node_id: NodeID,
    pub addr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AddressBook {
    pub peers: Vec<PeerAddr>,
}

/// Opening of a join handshake, sealed to the inviter's join key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    pub kind: JoinKind,
    pub entity_id: PttID,
    pub join_key_hash: [u8; 32],
    pub ephemeral_pub: [u8; 32],
    pub sealed: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JoinResponse {
    pub entity_id: PttID,
    /// Sealed response body, or `None` when refused.
    pub sealed: Option<Vec<u8>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Entity channel
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IdentifyRequest {
    pub nonce: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IdentifyAck {
    pub nonce: [u8; 32],
    pub sign: SignInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OplogPush {
    pub oplogs: Vec<Oplog>,
}

/// Ask for accepted oplogs in a leaf window, or by id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OplogPull {
    pub category: Category,
    pub window: Option<LeafWindow>,
    pub ids: Vec<PttID>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MerkleRequest {
    pub query: MerkleQuery,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MerkleReply {
    pub query: MerkleQuery,
    pub nodes: Vec<MerkleNode>,
}

/// Ids of the `CreateOpKey` oplogs behind the sender's alive keys.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyAdvert {
    pub log_ids: Vec<PttID>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    HelloAck(HelloAck),
    HelloDone(HelloDone),
    Disconnect(Disconnect),
    AddressBook(AddressBook),
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    /// Opaque raft message of one Me group.
    Raft(Vec<u8>),
    IdentifyRequest(IdentifyRequest),
    IdentifyAck(IdentifyAck),
    OplogPush(OplogPush),
    OplogPull(OplogPull),
    MerkleRequest(MerkleRequest),
    MerkleReply(MerkleReply),
    KeyAdvert(KeyAdvert),
}

fn encode<T: Serialize>(body: &T) -> Result<Bytes, PeerError> {
    bincode::serialize(body)
        .map(Bytes::from)
        .map_err(|e| PeerError::Malformed(e.to_string()))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PeerError> {
    bincode::deserialize(payload).map_err(|e| PeerError::Malformed(e.to_string()))
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Hello(_) => MsgType::Hello,
            Message::HelloAck(_) => MsgType::HelloAck,
            Message::HelloDone(_) => MsgType::HelloDone,
            Message::Disconnect(_) => MsgType::Disconnect,
            Message::AddressBook(_) => MsgType::AddressBook,
            Message::JoinRequest(_) => MsgType::JoinRequest,
            Message::JoinResponse(_) => MsgType::JoinResponse,
            Message::Raft(_) => MsgType::Raft,
            Message::IdentifyRequest(_) => MsgType::IdentifyRequest,
            Message::IdentifyAck(_) => MsgType::IdentifyAck,
            Message::OplogPush(_) => MsgType::OplogPush,
            Message::OplogPull(_) => MsgType::OplogPull,
            Message::MerkleRequest(_) => MsgType::MerkleRequest,
            Message::MerkleReply(_) => MsgType::MerkleReply,
            Message::KeyAdvert(_) => MsgType::KeyAdvert,
        }
    }

    /// Oplog frames are never dropped to make room in a send queue.
    pub fn is_oplog(&self) -> bool {
        matches!(self, Message::OplogPush(_))
    }

    pub fn to_frame(&self, entity_id: PttID) -> Result<Frame, PeerError> {
        let payload = match self {
            Message::Hello(m) => encode(m)?,
            Message::HelloAck(m) => encode(m)?,
            Message::HelloDone(m) => encode(m)?,
            Message::Disconnect(m) => encode(m)?,
            Message::AddressBook(m) => encode(m)?,
            Message::JoinRequest(m) => encode(m)?,
            Message::JoinResponse(m) => encode(m)?,
            Message::Raft(bytes) => Bytes::from(bytes.clone()),
            Message::IdentifyRequest(m) => encode(m)?,
            Message::IdentifyAck(m) => encode(m)?,
            Message::OplogPush(m) => encode(m)?,
            Message::OplogPull(m) => encode(m)?,
            Message::MerkleRequest(m) => encode(m)?,
            Message::MerkleReply(m) => encode(m)?,
            Message::KeyAdvert(m) => encode(m)?,
        };
        Ok(Frame {
            entity_id,
            msg_type: self.msg_type() as u8,
            payload,
        })
    }

    pub fn from_frame(frame: &Frame) -> Result<Message, PeerError> {
        let t = MsgType::from_u8(frame.msg_type).ok_or(PeerError::UnknownType(frame.msg_type))?;
        let p = &frame.payload[..];
        let message = match t {
            MsgType::Hello => Message::Hello(decode(p)?),
            MsgType::HelloAck => Message::HelloAck(decode(p)?),
            MsgType::HelloDone => Message::HelloDone(decode(p)?),
            MsgType::Disconnect => Message::Disconnect(decode(p)?),
            MsgType::AddressBook => Message::AddressBook(decode(p)?),
            MsgType::JoinRequest => Message::JoinRequest(decode(p)?),
            MsgType::JoinResponse => Message::JoinResponse(decode(p)?),
            MsgType::Raft => Message::Raft(p.to_vec()),
            MsgType::IdentifyRequest => Message::IdentifyRequest(decode(p)?),
            MsgType::IdentifyAck => Message::IdentifyAck(decode(p)?),
            MsgType::OplogPush => Message::OplogPush(decode(p)?),
            MsgType::OplogPull => Message::OplogPull(decode(p)?),
            MsgType::MerkleRequest => Message::MerkleRequest(decode(p)?),
            MsgType::MerkleReply => Message::MerkleReply(decode(p)?),
            MsgType::KeyAdvert => Message::KeyAdvert(decode(p)?),
        };
        let management = matches!(
            t,
            MsgType::Hello | MsgType::HelloAck | MsgType::HelloDone | MsgType::Disconnect | MsgType::AddressBook
        );
        if management != frame.is_management() {
            return Err(PeerError::Malformed(format!("{:?} on the wrong channel", t)));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_code_maps_back() {
        for v in 0u8..=255 {
            if let Some(t) = MsgType::from_u8(v) {
                assert_eq!(t as u8, v);
            }
        }
        assert_eq!(MsgType::from_u8(9), None);
    }

    #[test]
    fn test_channel_checked() {
        let msg = Message::Disconnect(Disconnect { reason: "bye".into() });
        let frame = msg.to_frame(PttID::ZERO).unwrap();
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);

        let misrouted = msg.to_frame(PttID::random()).unwrap();
        assert!(Message::from_frame(&misrouted).is_err());

        let pull = Message::OplogPull(OplogPull {
            category: Category::Board,
            window: None,
            ids: vec![PttID::random()],
        });
        let entity = PttID::random();
        let frame = pull.to_frame(entity).unwrap();
        assert_eq!(frame.entity_id, entity);
        assert_eq!(Message::from_frame(&frame).unwrap(), pull);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let frame = Frame {
            entity_id: PttID::random(),
            msg_type: MsgType::MerkleRequest as u8,
            payload: Bytes::from_static(&[1, 2]),
        };
        assert!(matches!(Message::from_frame(&frame), Err(PeerError::Malformed(_))));
    }
}
