//! Raft RPCs over the peer links.
//!
//! openraft wants a request/response client per target; the peer links only
//! carry one-way frames. Each outbound RPC gets a call id and a pending
//! oneshot, travels as a [`RaftMessage::Call`] and is completed when the
//! matching reply frame comes back through [`Calls::complete`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError as ConsensusError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{DeviceNode, MeTypeConfig, RaftError, RaftId, Result};

// ----------------------------------------------------------------------------
// Wire
// ----------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub enum RaftRpc {
    AppendEntries(AppendEntriesRequest<MeTypeConfig>),
    Vote(VoteRequest<RaftId>),
    InstallSnapshot(InstallSnapshotRequest<MeTypeConfig>),
    /// Sender asks the leader to hand it the lead.
    RequestLead,
    /// Leader tells the chosen successor to campaign now.
    TimeoutNow,
}

#[derive(Serialize, Deserialize)]
pub enum RaftReply {
    AppendEntries(std::result::Result<AppendEntriesResponse<RaftId>, ConsensusError<RaftId>>),
    Vote(std::result::Result<VoteResponse<RaftId>, ConsensusError<RaftId>>),
    InstallSnapshot(
        std::result::Result<InstallSnapshotResponse<RaftId>, ConsensusError<RaftId, InstallSnapshotError>>,
    ),
    Lead(LeadAnswer),
    Ack,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum LeadAnswer {
    Granted,
    Refused(String),
    NotLeader(Option<RaftId>),
    NotMember,
}

impl LeadAnswer {
    pub fn into_result(self, asker: RaftId) -> Result<()> {
        match self {
            LeadAnswer::Granted => Ok(()),
            LeadAnswer::Refused(reason) => Err(RaftError::Refused(reason)),
            LeadAnswer::NotLeader(lead) => Err(RaftError::NotLeader(lead)),
            LeadAnswer::NotMember => Err(RaftError::NotMember(asker)),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub enum MessageBody {
    Call { call: u64, rpc: RaftRpc },
    Reply { call: u64, reply: RaftReply },
}

/// One frame of raft traffic between two devices of the same Me.
#[derive(Serialize, Deserialize)]
pub struct RaftMessage {
    pub from: RaftId,
    pub to: RaftId,
    pub body: MessageBody,
}

impl RaftMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::Encoding(e.to_string()))
    }
}

/// Outbound path to the other devices of the group.
pub trait RaftTransport: Send + Sync + 'static {
    /// Hand `msg` to the link of `msg.to`; `Unreachable` when there is none.
    fn send(&self, msg: RaftMessage) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Pending calls
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct Calls {
    next: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RaftReply>>>,
}

impl Calls {
    fn register(&self) -> (u64, oneshot::Receiver<RaftReply>) {
        // 0 is left for calls nobody waits on
        let call = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(call, tx);
        (call, rx)
    }

    fn forget(&self, call: u64) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&call);
    }

    pub fn complete(&self, call: u64, reply: RaftReply) {
        let waiter = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&call);
        if let Some(tx) = waiter {
            let _ = tx.send(reply);
        }
    }

    /// Send `rpc` to `to` and wait up to `ttl` for the reply.
    pub async fn call(
        &self,
        transport: &dyn RaftTransport,
        from: RaftId,
        to: RaftId,
        rpc: RaftRpc,
        ttl: Duration,
    ) -> Result<RaftReply> {
        let (call, rx) = self.register();
        let msg = RaftMessage {
            from,
            to,
            body: MessageBody::Call { call, rpc },
        };
        if let Err(e) = transport.send(msg) {
            self.forget(call);
            return Err(e);
        }
        match tokio::time::timeout(ttl, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RaftError::Stopped),
            Err(_) => {
                self.forget(call);
                Err(RaftError::DeadlineExceeded)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// openraft network
// ----------------------------------------------------------------------------

pub struct MeNetwork {
    id: RaftId,
    transport: Arc<dyn RaftTransport>,
    calls: Arc<Calls>,
}

impl MeNetwork {
    pub fn new(id: RaftId, transport: Arc<dyn RaftTransport>, calls: Arc<Calls>) -> Self {
        MeNetwork { id, transport, calls }
    }
}

impl RaftNetworkFactory<MeTypeConfig> for MeNetwork {
    type Network = PeerClient;

    async fn new_client(&mut self, target: RaftId, _node: &DeviceNode) -> Self::Network {
        PeerClient {
            id: self.id,
            target,
            transport: self.transport.clone(),
            calls: self.calls.clone(),
        }
    }
}

pub struct PeerClient {
    id: RaftId,
    target: RaftId,
    transport: Arc<dyn RaftTransport>,
    calls: Arc<Calls>,
}

type RpcResult<T, E> = std::result::Result<T, RPCError<RaftId, DeviceNode, E>>;

impl PeerClient {
    async fn call<E: std::error::Error>(&self, rpc: RaftRpc, option: &RPCOption) -> RpcResult<RaftReply, E> {
        self.calls
            .call(self.transport.as_ref(), self.id, self.target, rpc, option.hard_ttl())
            .await
            .map_err(|e| match e {
                RaftError::Unreachable(_) => RPCError::Unreachable(Unreachable::new(&e)),
                _ => RPCError::Network(NetworkError::new(&e)),
            })
    }

    fn remote<E: std::error::Error>(&self, e: E) -> RPCError<RaftId, DeviceNode, E> {
        RPCError::RemoteError(RemoteError::new(self.target, e))
    }
}

fn mismatched<E: std::error::Error>() -> RPCError<RaftId, DeviceNode, E> {
    RPCError::Network(NetworkError::new(&RaftError::Encoding("reply does not match the call".into())))
}

impl RaftNetwork<MeTypeConfig> for PeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<MeTypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<RaftId>, ConsensusError<RaftId>> {
        match self.call(RaftRpc::AppendEntries(rpc), &option).await? {
            RaftReply::AppendEntries(reply) => reply.map_err(|e| self.remote(e)),
            _ => Err(mismatched()),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<MeTypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<RaftId>, ConsensusError<RaftId, InstallSnapshotError>> {
        match self.call(RaftRpc::InstallSnapshot(rpc), &option).await? {
            RaftReply::InstallSnapshot(reply) => reply.map_err(|e| self.remote(e)),
            _ => Err(mismatched()),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftId>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<RaftId>, ConsensusError<RaftId>> {
        match self.call(RaftRpc::Vote(rpc), &option).await? {
            RaftReply::Vote(reply) => reply.map_err(|e| self.remote(e)),
            _ => Err(mismatched()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nowhere;

    impl RaftTransport for Nowhere {
        fn send(&self, msg: RaftMessage) -> Result<()> {
            Err(RaftError::Unreachable(msg.to))
        }
    }

    struct Void;

    impl RaftTransport for Void {
        fn send(&self, _msg: RaftMessage) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_call_without_link_fails_fast() {
        let calls = Calls::default();
        let err = calls
            .call(&Nowhere, 1, 2, RaftRpc::RequestLead, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RaftError::Unreachable(2)));
        assert!(calls.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let calls = Calls::default();
        let err = calls
            .call(&Void, 1, 2, RaftRpc::RequestLead, Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RaftError::DeadlineExceeded));
        assert!(calls.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_completes_call() {
        let calls = Arc::new(Calls::default());
        let answering = calls.clone();
        let pending = tokio::spawn(async move {
            calls
                .call(&Void, 1, 2, RaftRpc::RequestLead, Duration::from_secs(5))
                .await
        });
        // the first call registered gets id 1
        while answering.pending.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        answering.complete(1, RaftReply::Lead(LeadAnswer::Granted));
        match pending.await.unwrap().unwrap() {
            RaftReply::Lead(answer) => assert_eq!(answer, LeadAnswer::Granted),
            _ => panic!("unexpected reply"),
        }
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = RaftMessage {
            from: 1,
            to: 2,
            body: MessageBody::Reply {
                call: 7,
                reply: RaftReply::Lead(LeadAnswer::Refused("heavier".into())),
            },
        };
        let back = RaftMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!((back.from, back.to), (1, 2));
        match back.body {
            MessageBody::Reply { call, reply: RaftReply::Lead(answer) } => {
                assert_eq!(call, 7);
                assert_eq!(answer, LeadAnswer::Refused("heavier".into()));
            }
            _ => panic!("unexpected body"),
        }
        assert!(RaftMessage::decode(b"not raft").is_err());
    }
}
