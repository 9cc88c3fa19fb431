/// One authenticated peer link.
///
/// Handshake (management channel, under a deadline):
///
/// ```text
/// initiator                         responder
///   Hello{node_a, nonce_a}   ──▶
///                            ◀──   HelloAck{Hello{node_b, nonce_b}, sig_b(nonce_a)}
///   HelloDone{sig_a(nonce_b)} ──▶
/// ```
///
/// A node id is the node's Ed25519 public key, so each side checks the other
/// signed the nonce it just generated.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use ptt_protocol::crypto::{sign_data, verify_signature};
use ptt_protocol::{NodeID, PttID};

use super::frame::FrameCodec;
use super::manager::PeerEvent;
use super::message::{Disconnect, Hello, HelloAck, HelloDone, Message, PROTOCOL_VERSION};
use super::queue::SendQueue;
use super::{PeerError, Result};
use crate::node::identity::UserKey;

const HELLO_TAG: &[u8] = b"ptt-hello-v1";

pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// A link whose handshake completed.
pub struct Established {
    pub node_id: NodeID,
    pub addr: SocketAddr,
    pub listen_port: Option<u16>,
    pub framed: FramedStream,
}

fn hello_payload(signer: &NodeID, peer_nonce: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HELLO_TAG.len() + 64);
    payload.extend_from_slice(HELLO_TAG);
    payload.extend_from_slice(signer.as_bytes());
    payload.extend_from_slice(peer_nonce);
    payload
}

fn sign_nonce(key: &UserKey, peer_nonce: &[u8; 32]) -> Result<Vec<u8>> {
    let signer = NodeID::from_pubkey(key.pubkey);
    sign_data(&hello_payload(&signer, peer_nonce), key.private())
        .map(|s| s.to_vec())
        .map_err(|e| PeerError::Handshake(e.to_string()))
}

fn check_sig(peer: &NodeID, my_nonce: &[u8; 32], sig: &[u8]) -> Result<()> {
    match verify_signature(&hello_payload(peer, my_nonce), sig, peer.as_bytes()) {
        Ok(true) => Ok(()),
        Ok(false) => Err(PeerError::Handshake(format!("bad hello signature from {}", peer.short()))),
        Err(e) => Err(PeerError::Handshake(e.to_string())),
    }
}

fn new_hello(key: &UserKey, listen_port: Option<u16>) -> Hello {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    Hello {
        version: PROTOCOL_VERSION,
        node_id: NodeID::from_pubkey(key.pubkey),
        nonce,
        listen_port,
    }
}

async fn recv(framed: &mut FramedStream) -> Result<Message> {
    match framed.next().await {
        Some(Ok(frame)) => Message::from_frame(&frame),
        Some(Err(e)) => Err(e),
        None => Err(PeerError::Closed),
    }
}

async fn send(framed: &mut FramedStream, message: &Message) -> Result<()> {
    framed.send(message.to_frame(PttID::ZERO)?).await
}

fn check_peer(me: &UserKey, hello: &Hello) -> Result<()> {
    if hello.version != PROTOCOL_VERSION {
        return Err(PeerError::Handshake(format!("protocol version {}", hello.version)));
    }
    if hello.node_id == NodeID::from_pubkey(me.pubkey) {
        return Err(PeerError::SelfConnect);
    }
    Ok(())
}

/// Dialing side of the handshake.
pub async fn initiate(
    stream: TcpStream,
    key: &UserKey,
    listen_port: Option<u16>,
    timeout: Duration,
) -> Result<Established> {
    let addr = stream.peer_addr()?;
    let mut framed = Framed::new(stream, FrameCodec::new());
    let run = async {
        let hello = new_hello(key, listen_port);
        send(&mut framed, &Message::Hello(hello.clone())).await?;
        let ack = match recv(&mut framed).await? {
            Message::HelloAck(ack) => ack,
            Message::Disconnect(d) => return Err(PeerError::Handshake(d.reason)),
            other => return Err(PeerError::Handshake(format!("expected HelloAck, got {:?}", other.msg_type()))),
        };
        check_peer(key, &ack.hello)?;
        check_sig(&ack.hello.node_id, &hello.nonce, &ack.sig)?;
        let sig = sign_nonce(key, &ack.hello.nonce)?;
        send(&mut framed, &Message::HelloDone(HelloDone { sig })).await?;
        Ok(ack.hello)
    };
    let peer = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;
    Ok(Established {
        node_id: peer.node_id,
        addr,
        listen_port: peer.listen_port,
        framed,
    })
}

/// Listening side of the handshake.
pub async fn accept(
    stream: TcpStream,
    key: &UserKey,
    listen_port: Option<u16>,
    timeout: Duration,
) -> Result<Established> {
    let addr = stream.peer_addr()?;
    let mut framed = Framed::new(stream, FrameCodec::new());
    let run = async {
        let theirs = match recv(&mut framed).await? {
            Message::Hello(hello) => hello,
            other => return Err(PeerError::Handshake(format!("expected Hello, got {:?}", other.msg_type()))),
        };
        if let Err(e) = check_peer(key, &theirs) {
            let _ = send(&mut framed, &Message::Disconnect(Disconnect { reason: e.to_string() })).await;
            return Err(e);
        }
        let hello = new_hello(key, listen_port);
        let sig = sign_nonce(key, &theirs.nonce)?;
        send(
            &mut framed,
            &Message::HelloAck(HelloAck {
                hello: hello.clone(),
                sig,
            }),
        )
        .await?;
        match recv(&mut framed).await? {
            Message::HelloDone(done) => check_sig(&theirs.node_id, &hello.nonce, &done.sig)?,
            other => return Err(PeerError::Handshake(format!("expected HelloDone, got {:?}", other.msg_type()))),
        }
        Ok(theirs)
    };
    let peer = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;
    Ok(Established {
        node_id: peer.node_id,
        addr,
        listen_port: peer.listen_port,
        framed,
    })
}

/// Pump frames until either direction ends or `cancel` fires.
///
/// Inbound messages go to `events`; outbound frames come from `queue`.
pub async fn run(
    framed: FramedStream,
    node_id: NodeID,
    queue: Arc<SendQueue>,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut sink, mut stream) = framed.split();

    let writer = {
        let queue = queue.clone();
        async move {
            while let Some(frame) = queue.pop().await {
                sink.send(frame).await?;
            }
            let bye = Message::Disconnect(Disconnect { reason: "closing".into() });
            let _ = sink.send(bye.to_frame(PttID::ZERO)?).await;
            Ok::<(), PeerError>(())
        }
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            let message = match Message::from_frame(&frame) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("link {}: dropping frame: {}", node_id.short(), e);
                    continue;
                }
            };
            if let Message::Disconnect(d) = &message {
                log::debug!("link {}: peer disconnected: {}", node_id.short(), d.reason);
                return Ok(());
            }
            let event = PeerEvent::Message {
                from: node_id,
                entity_id: frame.entity_id,
                message,
            };
            if events.send(event).await.is_err() {
                return Err(PeerError::Closed);
            }
        }
        Ok::<(), PeerError>(())
    };

    let result = tokio::select! {
        r = writer => r,
        r = reader => r,
        _ = cancel.cancelled() => Ok(()),
    };
    queue.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (a, b) = pair().await;
        let ka = UserKey::generate();
        let kb = UserKey::generate();
        let timeout = Duration::from_secs(5);
        let (ra, rb) = tokio::join!(initiate(a, &ka, Some(1000), timeout), accept(b, &kb, Some(2000), timeout));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.node_id, NodeID::from_pubkey(kb.pubkey));
        assert_eq!(rb.node_id, NodeID::from_pubkey(ka.pubkey));
        assert_eq!(ra.listen_port, Some(2000));
        assert_eq!(rb.listen_port, Some(1000));
    }

    #[tokio::test]
    async fn test_self_connect_refused() {
        let (a, b) = pair().await;
        let k = UserKey::generate();
        let timeout = Duration::from_secs(5);
        let (ra, rb) = tokio::join!(initiate(a, &k, None, timeout), accept(b, &k, None, timeout));
        assert!(ra.is_err());
        assert!(matches!(rb, Err(PeerError::SelfConnect)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (a, _b) = pair().await;
        let k = UserKey::generate();
        let r = initiate(a, &k, None, Duration::from_millis(50)).await;
        assert!(matches!(r, Err(PeerError::HandshakeTimeout)));
    }
}
