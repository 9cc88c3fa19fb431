/// Peer manager: accepts and dials links, keeps one link per node.
///
/// Inbound messages of every link are delivered as [`PeerEvent`]s on one
/// channel the node dispatcher consumes. Dial targets are re-dialed with
/// exponential backoff (capped at `max_redial`) whenever their link drops.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ptt_protocol::{NodeID, PttID};

use super::link::{self, Established};
use super::message::{AddressBook, Message, PeerAddr};
use super::queue::{Pushed, SendQueue};
use super::{LinkHandle, PeerClass, PeerCounts, PeerError, PeerInfo, Result};
use crate::config::Config;
use crate::node::identity::UserKey;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PeerSettings {
    pub handshake_timeout: Duration,
    pub send_queue_len: usize,
    pub oplog_backlog: usize,
    pub max_redial: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PeerSettings {
    fn from(config: &Config) -> Self {
        PeerSettings {
            handshake_timeout: config.handshake_timeout,
            send_queue_len: config.send_queue_len,
            oplog_backlog: config.oplog_backlog,
            max_redial: Duration::from_secs(60),
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PeerEvent {
    Up {
        node_id: NodeID,
        link: LinkHandle,
        class: PeerClass,
    },
    Down {
        node_id: NodeID,
    },
    Message {
        from: NodeID,
        entity_id: PttID,
        message: Message,
    },
}

// ─── Manager ─────────────────────────────────────────────────────────────────

struct Entry {
    link: LinkHandle,
    queue: Arc<SendQueue>,
    class: PeerClass,
    listen_addr: Option<String>,
    cancel: CancellationToken,
}

struct Inner {
    key: UserKey,
    settings: PeerSettings,
    listen_port: Mutex<Option<u16>>,
    links: Mutex<HashMap<NodeID, Entry>>,
    book: Mutex<HashMap<NodeID, String>>,
    dial_targets: Mutex<HashSet<String>>,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PeerManager {
    pub fn new(key: UserKey, settings: PeerSettings, events: mpsc::Sender<PeerEvent>) -> Self {
        PeerManager {
            inner: Arc::new(Inner {
                key,
                settings,
                listen_port: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
                book: Mutex::new(HashMap::new()),
                dial_targets: Mutex::new(HashSet::new()),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn node_id(&self) -> NodeID {
        NodeID::from_pubkey(self.inner.key.pubkey)
    }

    /// Bind and start accepting links; returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *lock(&self.inner.listen_port) = Some(local.port());
        log::info!("PeerManager: listening on {}", local);

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    r = listener.accept() => r,
                    _ = this.inner.cancel.cancelled() => break,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            let port = this.listen_port();
                            let timeout = this.inner.settings.handshake_timeout;
                            match link::accept(stream, &this.inner.key, port, timeout).await {
                                Ok(est) => {
                                    this.register(est, PeerClass::Identified).await;
                                }
                                Err(e) => log::debug!("PeerManager: inbound handshake failed: {}", e),
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("PeerManager: accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    fn listen_port(&self) -> Option<u16> {
        *lock(&self.inner.listen_port)
    }

    /// One dial attempt; returns the peer's node id.
    pub async fn connect(&self, addr: &str, class: PeerClass) -> Result<NodeID> {
        let stream = TcpStream::connect(addr).await?;
        let est = link::initiate(
            stream,
            &self.inner.key,
            self.listen_port(),
            self.inner.settings.handshake_timeout,
        )
        .await?;
        Ok(self.register(est, class).await)
    }

    /// Dial `addr` until connected, and again whenever its link drops.
    pub fn dial(&self, addr: String, class: PeerClass) {
        if !lock(&self.inner.dial_targets).insert(addr.clone()) {
            return;
        }
        self.spawn_dial(addr, class);
    }

    fn spawn_dial(&self, addr: String, class: PeerClass) {
        let this = self.clone();
        tokio::spawn(async move {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(500))
                .with_max_delay(this.inner.settings.max_redial)
                .with_max_times(usize::MAX)
                .with_jitter();
            let attempt = || async {
                if this.inner.cancel.is_cancelled() {
                    return Err(PeerError::Closed);
                }
                this.connect(&addr, class).await
            };
            let result = attempt
                .retry(backoff)
                .sleep(tokio::time::sleep)
                .when(|e| !matches!(e, PeerError::SelfConnect | PeerError::Closed))
                .notify(|e, after| log::debug!("PeerManager: dial {} failed ({}), retry in {:?}", addr, e, after))
                .await;
            if let Err(e) = result {
                log::info!("PeerManager: giving up on {}: {}", addr, e);
            }
        });
    }

    async fn register(&self, est: Established, class: PeerClass) -> NodeID {
        let Established {
            node_id,
            addr,
            listen_port,
            framed,
        } = est;
        let listen_addr = listen_port.map(|p| SocketAddr::new(addr.ip(), p).to_string());

        let queue = Arc::new(SendQueue::new(
            self.inner.settings.send_queue_len,
            self.inner.settings.oplog_backlog,
        ));
        let link = LinkHandle::new(node_id, addr, queue.clone());
        let cancel = self.inner.cancel.child_token();
        {
            let mut links = lock(&self.inner.links);
            if let Some(existing) = links.get_mut(&node_id) {
                if !existing.queue.is_closed() {
                    existing.class = existing.class.min(class);
                    log::debug!("PeerManager: already linked to {}", node_id.short());
                    return node_id;
                }
            }
            links.insert(
                node_id,
                Entry {
                    link: link.clone(),
                    queue: queue.clone(),
                    class,
                    listen_addr: listen_addr.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        if let Some(a) = &listen_addr {
            lock(&self.inner.book).insert(node_id, a.clone());
        }
        log::info!("PeerManager: linked to {} at {} ({})", node_id.short(), addr, class.letter());

        link.send(PttID::ZERO, &Message::AddressBook(self.address_book()));
        let _ = self
            .inner
            .events
            .send(PeerEvent::Up {
                node_id,
                link: link.clone(),
                class,
            })
            .await;

        let this = self.clone();
        tokio::spawn(async move {
            let result = link::run(framed, node_id, queue.clone(), this.inner.events.clone(), cancel).await;
            if let Err(e) = result {
                log::debug!("PeerManager: link {} ended: {}", node_id.short(), e);
            }
            let removed = {
                let mut links = lock(&this.inner.links);
                match links.get(&node_id) {
                    Some(entry) if Arc::ptr_eq(&entry.queue, &queue) => links.remove(&node_id),
                    _ => None,
                }
            };
            if removed.is_none() {
                return;
            }
            log::info!("PeerManager: {} disconnected", node_id.short());
            let _ = this.inner.events.send(PeerEvent::Down { node_id }).await;
            if this.inner.cancel.is_cancelled() {
                return;
            }
            let redial = listen_addr.filter(|a| lock(&this.inner.dial_targets).contains(a));
            if let Some(a) = redial {
                this.spawn_dial(a, class);
            }
        });
        node_id
    }

    pub fn link(&self, node_id: &NodeID) -> Option<LinkHandle> {
        lock(&self.inner.links).get(node_id).map(|e| e.link.clone())
    }

    /// Every open link.
    pub fn links(&self) -> Vec<LinkHandle> {
        lock(&self.inner.links).values().map(|e| e.link.clone()).collect()
    }

    pub fn send(&self, node_id: &NodeID, entity_id: PttID, message: &Message) -> Result<Pushed> {
        let link = self
            .link(node_id)
            .ok_or_else(|| PeerError::NotConnected(node_id.short()))?;
        Ok(link.send(entity_id, message))
    }

    pub fn is_connected(&self, node_id: &NodeID) -> bool {
        lock(&self.inner.links).contains_key(node_id)
    }

    /// Promote a peer once it identified on one of our entities.
    pub fn mark_member(&self, node_id: &NodeID) {
        if let Some(entry) = lock(&self.inner.links).get_mut(node_id) {
            entry.class = PeerClass::Member;
        }
    }

    /// Record addresses a peer told us about.
    pub fn learn(&self, book: AddressBook) {
        let me = self.node_id();
        let mut known = lock(&self.inner.book);
        for peer in book.peers.into_iter().filter(|p| p.node_id != me) {
            known.entry(peer.node_id).or_insert(peer.addr);
        }
    }

    pub fn address_book(&self) -> AddressBook {
        AddressBook {
            peers: lock(&self.inner.book)
                .iter()
                .map(|(node_id, addr)| PeerAddr {
                    node_id: *node_id,
                    addr: addr.clone(),
                })
                .collect(),
        }
    }

    /// Connected peers by class plus known but unconnected addresses as `R`.
    pub fn counts(&self) -> PeerCounts {
        let links = lock(&self.inner.links);
        let mut counts = PeerCounts::default();
        for entry in links.values() {
            counts.add(entry.class);
        }
        counts.random += lock(&self.inner.book)
            .keys()
            .filter(|id| !links.contains_key(id))
            .count();
        counts
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let links = lock(&self.inner.links);
        let mut out: Vec<PeerInfo> = links
            .iter()
            .map(|(node_id, e)| PeerInfo {
                node_id: *node_id,
                user_id: None,
                addr: e.listen_addr.clone().or_else(|| Some(e.link.addr.to_string())),
                class: e.class,
                connected: true,
            })
            .collect();
        for (node_id, addr) in lock(&self.inner.book).iter() {
            if !links.contains_key(node_id) {
                out.push(PeerInfo {
                    node_id: *node_id,
                    user_id: None,
                    addr: Some(addr.clone()),
                    class: PeerClass::Random,
                    connected: false,
                });
            }
        }
        out.sort_by(|a, b| (a.class, a.node_id).cmp(&(b.class, b.node_id)));
        out
    }

    /// Close one link.
    pub fn disconnect(&self, node_id: &NodeID) {
        if let Some(entry) = lock(&self.inner.links).get(node_id) {
            entry.cancel.cancel();
            entry.queue.close();
        }
    }

    /// Stop accepting and dialing, and close every link.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        for entry in lock(&self.inner.links).values() {
            entry.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (PeerManager, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (PeerManager::new(UserKey::generate(), PeerSettings::default(), tx), rx)
    }

    async fn next_up(rx: &mut mpsc::Receiver<PeerEvent>) -> (NodeID, LinkHandle) {
        loop {
            match rx.recv().await.unwrap() {
                PeerEvent::Up { node_id, link, .. } => return (node_id, link),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_link_and_exchange() {
        let (a, mut rx_a) = manager();
        let (b, mut rx_b) = manager();
        let addr_b = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let got = a.connect(&addr_b.to_string(), PeerClass::Explicit).await.unwrap();
        assert_eq!(got, b.node_id());
        let (up_a, _) = next_up(&mut rx_a).await;
        let (up_b, _) = next_up(&mut rx_b).await;
        assert_eq!(up_a, b.node_id());
        assert_eq!(up_b, a.node_id());
        assert_eq!(a.counts().explicit, 1);
        assert_eq!(b.counts().identified, 1);

        let entity = PttID::random();
        let msg = Message::KeyAdvert(super::super::message::KeyAdvert { log_ids: vec![PttID::random()] });
        assert!(a.send(&b.node_id(), entity, &msg).unwrap().is_queued());
        loop {
            match rx_b.recv().await.unwrap() {
                PeerEvent::Message { from, entity_id, message } => {
                    if matches!(message, Message::AddressBook(_)) {
                        continue;
                    }
                    assert_eq!(from, a.node_id());
                    assert_eq!(entity_id, entity);
                    assert_eq!(message, msg);
                    break;
                }
                _ => continue,
            }
        }

        // a second connect reuses the link
        a.connect(&addr_b.to_string(), PeerClass::Explicit).await.unwrap();
        assert_eq!(a.peers().iter().filter(|p| p.connected).count(), 1);

        a.disconnect(&b.node_id());
        loop {
            if let PeerEvent::Down { node_id } = rx_b.recv().await.unwrap() {
                assert_eq!(node_id, a.node_id());
                break;
            }
        }
        assert!(!b.is_connected(&a.node_id()));
    }

    #[tokio::test]
    async fn test_learn_skips_self() {
        let (a, _rx) = manager();
        a.learn(AddressBook {
            peers: vec![
                PeerAddr {
                    node_id: a.node_id(),
                    addr: "127.0.0.1:1".into(),
                },
                PeerAddr {
                    node_id: NodeID([7u8; 32]),
                    addr: "127.0.0.1:2".into(),
                },
            ],
        });
        assert_eq!(a.address_book().peers.len(), 1);
        assert_eq!(a.counts().random, 1);
    }
}
