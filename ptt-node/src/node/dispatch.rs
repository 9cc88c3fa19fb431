//! Routing of peer events.
//!
//! One task reads every [`PeerEvent`] the peer manager produces and hands it
//! to whoever owns it: link changes go to every entity worker, raft frames to
//! the Me raft driver, join frames to the join flows and everything else to
//! the worker of the frame's entity.
use tokio::sync::mpsc;

use ptt_protocol::{NodeID, PttID};

use super::{join, Node};
use crate::entity::EntityEvent;
use crate::me::raft::RaftMessage;
use crate::peer::{Message, PeerEvent};

pub(super) async fn run(node: Node, mut events: mpsc::Receiver<PeerEvent>) {
    let cancel = node.cancel_token();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        dispatch(&node, event).await;
    }
    log::debug!("dispatch: stopped");
}

async fn dispatch(node: &Node, event: PeerEvent) {
    match event {
        PeerEvent::Up { node_id, link, class } => {
            log::debug!("dispatch: {} up ({})", node_id.short(), class.letter());
            for handle in node.registry().handles() {
                let _ = handle.send(EntityEvent::PeerUp { link: link.clone() }).await;
            }
        }
        PeerEvent::Down { node_id } => {
            for handle in node.registry().handles() {
                let _ = handle.send(EntityEvent::PeerDown { node_id }).await;
            }
        }
        PeerEvent::Message {
            from,
            entity_id,
            message,
        } => on_message(node, from, entity_id, message),
    }
}

fn on_message(node: &Node, from: NodeID, entity_id: PttID, message: Message) {
    match message {
        Message::AddressBook(book) => node.peers().learn(book),
        Message::Hello(_) | Message::HelloAck(_) | Message::HelloDone(_) | Message::Disconnect(_) => {
            log::debug!("dispatch: stray handshake frame from {}", from.short());
        }
        Message::JoinRequest(request) => {
            let node = node.clone();
            tokio::spawn(async move { join::handle_request(node, from, request).await });
        }
        Message::JoinResponse(response) => join::complete(node, from, response),
        Message::Raft(bytes) => {
            if entity_id != node.me_id() {
                log::trace!("dispatch: raft frame for {} is not our group", entity_id.short());
                return;
            }
            match RaftMessage::decode(&bytes) {
                Ok(msg) => node.raft().step(msg),
                Err(e) => log::debug!("dispatch: bad raft frame from {}: {}", from.short(), e),
            }
        }
        message => match node.registry().get(&entity_id) {
            Some(handle) => {
                handle.try_send(EntityEvent::Inbound { from, message });
            }
            None => log::debug!(
                "dispatch: {:?} for unknown entity {} from {}",
                message.msg_type(),
                entity_id.short(),
                from.short()
            ),
        },
    }
}
