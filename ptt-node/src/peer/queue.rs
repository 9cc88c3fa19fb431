/// Bounded per-peer send queue.
///
/// Entity workers never touch a socket; they push frames here and the link's
/// writer task drains them. When the queue is full the oldest non-oplog
/// frame (merkle, key advert, identify) makes room. Oplog frames are never
/// evicted; once the oplog backlog reaches its threshold a new oplog frame is
/// refused instead and the caller falls back to a merkle sync.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::frame::Frame;
use super::message::MsgType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queued after dropping the oldest non-oplog frame.
    DroppedOldest,
    /// Queue full of oplogs; the new non-oplog frame was dropped.
    DroppedNew,
    /// Oplog backlog over threshold; the oplog frame was refused.
    Backlogged,
    Closed,
}

impl Pushed {
    pub fn is_queued(&self) -> bool {
        matches!(self, Pushed::Queued | Pushed::DroppedOldest)
    }
}

#[derive(Default)]
struct State {
    frames: VecDeque<Frame>,
    oplogs: usize,
}

pub struct SendQueue {
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    oplog_backlog: usize,
}

fn is_oplog(frame: &Frame) -> bool {
    frame.msg_type == MsgType::OplogPush as u8
}

impl SendQueue {
    pub fn new(capacity: usize, oplog_backlog: usize) -> Self {
        let capacity = capacity.max(1);
        SendQueue {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            oplog_backlog: oplog_backlog.clamp(1, capacity),
        }
    }

    pub fn push(&self, frame: Frame) -> Pushed {
        if self.is_closed() {
            return Pushed::Closed;
        }
        let oplog = is_oplog(&frame);
        let result = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if oplog && state.oplogs >= self.oplog_backlog {
                return Pushed::Backlogged;
            }
            let mut result = Pushed::Queued;
            if state.frames.len() >= self.capacity {
                match state.frames.iter().position(|f| !is_oplog(f)) {
                    Some(i) => {
                        state.frames.remove(i);
                        result = Pushed::DroppedOldest;
                    }
                    None if oplog => return Pushed::Backlogged,
                    None => return Pushed::DroppedNew,
                }
            }
            if oplog {
                state.oplogs += 1;
            }
            state.frames.push_back(frame);
            result
        };
        self.notify.notify_one();
        result
    }

    /// Next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = state.frames.pop_front() {
                    if is_oplog(&frame) {
                        state.oplogs -= 1;
                    }
                    return Some(frame);
                }
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
