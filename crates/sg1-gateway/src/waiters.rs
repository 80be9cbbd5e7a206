//! Reply correlation by message type
//!
//! The link has no transaction ids. A query registers a waiter for the reply
//! type it expects and the next frame of that type goes to the oldest live
//! waiter, whichever command actually caused it.

use bytes::Bytes;
use sg1_protocol::MessageType;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;

/// Receives a reply payload, or why the query was never written
pub type ReplySender = oneshot::Sender<Result<Bytes>>;

struct Waiter {
    reply: ReplySender,
    deadline: Instant,
}

/// Pending replies keyed by expected type
#[derive(Default)]
pub struct WaiterTable {
    waiting: HashMap<MessageType, VecDeque<Waiter>>,
}

impl WaiterTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next `expect` frame until `deadline`
    pub fn register(&mut self, expect: MessageType, reply: ReplySender, deadline: Instant) {
        self.waiting
            .entry(expect)
            .or_default()
            .push_back(Waiter { reply, deadline });
    }

    /// Hand a payload to exactly one live waiter. Returns `true` if one took it.
    pub fn deliver(&mut self, frame_type: MessageType, payload: Bytes, now: Instant) -> bool {
        let Some(queue) = self.waiting.get_mut(&frame_type) else {
            return false;
        };
        let mut delivered = false;
        while let Some(waiter) = queue.pop_front() {
            if waiter.deadline < now || waiter.reply.is_closed() {
                continue;
            }
            delivered = waiter.reply.send(Ok(payload.clone())).is_ok();
            if delivered {
                break;
            }
        }
        if queue.is_empty() {
            self.waiting.remove(&frame_type);
        }
        delivered
    }

    /// Drop expired or abandoned waiters. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        self.waiting.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|w| w.deadline >= now && !w.reply.is_closed());
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    /// Release every waiter; their receivers see a closed channel
    pub fn clear(&mut self) {
        self.waiting.clear();
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    /// True when nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
