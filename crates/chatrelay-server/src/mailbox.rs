//! Per-user backlog of envelopes that could not be delivered live.
//!
//! Not synchronised on its own: it lives inside the session registry's
//! critical section so a routing decision and the enqueue it leads to are
//! atomic with respect to a concurrent bind.

use std::collections::{HashMap, VecDeque};

use chatrelay_core::{Envelope, UserId};

#[derive(Debug, Default)]
pub struct OfflineMailbox {
    queues: HashMap<UserId, VecDeque<Envelope>>,
}

impl OfflineMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, user_id: UserId, envelope: Envelope) {
        self.queues.entry(user_id).or_default().push_back(envelope);
    }

    /// Remove and return the whole backlog for `user_id`, oldest first.
    pub fn drain(&mut self, user_id: UserId) -> Vec<Envelope> {
        self.queues
            .remove(&user_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, user_id: UserId) -> usize {
        self.queues.get(&user_id).map_or(0, VecDeque::len)
    }
}
