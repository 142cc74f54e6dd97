//! Duplicate suppression for inbound signaling.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use super::messages::MessageId;
use crate::session::SessionId;

const MESSAGE_WINDOW: usize = 512;
const CLOSED_SESSION_WINDOW: usize = 32;

/// Bounded FIFO set; the oldest key is forgotten first.
#[derive(Debug)]
struct Window<K> {
    order: VecDeque<K>,
    keys: HashSet<K>,
    capacity: usize,
}

impl<K: Copy + Eq + Hash> Window<K> {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if the key was already present.
    fn insert(&mut self, key: K) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        true
    }

    fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }
}

/// Remembers recently seen message ids and recently closed sessions.
#[derive(Debug)]
pub struct SeenMessages {
    messages: Window<MessageId>,
    closed: Window<SessionId>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self {
            messages: Window::new(MESSAGE_WINDOW),
            closed: Window::new(CLOSED_SESSION_WINDOW),
        }
    }

    /// Records `id`; `false` means it was delivered before.
    pub fn first_sighting(&mut self, id: MessageId) -> bool {
        self.messages.insert(id)
    }

    pub fn mark_closed(&mut self, session: SessionId) {
        self.closed.insert(session);
    }

    pub fn is_closed(&self, session: &SessionId) -> bool {
        self.closed.contains(session)
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new()
    }
}
