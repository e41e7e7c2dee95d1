//! Message cache: the bounded, time-ordered window of recent messages.
//!
//! The cache is authoritative for recent history; the durable store is
//! authoritative for everything evicted from it. Entries still pending a
//! durable write are never evicted; the size bound is hard only for
//! flushed messages. A provisional→durable alias map keeps references that
//! were handed out before the flush (broadcasts, reactions, reports)
//! resolvable until the entry leaves the cache.

use super::buffer::PendingBuffer;
use lib_common::{Message, MessageId};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct MessageCache {
    bound: usize,
    entries: VecDeque<Message>,
    aliases: HashMap<String, i64>,
}

impl MessageCache {
    pub fn new(bound: usize) -> Self {
        Self {
            bound,
            entries: VecDeque::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, msg: Message) {
        self.entries.push_back(msg);
    }

    /// Resolves an identity, following the provisional→durable alias map.
    fn resolve(&self, id: &MessageId) -> MessageId {
        if let MessageId::Provisional(token) = id {
            if let Some(key) = self.aliases.get(token) {
                return MessageId::Durable(*key);
            }
        }
        id.clone()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        let resolved = self.resolve(id);
        self.entries.iter().find(|m| m.id == resolved)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        let resolved = self.resolve(id);
        self.entries.iter_mut().find(|m| m.id == resolved)
    }

    /// Swaps a provisional identity for the durable key the store assigned,
    /// keeping the old token resolvable through the alias map.
    pub fn assign_durable(&mut self, token: &str, key: i64) {
        let provisional = MessageId::Provisional(token.to_string());
        if let Some(msg) = self.entries.iter_mut().find(|m| m.id == provisional) {
            msg.id = MessageId::Durable(key);
            self.aliases.insert(token.to_string(), key);
        }
    }

    /// Evicts oldest-first until the cache is back under its bound,
    /// skipping any entry whose token is still in the pending buffer.
    /// When only unflushed entries remain over the bound, the cache is
    /// allowed to exceed it.
    pub fn enforce_bound(&mut self, pending: &PendingBuffer) {
        while self.entries.len() > self.bound {
            let victim = self.entries.iter().position(|m| match &m.id {
                MessageId::Durable(_) => true,
                MessageId::Provisional(token) => !pending.contains(token),
            });
            match victim {
                Some(index) => {
                    if let Some(evicted) = self.entries.remove(index) {
                        if let MessageId::Durable(key) = evicted.id {
                            self.aliases.retain(|_, aliased| *aliased != key);
                        }
                    }
                }
                None => break,
            }
        }
    }

    /// Oldest-first clone of the whole window, for history-on-join.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().cloned().collect()
    }

    /// Newest-first clones of the entries not yet durably identified,
    /// for merging into historical queries.
    pub fn unflushed_newest_first(&self) -> Vec<Message> {
        self.entries
            .iter()
            .rev()
            .filter(|m| !m.id.is_durable())
            .cloned()
            .collect()
    }
}
