//! Pending write buffer: the FIFO of provisional tokens accepted but not
//! yet durably written. The buffer deliberately holds tokens rather than
//! message copies; the cache entry is the single mutable record, so a flush
//! always writes the state current at flush time (tombstones included).

use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct PendingBuffer {
    queue: VecDeque<String>,
    members: HashSet<String>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: String) {
        if self.members.insert(token.clone()) {
            self.queue.push_back(token);
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.members.contains(token)
    }

    /// Atomic snapshot-and-clear: returns the whole queue in FIFO order and
    /// leaves the buffer empty for messages arriving during the flush.
    pub fn drain_all(&mut self) -> Vec<String> {
        self.members.clear();
        self.queue.drain(..).collect()
    }

    /// Puts a failed batch back at the front, preserving its order relative
    /// to entries enqueued while the write was in flight.
    pub fn requeue_front(&mut self, tokens: Vec<String>) {
        for token in tokens.into_iter().rev() {
            if self.members.insert(token.clone()) {
                self.queue.push_front(token);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_fifo_and_empties_the_buffer() {
        let mut buffer = PendingBuffer::new();
        buffer.push("a".into());
        buffer.push("b".into());
        assert_eq!(buffer.drain_all(), vec!["a".to_string(), "b".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn requeue_front_preserves_order_before_newer_entries() {
        let mut buffer = PendingBuffer::new();
        buffer.push("a".into());
        buffer.push("b".into());
        let snapshot = buffer.drain_all();

        // A message arrives while the failed write is in flight.
        buffer.push("c".into());
        buffer.requeue_front(snapshot);

        assert_eq!(
            buffer.drain_all(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn duplicate_tokens_are_not_enqueued_twice() {
        let mut buffer = PendingBuffer::new();
        buffer.push("a".into());
        buffer.push("a".into());
        assert_eq!(buffer.len(), 1);
    }
}
