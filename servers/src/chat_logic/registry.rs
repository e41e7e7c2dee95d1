//! Connection registry: the live connection count and per-connection
//! typing state with auto-expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Registry {
    active: usize,
    // conn_id -> (display name, deadline after which the entry expires)
    typing: HashMap<u64, (String, Instant)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self) -> usize {
        self.active += 1;
        self.active
    }

    pub fn leave(&mut self, conn_id: u64) -> usize {
        self.active = self.active.saturating_sub(1);
        self.typing.remove(&conn_id);
        self.active
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Sets or clears the typing entry for a connection and returns the
    /// full current list of typing display names.
    pub fn set_typing(
        &mut self,
        conn_id: u64,
        name: String,
        is_typing: bool,
        expiry: Duration,
    ) -> Vec<String> {
        if is_typing {
            self.typing.insert(conn_id, (name, Instant::now() + expiry));
        } else {
            self.typing.remove(&conn_id);
        }
        self.typing_names()
    }

    /// Drops entries whose deadline has passed. Returns the updated name
    /// list only when something actually expired.
    pub fn sweep_expired(&mut self, now: Instant) -> Option<Vec<String>> {
        let before = self.typing.len();
        self.typing.retain(|_, (_, deadline)| *deadline > now);
        if self.typing.len() != before {
            Some(self.typing_names())
        } else {
            None
        }
    }

    pub fn typing_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.typing.values().map(|(name, _)| name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_typing(&self, conn_id: u64) -> bool {
        self.typing.contains_key(&conn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_track_the_count() {
        let mut registry = Registry::new();
        assert_eq!(registry.join(), 1);
        assert_eq!(registry.join(), 2);
        assert_eq!(registry.leave(1), 1);
        // Never goes negative even on unbalanced leaves.
        registry.leave(2);
        assert_eq!(registry.leave(3), 0);
    }

    #[test]
    fn typing_expires_after_the_deadline() {
        let mut registry = Registry::new();
        registry.set_typing(1, "alice".into(), true, Duration::from_secs(3));

        assert!(registry.sweep_expired(Instant::now()).is_none());
        let later = Instant::now() + Duration::from_secs(4);
        let names = registry.sweep_expired(later).unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn leave_clears_the_typing_entry() {
        let mut registry = Registry::new();
        registry.join();
        registry.set_typing(7, "bob".into(), true, Duration::from_secs(3));
        registry.leave(7);
        assert!(registry.typing_names().is_empty());
    }
}
