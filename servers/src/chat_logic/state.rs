//! Shared server state: one lock over the cache, pending buffer and
//! registry, plus the broadcast channel every connection fans out from.
//!
//! Every mutation of the in-memory state happens under the single mutex.
//! Store I/O never does: callers snapshot what they need, release the
//! lock, perform the call, and re-acquire to apply the result.

use super::buffer::PendingBuffer;
use super::cache::MessageCache;
use super::model::ServerEvent;
use super::registry::Registry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lib_common::{ReportRecord, Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};

/// Tunables the core consults at runtime, resolved from config once at
/// startup.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_text_len: usize,
    pub cache_bound: usize,
    pub edit_window: Duration,
    pub typing_expiry: Duration,
    pub flush_interval: Duration,
    pub admin_token: Option<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_text_len: lib_common::MAX_TEXT_LEN,
            cache_bound: 10_000,
            edit_window: Duration::from_secs(300),
            typing_expiry: Duration::from_secs(3),
            flush_interval: Duration::from_secs(290),
            admin_token: None,
        }
    }
}

pub struct ChatState {
    pub cache: MessageCache,
    pub buffer: PendingBuffer,
    pub registry: Registry,
    /// Reports against messages that have not flushed yet; the flusher
    /// forwards them once a durable key exists.
    pub pending_reports: Vec<ReportRecord>,
    last_created_at: DateTime<Utc>,
}

impl ChatState {
    fn new(cache_bound: usize) -> Self {
        Self {
            cache: MessageCache::new(cache_bound),
            buffer: PendingBuffer::new(),
            registry: Registry::new(),
            pending_reports: Vec::new(),
            last_created_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Accept-time timestamps are wall-clock but never decrease; ties and
    /// clock steps are resolved by nudging one millisecond past the
    /// previous accept.
    pub fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamped = if now > self.last_created_at {
            now
        } else {
            self.last_created_at + ChronoDuration::milliseconds(1)
        };
        self.last_created_at = stamped;
        stamped
    }

    pub fn observe_timestamp(&mut self, at: DateTime<Utc>) {
        if at > self.last_created_at {
            self.last_created_at = at;
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<ChatState>>,
    pub events_tx: broadcast::Sender<Arc<ServerEvent>>,
    pub store: Arc<Store>,
    pub policy: Arc<Policy>,
}

impl AppState {
    pub fn new(store: Store, policy: Policy) -> Self {
        let (events_tx, _) = broadcast::channel(1000);
        Self {
            inner: Arc::new(Mutex::new(ChatState::new(policy.cache_bound))),
            events_tx,
            store: Arc::new(store),
            policy: Arc::new(policy),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.inner.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerEvent>> {
        self.events_tx.subscribe()
    }

    /// Fan-out to every connection. Send errors just mean nobody is
    /// listening right now.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.events_tx.send(Arc::new(event));
    }

    /// Fills the cache with the most recent durable messages so history is
    /// available immediately after a restart.
    pub async fn warm_up(&self) -> Result<usize, StoreError> {
        let recent = self.store.load_recent(self.policy.cache_bound).await?;
        let count = recent.len();
        let mut state = self.lock().await;
        for msg in recent {
            state.observe_timestamp(msg.created_at);
            state.cache.append(msg);
        }
        Ok(count)
    }

    /// In-memory counters for the health probe.
    pub async fn health_counts(&self) -> (usize, usize, usize) {
        let state = self.lock().await;
        (
            state.cache.len(),
            state.buffer.len(),
            state.registry.active(),
        )
    }
}
