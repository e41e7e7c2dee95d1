//! # Durable Store Adapters
//!
//! The relay treats durable storage as a small capability: batch insert,
//! update-by-id, delete-by-id (tombstone), filtered select, plus report
//! bookkeeping. Two adapters provide it: PostgreSQL for real deployments
//! and a JSON file mirroring the original single-file persistence, used
//! when no database URL is configured and by the test suite.

pub mod db_postgres;
pub mod store_file;

use crate::models::message::{Message, MessageFilter, ReportRecord};
use thiserror::Error;

pub use db_postgres::PgStore;
pub use store_file::FileStore;

/// Custom error types for durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to store: {0}")]
    Connection(String),
    #[error("Failed to get connection from pool: {0}")]
    Pool(String),
    #[error("Query execution failed: {0}")]
    Query(String),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(i64),
}

/// One selected durable row together with the provisional token it was
/// first written under, so merged reads can drop cache entries and store
/// rows that are the same message under two identities.
#[derive(Debug, Clone)]
pub struct SelectedMessage {
    pub token: String,
    pub message: Message,
}

/// A configured durable store. Closed set of backends, dispatched by enum
/// rather than a trait object.
pub enum Store {
    Postgres(PgStore),
    File(FileStore),
}

impl Store {
    /// Writes one batch of not-yet-durable messages. Every entry must carry
    /// a provisional identity; the returned pairs map each provisional
    /// token to the durable key the store assigned. The write is an upsert
    /// keyed on the token, so retrying a previously half-landed batch never
    /// duplicates rows.
    pub async fn insert_batch(
        &self,
        batch: &[Message],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        match self {
            Store::Postgres(pg) => pg.insert_batch(batch).await,
            Store::File(file) => file.insert_batch(batch).await,
        }
    }

    /// Overwrites the mutable fields of a durably-identified message
    /// (body, edit/delete markers, reactions, report count).
    pub async fn update(&self, key: i64, msg: &Message) -> Result<(), StoreError> {
        match self {
            Store::Postgres(pg) => pg.update(key, msg).await,
            Store::File(file) => file.update(key, msg).await,
        }
    }

    /// Tombstones a durably-identified message in place.
    pub async fn delete(&self, key: i64) -> Result<(), StoreError> {
        match self {
            Store::Postgres(pg) => pg.delete(key).await,
            Store::File(file) => file.delete(key).await,
        }
    }

    /// Filtered read, newest-first. Rows carry their provisional token.
    pub async fn select(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<SelectedMessage>, StoreError> {
        match self {
            Store::Postgres(pg) => pg.select(filter).await,
            Store::File(file) => file.select(filter).await,
        }
    }

    /// The most recent `limit` messages, oldest-first, for warming the
    /// in-memory cache at startup.
    pub async fn load_recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        match self {
            Store::Postgres(pg) => pg.load_recent(limit).await,
            Store::File(file) => file.load_recent(limit).await,
        }
    }

    /// Retains one report; reporter and reason live only here.
    pub async fn insert_report(&self, record: &ReportRecord) -> Result<(), StoreError> {
        match self {
            Store::Postgres(pg) => pg.insert_report(record).await,
            Store::File(file) => file.insert_report(record).await,
        }
    }

    /// All retained reports, newest-first (privileged surface).
    pub async fn list_reports(&self) -> Result<Vec<ReportRecord>, StoreError> {
        match self {
            Store::Postgres(pg) => pg.list_reports().await,
            Store::File(file) => file.list_reports().await,
        }
    }
}
