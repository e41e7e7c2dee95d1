//! # File-Backed Message Store
//!
//! Persists the whole message log as one pretty-printed JSON document,
//! rewritten on every batch. This is the zero-dependency deployment mode
//! (no database service required) and the backend the unit tests run
//! against. Durable keys come from a counter persisted inside the document.

use crate::connections::{SelectedMessage, StoreError};
use crate::models::message::{Message, MessageFilter, MessageId, ReportRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileDoc {
    next_id: i64,
    messages: Vec<FileRecord>,
    #[serde(default)]
    reports: Vec<ReportRecord>,
}

/// One stored message plus the provisional token it was first written
/// under. The token stays with the record so a retried batch upserts
/// instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    token: String,
    #[serde(flatten)]
    message: Message,
}

pub struct FileStore {
    path: PathBuf,
    max_messages: usize,
    doc: Mutex<FileDoc>,
}

impl FileStore {
    /// Opens the store, loading the existing document if present. Nothing
    /// is written until the first batch lands.
    pub fn new(path: impl Into<PathBuf>, max_messages: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            FileDoc {
                next_id: 1,
                ..FileDoc::default()
            }
        };
        Ok(Self {
            path,
            max_messages,
            doc: Mutex::new(doc),
        })
    }

    fn persist(&self, doc: &FileDoc) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(doc)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }

    pub async fn insert_batch(
        &self,
        batch: &[Message],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut doc = self.doc.lock().await;
        // Stage on a copy; the live document only advances once the write
        // lands, so a failed batch leaves no phantom durable rows behind
        // for concurrent readers.
        let mut staged = doc.clone();
        let mut assigned = Vec::with_capacity(batch.len());

        for msg in batch {
            let Some(token) = msg.id.as_provisional() else {
                // Already durable, nothing to assign.
                continue;
            };
            match staged.messages.iter().position(|r| r.token == token) {
                Some(pos) => {
                    // Retried batch: keep the key, take the newer content.
                    let existing = &mut staged.messages[pos];
                    let Some(key) = existing.message.id.as_durable() else {
                        continue;
                    };
                    if existing.message.edited_at <= msg.edited_at || msg.deleted {
                        let mut stored = msg.clone();
                        stored.id = MessageId::Durable(key);
                        stored.deleted = stored.deleted || existing.message.deleted;
                        existing.message = stored;
                    }
                    assigned.push((token.to_string(), key));
                }
                None => {
                    let key = staged.next_id;
                    staged.next_id += 1;
                    let mut stored = msg.clone();
                    stored.id = MessageId::Durable(key);
                    staged.messages.push(FileRecord {
                        token: token.to_string(),
                        message: stored,
                    });
                    assigned.push((token.to_string(), key));
                }
            }
        }

        // Keep only the most recent max_messages, as the original file
        // store did.
        let len = staged.messages.len();
        if len > self.max_messages {
            staged.messages.drain(..len - self.max_messages);
        }

        self.persist(&staged)?;
        *doc = staged;
        Ok(assigned)
    }

    pub async fn update(&self, key: i64, msg: &Message) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let record = doc
            .messages
            .iter_mut()
            .find(|r| r.message.id == MessageId::Durable(key))
            .ok_or(StoreError::NotFound(key))?;
        let mut stored = msg.clone();
        stored.id = MessageId::Durable(key);
        record.message = stored;
        self.persist(&doc)
    }

    pub async fn delete(&self, key: i64) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let record = doc
            .messages
            .iter_mut()
            .find(|r| r.message.id == MessageId::Durable(key))
            .ok_or(StoreError::NotFound(key))?;
        record.message.apply_delete(chrono::Utc::now());
        self.persist(&doc)
    }

    pub async fn select(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<SelectedMessage>, StoreError> {
        let doc = self.doc.lock().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(doc
            .messages
            .iter()
            .rev()
            .filter(|r| filter.matches(&r.message))
            .take(limit)
            .map(|r| SelectedMessage {
                token: r.token.clone(),
                message: r.message.clone(),
            })
            .collect())
    }

    pub async fn load_recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let doc = self.doc.lock().await;
        let skip = doc.messages.len().saturating_sub(limit);
        let mut out: Vec<Message> = doc.messages[skip..]
            .iter()
            .map(|r| r.message.clone())
            .collect();
        // Rebuild the reporter sets so dedup survives a restart.
        for report in &doc.reports {
            if let Some(msg) = out.iter_mut().find(|m| m.id == report.message_id) {
                msg.reporters.insert(report.reporter.clone());
            }
        }
        Ok(out)
    }

    pub async fn insert_report(&self, record: &ReportRecord) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        let duplicate = doc
            .reports
            .iter()
            .any(|r| r.message_id == record.message_id && r.reporter == record.reporter);
        if !duplicate {
            doc.reports.push(record.clone());
            self.persist(&doc)?;
        }
        Ok(())
    }

    pub async fn list_reports(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let doc = self.doc.lock().await;
        Ok(doc.reports.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::MessageId;
    use chrono::Utc;

    fn msg(token: &str, sender: &str, text: &str) -> Message {
        Message::new(
            MessageId::Provisional(token.into()),
            sender.into(),
            text.into(),
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn batch_assigns_increasing_keys_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");

        let store = FileStore::new(&path, 100).unwrap();
        let assigned = store
            .insert_batch(&[msg("t1", "alice", "one"), msg("t2", "bob", "two")])
            .await
            .unwrap();
        assert_eq!(assigned, vec![("t1".into(), 1), ("t2".into(), 2)]);

        let reopened = FileStore::new(&path, 100).unwrap();
        let recent = reopened.load_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "one");
        assert_eq!(recent[1].id, MessageId::Durable(2));
    }

    #[tokio::test]
    async fn retried_batch_upserts_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("m.json"), 100).unwrap();

        let first = store.insert_batch(&[msg("tok", "alice", "hi")]).await.unwrap();
        let second = store.insert_batch(&[msg("tok", "alice", "hi")]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_fails_without_parent_dir_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("not-yet-created");
        let store = FileStore::new(nested.join("m.json"), 100).unwrap();

        assert!(store.insert_batch(&[msg("t1", "a", "x")]).await.is_err());
        // The failed batch must not be readable as durable rows.
        assert!(store.select(&MessageFilter::default()).await.unwrap().is_empty());

        std::fs::create_dir(&nested).unwrap();
        let assigned = store.insert_batch(&[msg("t1", "a", "x")]).await.unwrap();
        assert_eq!(assigned, vec![("t1".into(), 1)]);
    }

    #[tokio::test]
    async fn bound_keeps_only_newest_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("m.json"), 2).unwrap();
        store
            .insert_batch(&[
                msg("t1", "a", "one"),
                msg("t2", "a", "two"),
                msg("t3", "a", "three"),
            ])
            .await
            .unwrap();
        let recent = store.load_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "two");
    }

    #[tokio::test]
    async fn report_dedup_by_reporter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("m.json"), 10).unwrap();
        store.insert_batch(&[msg("t1", "a", "one")]).await.unwrap();

        let record = ReportRecord {
            message_id: MessageId::Durable(1),
            reporter: "carol".into(),
            reason: "spam".into(),
            created_at: Utc::now(),
        };
        store.insert_report(&record).await.unwrap();
        store.insert_report(&record).await.unwrap();
        assert_eq!(store.list_reports().await.unwrap().len(), 1);
    }
}
