//! # PostgreSQL Message Store
//!
//! Durable store adapter backed by a pooled `tokio-postgres` connection
//! (`deadpool-postgres`, fast recycling). The batch write is an upsert
//! keyed on the provisional token, so a retried flush after a failure or a
//! half-landed batch never duplicates rows, and a row already mutated by a
//! newer edit is not clobbered by an older in-flight insert.

use crate::connections::{SelectedMessage, StoreError};
use crate::models::message::{Message, MessageFilter, MessageId, ReportRecord};
use deadpool_postgres::{
    Config as DeadpoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime,
};
use tokio_postgres::{NoTls, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id           BIGSERIAL PRIMARY KEY,
    token        TEXT NOT NULL UNIQUE,
    sender       TEXT NOT NULL,
    body         TEXT NOT NULL,
    attachment   BYTEA,
    created_at   TIMESTAMPTZ NOT NULL,
    edited_at    TIMESTAMPTZ,
    is_deleted   BOOLEAN NOT NULL DEFAULT FALSE,
    reactions    JSONB NOT NULL DEFAULT '{}'::jsonb,
    report_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS reports (
    message_id   BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    reporter     TEXT NOT NULL,
    reason       TEXT NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    UNIQUE (message_id, reporter)
);
";

const UPSERT: &str = "
INSERT INTO messages
    (token, sender, body, attachment, created_at, edited_at, is_deleted, reactions, report_count)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (token) DO UPDATE SET
    body         = EXCLUDED.body,
    attachment   = EXCLUDED.attachment,
    edited_at    = EXCLUDED.edited_at,
    is_deleted   = messages.is_deleted OR EXCLUDED.is_deleted,
    reactions    = EXCLUDED.reactions,
    report_count = GREATEST(messages.report_count, EXCLUDED.report_count)
WHERE messages.edited_at IS NULL OR EXCLUDED.edited_at IS NULL
   OR messages.edited_at <= EXCLUDED.edited_at
RETURNING id
";

const MESSAGE_COLUMNS: &str =
    "id, sender, body, attachment, created_at, edited_at, is_deleted, reactions, report_count";

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Creates the pool and ensures the schema exists.
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(db_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    pub async fn insert_batch(
        &self,
        batch: &[Message],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let upsert = tx
            .prepare(UPSERT)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut assigned = Vec::with_capacity(batch.len());
        for msg in batch {
            let Some(token) = msg.id.as_provisional() else {
                continue;
            };
            let reactions = serde_json::to_value(&msg.reactions)?;
            let row = tx
                .query_opt(
                    &upsert,
                    &[
                        &token,
                        &msg.sender,
                        &msg.text,
                        &msg.attachment.as_deref(),
                        &msg.created_at,
                        &msg.edited_at,
                        &msg.deleted,
                        &reactions,
                        &(msg.report_count as i32),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let key: i64 = match row {
                Some(row) => row.get(0),
                // Upsert suppressed by the last-write-wins guard; the row
                // exists, look its key up.
                None => tx
                    .query_one("SELECT id FROM messages WHERE token = $1", &[&token])
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?
                    .get(0),
            };
            assigned.push((token.to_string(), key));
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(assigned)
    }

    pub async fn update(&self, key: i64, msg: &Message) -> Result<(), StoreError> {
        let client = self.client().await?;
        let reactions = serde_json::to_value(&msg.reactions)?;
        let updated = client
            .execute(
                "UPDATE messages SET body = $2, attachment = $3, edited_at = $4, \
                 is_deleted = $5, reactions = $6, report_count = $7 WHERE id = $1",
                &[
                    &key,
                    &msg.text,
                    &msg.attachment.as_deref(),
                    &msg.edited_at,
                    &msg.deleted,
                    &reactions,
                    &(msg.report_count as i32),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(key));
        }
        Ok(())
    }

    pub async fn delete(&self, key: i64) -> Result<(), StoreError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE messages SET body = $2, attachment = NULL, is_deleted = TRUE, \
                 edited_at = NOW() WHERE id = $1",
                &[&key, &crate::models::message::TOMBSTONE_TEXT],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::NotFound(key));
        }
        Ok(())
    }

    pub async fn select(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<SelectedMessage>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT token, {MESSAGE_COLUMNS} FROM messages \
             WHERE ($1::TEXT IS NULL OR body ILIKE '%' || $1 || '%') \
               AND ($2::TEXT IS NULL OR sender = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        );
        // The filter is a literal substring match everywhere else, so LIKE
        // metacharacters in the needle must not act as wildcards here.
        let needle = filter.text_contains.as_deref().map(escape_like);
        let limit = filter.limit.map(|n| n as i64);
        let rows = client
            .query(&sql, &[&needle, &filter.sender, &limit])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| SelectedMessage {
                token: row.get("token"),
                message: row_to_message(row),
            })
            .collect())
    }

    pub async fn load_recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created_at DESC, id DESC LIMIT $1"
        );
        let rows = client
            .query(&sql, &[&(limit as i64)])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
        messages.reverse();

        // Rebuild the reporter sets so report dedup survives a restart.
        let reporter_rows = client
            .query("SELECT message_id, reporter FROM reports", &[])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        for row in &reporter_rows {
            let id = MessageId::Durable(row.get(0));
            if let Some(msg) = messages.iter_mut().find(|m| m.id == id) {
                msg.reporters.insert(row.get(1));
            }
        }
        Ok(messages)
    }

    pub async fn insert_report(&self, record: &ReportRecord) -> Result<(), StoreError> {
        let Some(key) = record.message_id.as_durable() else {
            // Reports reference durable rows only; the relay defers until
            // the message has flushed.
            return Ok(());
        };
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO reports (message_id, reporter, reason, created_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (message_id, reporter) DO NOTHING",
                &[&key, &record.reporter, &record.reason, &record.created_at],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn list_reports(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT message_id, reporter, reason, created_at FROM reports \
                 ORDER BY created_at DESC",
                &[],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| ReportRecord {
                message_id: MessageId::Durable(row.get(0)),
                reporter: row.get(1),
                reason: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }
}

/// Escapes `%`, `_` and the backslash escape character itself so a bound
/// LIKE pattern matches the needle literally.
fn escape_like(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_message(row: &Row) -> Message {
    let reactions: serde_json::Value = row.get("reactions");
    let report_count: i32 = row.get("report_count");
    Message {
        id: MessageId::Durable(row.get("id")),
        sender: row.get("sender"),
        text: row.get("body"),
        attachment: row.get::<_, Option<Vec<u8>>>("attachment"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        deleted: row.get("is_deleted"),
        reactions: serde_json::from_value(reactions).unwrap_or_default(),
        report_count: report_count.max(0) as u32,
        reporters: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::escape_like;

    #[test]
    fn like_metacharacters_match_literally() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
