//! Relay engine: accepts inbound message commands, mutates the shared
//! state, and broadcasts the resulting events to every connection.
//!
//! Rejections are returned to the caller (the originating connection) and
//! never broadcast. Durable-store failures on the synchronous paths are
//! logged and swallowed; durability is best-effort from the client's point
//! of view and the flusher remains the safety net for unflushed content.

use super::state::AppState;
use chrono::{Duration as ChronoDuration, Utc};
use lib_common::utils::provisional_token;
use lib_common::{Message, MessageFilter, MessageId, ReportRecord, StoreError};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

use super::model::ServerEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("Message not found")]
    NotFound,
    #[error("Only the author can modify this message")]
    NotAuthor,
    #[error("The edit window for this message has expired")]
    EditWindowExpired,
    #[error("This message was deleted")]
    AlreadyDeleted,
    #[error("You already reported this message")]
    DuplicateReport,
}

impl AppState {
    /// Accepts an inbound message: validates and normalizes it, assigns the
    /// provisional identity, appends it to the cache, enqueues it for the
    /// next flush and broadcasts it. A client-supplied token is honored as
    /// an idempotency key: if it already names a cached message, that
    /// message is returned and nothing else happens.
    pub async fn accept_message(
        &self,
        token: Option<String>,
        text: Option<String>,
        attachment: Option<Vec<u8>>,
        sender: Option<String>,
    ) -> Result<Message, RelayError> {
        let text = text.unwrap_or_default().trim().to_string();
        if text.is_empty() && attachment.is_none() {
            return Err(RelayError::EmptyMessage);
        }
        // Over-length text is truncated, never rejected.
        let text = if text.chars().count() > self.policy.max_text_len {
            text.chars().take(self.policy.max_text_len).collect()
        } else {
            text
        };
        let sender = sender
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let message = {
            let mut state = self.lock().await;

            if let Some(token) = &token {
                let id = MessageId::Provisional(token.clone());
                if let Some(existing) = state.cache.get(&id) {
                    // Client retry; the original accept already broadcast.
                    return Ok(existing.clone());
                }
            }

            let token = token.unwrap_or_else(provisional_token);
            let created_at = state.next_timestamp();
            let message = Message::new(
                MessageId::Provisional(token.clone()),
                sender,
                text,
                attachment,
                created_at,
            );
            let state = &mut *state;
            state.cache.append(message.clone());
            state.buffer.push(token);
            state.cache.enforce_bound(&state.buffer);
            message
        };

        self.broadcast(ServerEvent::ReceiveMessage {
            message: message.clone(),
        });
        log::debug!("Accepted message {} from {}", message.id, message.sender);
        Ok(message)
    }

    /// Edits a message: author-gated, rejected outside the edit window or
    /// on a tombstone. Once the message is durably identified, the edit is
    /// pushed to the store synchronously; edits are rare and must not sit
    /// in the batch buffer.
    pub async fn edit_message(
        &self,
        id: &MessageId,
        author: &str,
        new_text: &str,
    ) -> Result<Message, RelayError> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let new_text: String = if new_text.chars().count() > self.policy.max_text_len {
            new_text.chars().take(self.policy.max_text_len).collect()
        } else {
            new_text.to_string()
        };
        let edit_window =
            ChronoDuration::from_std(self.policy.edit_window).unwrap_or(ChronoDuration::MAX);

        let (message, durable_key) = {
            let mut state = self.lock().await;
            let msg = state.cache.get_mut(id).ok_or(RelayError::NotFound)?;
            if msg.sender != author {
                return Err(RelayError::NotAuthor);
            }
            if msg.deleted {
                return Err(RelayError::AlreadyDeleted);
            }
            if Utc::now() - msg.created_at > edit_window {
                return Err(RelayError::EditWindowExpired);
            }
            // Mutation timestamps are strictly greater than the accept
            // timestamp so last-write-wins cannot tie with the initial
            // insert.
            let mut at = Utc::now();
            if at <= msg.created_at {
                at = msg.created_at + ChronoDuration::milliseconds(1);
            }
            msg.apply_edit(new_text, at);
            (msg.clone(), msg.id.as_durable())
        };

        self.broadcast(ServerEvent::MessageEdited {
            message: message.clone(),
        });
        if let Some(key) = durable_key {
            if let Err(e) = self.store.update(key, &message).await {
                log::error!("Failed to propagate edit of message #{}: {}", key, e);
            }
        }
        Ok(message)
    }

    /// Tombstones a message in place. The identity and slot are retained;
    /// a flush happening after the delete writes the tombstone state, never
    /// the original body.
    pub async fn delete_message(
        &self,
        id: &MessageId,
        author: &str,
    ) -> Result<MessageId, RelayError> {
        let (resolved, durable_key) = {
            let mut state = self.lock().await;
            let msg = state.cache.get_mut(id).ok_or(RelayError::NotFound)?;
            if msg.sender != author {
                return Err(RelayError::NotAuthor);
            }
            if msg.deleted {
                return Err(RelayError::AlreadyDeleted);
            }
            let mut at = Utc::now();
            if at <= msg.created_at {
                at = msg.created_at + ChronoDuration::milliseconds(1);
            }
            msg.apply_delete(at);
            (msg.id.clone(), msg.id.as_durable())
        };

        self.broadcast(ServerEvent::MessageDeleted {
            id: resolved.clone(),
        });
        if let Some(key) = durable_key {
            if let Err(e) = self.store.delete(key).await {
                log::error!("Failed to propagate delete of message #{}: {}", key, e);
            }
        }
        Ok(resolved)
    }

    /// Toggles a (reactor, symbol) pair and broadcasts the full updated
    /// reaction set for the message.
    pub async fn react(
        &self,
        id: &MessageId,
        reactor: &str,
        symbol: &str,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, RelayError> {
        let (resolved, reactions, current, durable_key) = {
            let mut state = self.lock().await;
            let msg = state.cache.get_mut(id).ok_or(RelayError::NotFound)?;
            msg.toggle_reaction(reactor, symbol);
            (
                msg.id.clone(),
                msg.reactions.clone(),
                msg.clone(),
                msg.id.as_durable(),
            )
        };

        self.broadcast(ServerEvent::MessageReactions {
            id: resolved,
            reactions: reactions.clone(),
        });
        if let Some(key) = durable_key {
            if let Err(e) = self.store.update(key, &current).await {
                log::warn!("Failed to propagate reactions of message #{}: {}", key, e);
            }
        }
        Ok(reactions)
    }

    /// Records a report. Duplicates by the same reporter are rejected. Only
    /// the updated count is broadcast; reporter and reason go to the
    /// durable store and nowhere else.
    pub async fn report(
        &self,
        id: &MessageId,
        reporter: &str,
        reason: &str,
    ) -> Result<u32, RelayError> {
        let (resolved, count, current, record, deferred) = {
            let mut state = self.lock().await;
            let msg = state.cache.get_mut(id).ok_or(RelayError::NotFound)?;
            if !msg.add_report(reporter) {
                return Err(RelayError::DuplicateReport);
            }
            let record = ReportRecord {
                message_id: msg.id.clone(),
                reporter: reporter.to_string(),
                reason: reason.to_string(),
                created_at: Utc::now(),
            };
            let deferred = !msg.id.is_durable();
            let out = (
                msg.id.clone(),
                msg.report_count,
                msg.clone(),
                record.clone(),
                deferred,
            );
            if deferred {
                // No durable key yet; the flusher forwards it after the
                // message lands.
                state.pending_reports.push(record);
            }
            out
        };

        self.broadcast(ServerEvent::MessageReportsCount {
            id: resolved,
            count,
        });
        if !deferred {
            if let Err(e) = self.store.insert_report(&record).await {
                log::error!("Failed to store report: {}", e);
            }
            if let Some(key) = current.id.as_durable() {
                if let Err(e) = self.store.update(key, &current).await {
                    log::warn!("Failed to propagate report count #{}: {}", key, e);
                }
            }
        }
        Ok(count)
    }

    /// Point-in-time historical read: merges the durable store with the
    /// cache entries that have not flushed yet, so a fresh query never has
    /// a gap of invisible recent messages. A store row whose token still
    /// names an unflushed cache entry is the same message caught mid-flush;
    /// the cache copy wins because it may carry newer mutations.
    pub async fn query_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, StoreError> {
        let durable = self.store.select(filter).await?;
        let unflushed: Vec<Message> = {
            let state = self.lock().await;
            state
                .cache
                .unflushed_newest_first()
                .into_iter()
                .filter(|m| filter.matches(m))
                .collect()
        };
        let unflushed_tokens: HashSet<String> = unflushed
            .iter()
            .filter_map(|m| m.id.as_provisional().map(str::to_string))
            .collect();

        // Both inputs are newest-first; a stable sort keeps them that way
        // while interleaving by timestamp.
        let mut merged = unflushed;
        merged.extend(
            durable
                .into_iter()
                .filter(|row| !unflushed_tokens.contains(&row.token))
                .map(|row| row.message),
        );
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// Privileged delete by durable key (admin surface). Tombstones the
    /// cached copy when present and always forwards to the store.
    pub async fn admin_delete(&self, key: i64) -> Result<(), StoreError> {
        let cached = {
            let mut state = self.lock().await;
            match state.cache.get_mut(&MessageId::Durable(key)) {
                Some(msg) if !msg.deleted => {
                    msg.apply_delete(Utc::now());
                    true
                }
                other => other.is_some(),
            }
        };
        if cached {
            self.broadcast(ServerEvent::MessageDeleted {
                id: MessageId::Durable(key),
            });
        }
        self.store.delete(key).await
    }
}
