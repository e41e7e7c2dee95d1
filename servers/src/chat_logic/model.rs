//! Wire events exchanged with connected clients.
//!
//! Both directions use `type`-tagged JSON with camelCase payload fields,
//! matching the event vocabulary of the original socket.io clients.

use lib_common::models::message::attachment_b64;
use lib_common::{Message, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Inbound command from any connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Optional idempotency token; reused verbatim as the provisional
        /// identity so a client retry cannot duplicate the message.
        id: Option<String>,
        text: Option<String>,
        #[serde(default, with = "attachment_b64")]
        attachment: Option<Vec<u8>>,
        sender_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    EditMessage {
        id: MessageId,
        text: String,
        sender_name: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessage { id: MessageId, sender_name: String },
    #[serde(rename_all = "camelCase")]
    Typing {
        is_typing: bool,
        sender_name: String,
    },
    #[serde(rename_all = "camelCase")]
    AddReaction {
        id: MessageId,
        symbol: String,
        sender_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ReportMessage {
        id: MessageId,
        reason: String,
        sender_name: String,
    },
}

/// Outbound notification, broadcast to every connection or targeted at the
/// originating socket (`message_history`, `error`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageHistory { messages: Vec<Message> },
    ReceiveMessage { message: Message },
    MessageEdited { message: Message },
    MessageDeleted { id: MessageId },
    /// The full current reaction set, never a delta, so late joiners stay
    /// consistent.
    MessageReactions {
        id: MessageId,
        reactions: BTreeMap<String, BTreeSet<String>>,
    },
    /// Count only; reporter and reason never leave the durable store.
    MessageReportsCount { id: MessageId, count: u32 },
    ActiveUsers { count: usize },
    /// The full current list of typing display names.
    TypingUsers { users: Vec<String> },
    Error { message: String },
}
