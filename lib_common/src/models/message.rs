//! # Message Model
//!
//! The central chat entity shared by the relay server and the storage
//! adapters, together with its identity type and query filter.
//!
//! A message carries exactly one identity at a time: a *provisional* token
//! assigned when the relay accepts it, replaced by the *durable* key the
//! store hands back once the batched write lands. The two are kept as an
//! explicit tagged enum so no code ever has to guess from the string shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Maximum accepted text length; longer bodies are truncated, not rejected.
pub const MAX_TEXT_LEN: usize = 2000;

/// Replacement body for tombstoned messages.
pub const TOMBSTONE_TEXT: &str = "[message deleted]";

/// Identity of a message.
///
/// On the wire this is untagged: a JSON integer is a durable key, a JSON
/// string is a provisional token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Key assigned by the durable store on successful write.
    Durable(i64),
    /// Token assigned at accept time (client-supplied or relay-generated).
    Provisional(String),
}

impl MessageId {
    pub fn is_durable(&self) -> bool {
        matches!(self, MessageId::Durable(_))
    }

    pub fn as_durable(&self) -> Option<i64> {
        match self {
            MessageId::Durable(key) => Some(*key),
            MessageId::Provisional(_) => None,
        }
    }

    pub fn as_provisional(&self) -> Option<&str> {
        match self {
            MessageId::Durable(_) => None,
            MessageId::Provisional(token) => Some(token),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Durable(key) => write!(f, "#{}", key),
            MessageId::Provisional(token) => write!(f, "~{}", token),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Display name, free-form; not an authenticated identity.
    pub sender: String,
    pub text: String,
    /// Opaque binary payload, base64 on the wire; never parsed.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "attachment_b64")]
    pub attachment: Option<Vec<u8>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    /// symbol -> set of reactor display names. A reactor holds at most one
    /// reaction per symbol; re-adding removes it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub report_count: u32,
    /// Reporter names, for dedup only. Durable-store concern; never sent
    /// to clients.
    #[serde(skip)]
    pub reporters: HashSet<String>,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender: String,
        text: String,
        attachment: Option<Vec<u8>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender,
            text,
            attachment,
            created_at,
            edited_at: None,
            deleted: false,
            reactions: BTreeMap::new(),
            report_count: 0,
            reporters: HashSet::new(),
        }
    }

    /// Replaces the body and stamps `edited_at`. The caller is responsible
    /// for the author and edit-window checks.
    pub fn apply_edit(&mut self, new_text: String, at: DateTime<Utc>) {
        self.text = new_text;
        self.edited_at = Some(at);
    }

    /// Tombstones the message in place: the slot and identity are retained,
    /// the visible content is not.
    pub fn apply_delete(&mut self, at: DateTime<Utc>) {
        self.text = TOMBSTONE_TEXT.to_string();
        self.attachment = None;
        self.deleted = true;
        self.edited_at = Some(at);
    }

    /// Toggle semantics: adds the (reactor, symbol) pair, or removes it if
    /// already present. Empty symbol buckets are dropped.
    pub fn toggle_reaction(&mut self, reactor: &str, symbol: &str) {
        let bucket = self.reactions.entry(symbol.to_string()).or_default();
        if !bucket.remove(reactor) {
            bucket.insert(reactor.to_string());
        }
        if self.reactions.get(symbol).is_some_and(|b| b.is_empty()) {
            self.reactions.remove(symbol);
        }
    }

    /// Records a report by `reporter`. Returns `false` when this reporter
    /// already reported the message (the duplicate is rejected, not merged).
    pub fn add_report(&mut self, reporter: &str) -> bool {
        if self.reporters.insert(reporter.to_string()) {
            self.report_count += 1;
            true
        } else {
            false
        }
    }
}

/// One retained report, durable-store-only data (reporter and reason are
/// never broadcast).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub message_id: MessageId,
    pub reporter: String,
    pub reason: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Filter for historical message queries.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Case-insensitive substring match on the body.
    pub text_contains: Option<String>,
    /// Exact sender match.
    pub sender: Option<String>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(needle) = &self.text_contains {
            if !msg.text.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &msg.sender != sender {
                return false;
            }
        }
        true
    }
}

/// Serde helper: optional binary payload as a base64 string.
pub mod attachment_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_str(&STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(de)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            MessageId::Provisional("1700000000000-deadbeef".into()),
            "alice".into(),
            "hello".into(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn id_wire_format_is_untagged() {
        let provisional: MessageId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(provisional, MessageId::Provisional("abc-123".into()));

        let durable: MessageId = serde_json::from_str("42").unwrap();
        assert_eq!(durable, MessageId::Durable(42));

        assert_eq!(serde_json::to_string(&durable).unwrap(), "42");
    }

    #[test]
    fn reaction_double_toggle_restores_original_state() {
        let mut msg = sample();
        msg.toggle_reaction("bob", "👍");
        assert_eq!(msg.reactions["👍"].len(), 1);
        msg.toggle_reaction("bob", "👍");
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn duplicate_report_is_rejected() {
        let mut msg = sample();
        assert!(msg.add_report("carol"));
        assert!(!msg.add_report("carol"));
        assert_eq!(msg.report_count, 1);
    }

    #[test]
    fn tombstone_replaces_body_and_attachment() {
        let mut msg = sample();
        msg.attachment = Some(vec![1, 2, 3]);
        msg.apply_delete(Utc::now());
        assert!(msg.deleted);
        assert_eq!(msg.text, TOMBSTONE_TEXT);
        assert!(msg.attachment.is_none());
    }

    #[test]
    fn attachment_round_trips_as_base64() {
        let mut msg = sample();
        msg.attachment = Some(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["attachment"], "3q2+7w==");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.attachment, msg.attachment);
    }
}
