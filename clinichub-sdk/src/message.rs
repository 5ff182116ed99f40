//! Conversation messages and history pages as exchanged with the hub and the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned message id, unique within a conversation.
pub type MessageId = i64;
/// Conversation (room) id.
pub type ConversationId = i64;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// Clinic staff member.
    User,
    Patient,
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
}

/// A single chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_kind: SenderKind,
    pub sender_id: i64,
    /// Server timestamp. Absent on optimistic inserts that have not been confirmed yet.
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Precomputed authorship flag, supplied by some message sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_own: Option<bool>,
}

/// Sort key for conversation order: `(sent_at, id)` ascending.
///
/// Messages without a timestamp sort after every timestamped one, so a
/// just-sent message sits at the tail until its echo confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pending: bool,
    sent_at: Option<DateTime<Utc>>,
    id: MessageId,
}

impl Message {
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            pending: self.sent_at.is_none(),
            sent_at: self.sent_at,
            id: self.id,
        }
    }
}

/// One page of history, ascending by `sent_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

impl MessagePage {
    pub fn new(messages: Vec<Message>, has_more: bool) -> Self {
        Self { messages, has_more }
    }
}
