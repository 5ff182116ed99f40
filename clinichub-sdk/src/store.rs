//! Ordered, de-duplicated message list for one conversation.
//!
//! Messages are kept sorted by `(sent_at, id)` with unique ids. Pages of
//! older history are merged in front, arrivals and own sends are inserted at
//! their sorted position (normally the tail).
//!
//! Echo reconciliation is by id only. A message added through
//! [`MessageStore::append_sent`] is provisional: the first server copy with
//! the same id (push arrival or history page) replaces it, and any later
//! copy is ignored.
//!
//! One store lives for one conversation session. `has_more` starts out true
//! and only ever turns off; switching conversations means a fresh store.

use std::collections::HashSet;

use crate::message::{ConversationId, Message, MessageId, MessagePage};

#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    provisional: HashSet<MessageId>,
    has_more: bool,
    pages_loaded: u32,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            provisional: HashSet::new(),
            has_more: true,
            pages_loaded: 0,
        }
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store bound to `conversation_id`; arrivals for other
    /// conversations are rejected.
    pub fn for_conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    /// Replace all content with the most recent page. Paging restarts from
    /// page 2, but an exhausted history stays exhausted.
    pub fn initialize(&mut self, page: MessagePage) {
        self.messages.clear();
        self.ids.clear();
        self.provisional.clear();
        self.has_more = self.has_more && page.has_more;
        self.pages_loaded = 1;
        for message in page.messages {
            self.merge_confirmed(message);
        }
        tracing::debug!(
            conversation_id = ?self.conversation_id,
            count = self.messages.len(),
            has_more = self.has_more,
            "message store initialized"
        );
    }

    /// Merge an older page in front of the current messages.
    /// Returns how many messages were added.
    pub fn prepend_older(&mut self, page: MessagePage) -> usize {
        let before = self.messages.len();
        for message in page.messages {
            self.merge_confirmed(message);
        }
        self.has_more = self.has_more && page.has_more;
        self.pages_loaded += 1;
        self.messages.len() - before
    }

    /// Insert a message pushed by the hub. Returns whether the visible list changed.
    pub fn append_arrival(&mut self, message: Message) -> bool {
        if !self.accepts(&message) {
            return false;
        }
        self.merge_confirmed(message)
    }

    /// Insert our own message right after the send call returned.
    /// Returns false if the id is already present.
    pub fn append_sent(&mut self, message: Message) -> bool {
        if !self.accepts(&message) || self.ids.contains(&message.id) {
            return false;
        }
        self.provisional.insert(message.id);
        self.insert_sorted(message);
        true
    }

    /// Messages in display order.
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Page number to request for the next older page (1-based).
    pub fn next_page(&self) -> u32 {
        self.pages_loaded + 1
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn accepts(&self, message: &Message) -> bool {
        self.conversation_id
            .is_none_or(|id| id == message.conversation_id)
    }

    // A server copy replaces a provisional entry; otherwise duplicates are dropped.
    fn merge_confirmed(&mut self, message: Message) -> bool {
        if !self.ids.contains(&message.id) {
            self.insert_sorted(message);
            return true;
        }
        if !self.provisional.remove(&message.id) {
            return false;
        }
        self.messages.retain(|m| m.id != message.id);
        self.ids.remove(&message.id);
        self.insert_sorted(message);
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.order_key();
        let at = self.messages.partition_point(|m| m.order_key() <= key);
        self.ids.insert(message.id);
        self.messages.insert(at, message);
    }
}
