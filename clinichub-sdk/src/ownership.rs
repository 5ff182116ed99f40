//! Decides whether a message was authored by the viewer.

use crate::message::{Message, SenderKind};

/// Identity of the person looking at a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipResolver {
    viewer_kind: SenderKind,
    viewer_id: Option<i64>,
}

impl OwnershipResolver {
    pub fn new(viewer_kind: SenderKind, viewer_id: Option<i64>) -> Self {
        Self {
            viewer_kind,
            viewer_id,
        }
    }

    pub fn is_own(&self, message: &Message) -> bool {
        is_own(message, self.viewer_kind, self.viewer_id)
    }
}

/// An explicit `is_own` flag on the message wins; otherwise the sender fields
/// are compared with the viewer. An unknown viewer owns nothing.
pub fn is_own(message: &Message, viewer_kind: SenderKind, viewer_id: Option<i64>) -> bool {
    if let Some(flag) = message.is_own {
        return flag;
    }
    match viewer_id {
        Some(id) => message.sender_kind == viewer_kind && message.sender_id == id,
        None => false,
    }
}
