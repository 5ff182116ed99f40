//! Push events delivered by the hub, and the fixed names of the hub contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, Result};
use crate::message::{ConversationId, Message, SenderKind};

/// Remote procedures the client may invoke.
pub mod procedures {
    pub const JOIN_GROUP: &str = "JoinGroup";
    pub const LEAVE_GROUP: &str = "LeaveGroup";
    pub const SEND_TYPING: &str = "SendTypingIndicator";
}

/// Events the hub pushes to the client.
pub mod events {
    pub const MESSAGE_ARRIVED: &str = "ReceiveMessage";
    pub const MESSAGES_READ: &str = "MessagesRead";
    pub const GROUP_UPDATED: &str = "GroupUpdated";
    pub const TYPING_CHANGED: &str = "TypingChanged";
    pub const PAYMENT_UPDATED: &str = "PaymentUpdated";

    /// Every event a chat session listens for.
    pub const CHAT: [&str; 4] = [MESSAGE_ARRIVED, MESSAGES_READ, GROUP_UPDATED, TYPING_CHANGED];
}

/// Somebody read messages in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub reader_kind: SenderKind,
    pub reader_id: i64,
}

/// A participant started or stopped typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    pub sender_kind: SenderKind,
    pub sender_id: i64,
    pub is_typing: bool,
}

/// Status change of a payment, broadcast to the tenant group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub payment_id: i64,
    pub tenant_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<i64>,
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    MessageArrived(Message),
    MessagesRead(ReadReceipt),
    /// Conversation metadata changed (title, participants).
    GroupUpdated { conversation_id: ConversationId },
    TypingChanged(TypingUpdate),
    PaymentUpdated(PaymentEvent),
}

impl HubEvent {
    /// Decode a named push event. The payload is the first argument.
    pub fn parse(name: &str, args: &[Value]) -> Result<Self> {
        let payload = args.first().cloned().unwrap_or(Value::Null);
        let event = match name {
            events::MESSAGE_ARRIVED => HubEvent::MessageArrived(serde_json::from_value(payload)?),
            events::MESSAGES_READ => HubEvent::MessagesRead(serde_json::from_value(payload)?),
            events::GROUP_UPDATED => HubEvent::GroupUpdated {
                conversation_id: conversation_id_of(&payload)?,
            },
            events::TYPING_CHANGED => HubEvent::TypingChanged(serde_json::from_value(payload)?),
            events::PAYMENT_UPDATED => HubEvent::PaymentUpdated(serde_json::from_value(payload)?),
            other => {
                return Err(HubError::Transport(format!("unknown hub event {other}")));
            }
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::MessageArrived(_) => events::MESSAGE_ARRIVED,
            HubEvent::MessagesRead(_) => events::MESSAGES_READ,
            HubEvent::GroupUpdated { .. } => events::GROUP_UPDATED,
            HubEvent::TypingChanged(_) => events::TYPING_CHANGED,
            HubEvent::PaymentUpdated(_) => events::PAYMENT_UPDATED,
        }
    }
}

// Group updates arrive either as a bare id or as `{ "conversationId": n }`.
fn conversation_id_of(payload: &Value) -> Result<ConversationId> {
    payload
        .as_i64()
        .or_else(|| payload.get("conversationId").and_then(Value::as_i64))
        .ok_or_else(|| HubError::Transport(format!("group update without conversation id: {payload}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_message_arrival() {
        let args = vec![json!({
            "id": 12,
            "conversationId": 4,
            "senderKind": "user",
            "senderId": 2,
            "sentAt": "2024-05-01T10:00:00Z",
            "content": "see you at 3"
        })];
        let HubEvent::MessageArrived(m) = HubEvent::parse(events::MESSAGE_ARRIVED, &args).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(m.id, 12);
        assert_eq!(m.content.as_deref(), Some("see you at 3"));
    }

    #[test]
    fn parses_group_update_in_both_shapes() {
        let bare = HubEvent::parse(events::GROUP_UPDATED, &[json!(8)]).unwrap();
        let object = HubEvent::parse(events::GROUP_UPDATED, &[json!({"conversationId": 8})]).unwrap();
        assert_eq!(bare, object);
        assert_eq!(bare, HubEvent::GroupUpdated { conversation_id: 8 });
    }

    #[test]
    fn parses_typing_and_read() {
        let typing = HubEvent::parse(
            events::TYPING_CHANGED,
            &[json!({"conversationId": 1, "senderKind": "patient", "senderId": 5, "isTyping": true})],
        )
        .unwrap();
        assert_eq!(typing.name(), events::TYPING_CHANGED);

        let read = HubEvent::parse(
            events::MESSAGES_READ,
            &[json!({"conversationId": 1, "readerKind": "user", "readerId": 3})],
        )
        .unwrap();
        assert!(matches!(read, HubEvent::MessagesRead(r) if r.reader_id == 3));
    }

    #[test]
    fn parses_payment_event() {
        let ev = HubEvent::parse(
            events::PAYMENT_UPDATED,
            &[json!({"paymentId": 77, "tenantId": "acme", "status": "paid", "amount": 49.5})],
        )
        .unwrap();
        let HubEvent::PaymentUpdated(p) = ev else { panic!("expected payment") };
        assert_eq!(p.status, "paid");
        assert_eq!(p.amount, Some(49.5));
        assert!(p.appointment_id.is_none());
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(HubEvent::parse("Nope", &[]).is_err());
        assert!(HubEvent::parse(events::MESSAGE_ARRIVED, &[]).is_err());
        assert!(HubEvent::parse(events::GROUP_UPDATED, &[json!("x")]).is_err());
    }
}
