//! clinichub-sdk: resilient real-time client for the clinic messaging hubs.
//!
//! - [`channel::EventChannel`]: one connection per hub, idempotent connect,
//!   automatic reconnect with backoff
//! - [`subscription::SubscriptionManager`]: group membership replayed after every reconnect
//! - [`store::MessageStore`]: ordered, de-duplicated conversation history
//! - [`session::ChatSession`] and [`notifications::PaymentNotifications`]:
//!   the two feature controllers built on top

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod notifications;
pub mod ownership;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod subscription;
pub mod transport;

pub use channel::{ChannelOptions, ConnectionState, EventChannel};
pub use config::HubConfig;
pub use error::{HubError, Result};
pub use message::{Attachment, ConversationId, Message, MessageId, MessagePage, SenderKind};
pub use session::ChatSession;
