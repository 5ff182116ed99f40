//! The opaque bidirectional channel to a hub endpoint.
//!
//! A [`HubConnector`] performs the handshake and hands back a [`HubLink`]:
//! an invoker for remote procedures plus a receiver of inbound frames.
//! The link is dead once the receiver yields [`Inbound::Closed`] or `None`.

pub mod framed;
pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// A frame pushed by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A named server-pushed event.
    Event { name: String, args: Vec<Value> },
    /// The hub or the network closed the link.
    Closed { reason: String },
}

/// Opens links to one hub endpoint.
pub trait HubConnector: Send + Sync + 'static {
    /// Connect and complete the hub handshake using `credential`.
    fn open(&self, credential: String) -> BoxFuture<'static, Result<HubLink>>;
}

/// Outbound half of an open link.
pub trait HubInvoker: Send + Sync + 'static {
    /// Call a remote procedure and wait for its completion.
    fn invoke(&self, procedure: String, args: Vec<Value>) -> BoxFuture<'static, Result<Value>>;

    /// Close the link. Safe to call more than once.
    fn close(&self) -> BoxFuture<'static, ()>;
}

/// An open, handshaken connection.
pub struct HubLink {
    pub invoker: Arc<dyn HubInvoker>,
    pub inbound: mpsc::Receiver<Inbound>,
}

impl std::fmt::Debug for HubLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubLink").finish_non_exhaustive()
    }
}
