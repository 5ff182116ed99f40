//! Error type shared by every SDK component.

use crate::channel::ConnectionState;

/// Errors surfaced by the hub client, its subscriptions and the REST collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A remote procedure was invoked while the channel was not `Connected`.
    #[error("hub channel is not connected (state: {state:?})")]
    NotConnected { state: ConnectionState },

    /// A connect attempt was aborted by a local `disconnect()`.
    ///
    /// Never returned from `EventChannel::connect`; it only travels between
    /// the handshake and the reconnect classifier.
    #[error("connection torn down locally")]
    Teardown,

    /// The transport failed mid-session or could not be opened.
    #[error("transport error: {0}")]
    Transport(String),

    /// The hub handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The reconnect ceiling was hit; a new explicit `connect()` is required.
    #[error("gave up reconnecting after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The hub answered an invocation with an error.
    #[error("remote procedure {procedure} failed: {message}")]
    Remote { procedure: String, message: String },

    /// A session operation needs an open conversation.
    #[error("no conversation is open")]
    NoConversation,

    /// The REST API answered with a non-success status.
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HubError>;
