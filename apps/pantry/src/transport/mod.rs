use pantry_protocol::{ClientEvent, ProtocolError, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::Credential;

pub mod backoff;
pub mod mock;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use mock::MockTransport;
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("no credential available")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("channel closed")]
    ChannelClosed,
}

/// Connection lifecycle and inbound traffic, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Received(ServerEvent),
    /// Closed by a local `disconnect()`.
    Closed,
    /// Closed unexpectedly. `reconnecting` is set while the retry budget
    /// lasts.
    Disconnected { reason: String, reconnecting: bool },
    /// `fatal` errors end the connection attempt for good.
    Error { message: String, fatal: bool },
}

/// One persistent, message-framed connection to a single endpoint.
///
/// Methods never block; results surface as [`TransportEvent`]s on the stream
/// handed out once by `take_events`.
pub trait Transport: Send + Sync {
    /// Opens the connection. No-op when already connected or connecting.
    fn connect(&self, credential: Option<Credential>);

    /// Fire-and-forget emission. Callers check `is_connected` first.
    fn send(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
