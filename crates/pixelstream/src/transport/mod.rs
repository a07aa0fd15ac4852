use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::settings::StreamSettings;

pub mod mock;
pub mod websocket;

/// Lifecycle and data events surfaced by a transport to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Failed(String),
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport handshake failed: {0}")]
    Handshake(String),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// A live connection to the remote rendering engine's data channel.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Tear down the underlying connection. Idempotent.
    async fn close(&self);
}

/// Factory seam between the session manager and the wire. Tests substitute
/// a mock connector; production uses the WebSocket implementation.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        settings: &StreamSettings,
    ) -> Result<
        (
            Arc<dyn StreamTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    >;
}
