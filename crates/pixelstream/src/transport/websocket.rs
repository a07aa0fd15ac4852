use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::{StreamTransport, TransportConnector, TransportError, TransportEvent};
use crate::settings::StreamSettings;

/// WebSocket implementation of the transport seam. The signalling socket
/// doubles as the command/data channel: JSON text frames both ways.
pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &Url,
        _settings: &StreamSettings,
    ) -> Result<
        (
            Arc<dyn StreamTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    > {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        debug!(target = "pixelstream::transport", url = %url, "websocket connected");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));

        // The handshake completing is the wire-level "connected" signal.
        let _ = event_tx.send(TransportEvent::Connected);

        let pump = tokio::spawn(pump_socket(
            ws_stream,
            out_rx,
            event_tx,
            connected.clone(),
        ));

        let transport = Arc::new(WebSocketTransport {
            out: out_tx,
            connected,
            pump: Mutex::new(Some(pump)),
        });

        Ok((transport, event_rx))
    }
}

struct WebSocketTransport {
    out: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.out
            .send(Message::Binary(data.to_vec()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.out
            .send(Message::Text(text.to_string()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Best effort: ask the pump to flush a close frame, then stop it.
        let _ = self.out.send(Message::Close(None));
        tokio::task::yield_now().await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Forward outbound frames and translate inbound socket traffic into
/// transport events until either side goes away.
async fn pump_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if sink.send(message).await.is_err() {
                            warn!(target = "pixelstream::transport", "outbound send failed");
                            let _ = event_tx.send(TransportEvent::Disconnected);
                            break;
                        }
                        if closing {
                            let _ = event_tx.send(TransportEvent::Disconnected);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = event_tx.send(TransportEvent::Disconnected);
                        break;
                    }
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = event_tx.send(TransportEvent::Binary(data));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Text(text));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(TransportEvent::Disconnected);
                        break;
                    }
                    Some(Err(err)) => {
                        let _ = event_tx.send(TransportEvent::Failed(err.to_string()));
                        break;
                    }
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}
