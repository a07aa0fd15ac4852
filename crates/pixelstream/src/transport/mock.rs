use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use url::Url;

use super::{StreamTransport, TransportConnector, TransportError, TransportEvent};
use crate::settings::StreamSettings;

/// Connector that fabricates in-memory transports and hands the test a
/// handle for injecting events. Counts how many transports were built so
/// tests can assert connect idempotence.
#[derive(Default)]
pub struct MockConnector {
    connects: AtomicUsize,
    handles: Mutex<Vec<MockHandle>>,
    fail_next: AtomicBool,
}

#[derive(Clone)]
pub struct MockHandle {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub transport: Arc<MockTransport>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next connect attempt fail at handshake time.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn last_handle(&self) -> Option<MockHandle> {
        self.handles.lock().last().cloned()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        _url: &Url,
        _settings: &StreamSettings,
    ) -> Result<
        (
            Arc<dyn StreamTransport>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    > {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Handshake("mock handshake failure".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::default());
        self.handles.lock().push(MockHandle {
            events: event_tx,
            transport: transport.clone(),
        });
        Ok((transport, event_rx))
    }
}

#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.sent
            .lock()
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
