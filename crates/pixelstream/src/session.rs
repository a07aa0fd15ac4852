use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::settings::{SettingsHandle, is_loopback_url};
use crate::transport::{StreamTransport, TransportConnector, TransportError, TransportEvent};
use crate::viewport::enforce_viewport_match;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of the single streaming connection. Only the session manager
/// transitions this; consumers observe through [`StreamingSession::watch_state`]
/// and request transitions via connect/disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid signalling url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Owns exactly one logical connection to the remote rendering engine.
pub struct StreamingSession {
    connector: Arc<dyn TransportConnector>,
    shared: Arc<SessionShared>,
    tasks: Mutex<SessionTasks>,
    connect_in_flight: AtomicBool,
    next_handler: AtomicU64,
    connect_timeout: Duration,
    reconcile_interval: Duration,
}

struct SessionShared {
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<BTreeMap<u64, MessageHandler>>,
    last_error: Mutex<Option<String>>,
    settings: SettingsHandle,
}

#[derive(Default)]
struct SessionTasks {
    transport: Option<Arc<dyn StreamTransport>>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl StreamingSession {
    pub fn new(connector: Arc<dyn TransportConnector>, settings: SettingsHandle) -> Self {
        Self::with_timing(connector, settings, CONNECT_TIMEOUT, RECONCILE_INTERVAL)
    }

    pub fn with_timing(
        connector: Arc<dyn TransportConnector>,
        settings: SettingsHandle,
        connect_timeout: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            shared: Arc::new(SessionShared {
                state,
                handlers: Mutex::new(BTreeMap::new()),
                last_error: Mutex::new(None),
                settings,
            }),
            tasks: Mutex::new(SessionTasks::default()),
            connect_in_flight: AtomicBool::new(false),
            next_handler: AtomicU64::new(0),
            connect_timeout,
            reconcile_interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.shared.settings
    }

    /// Establish the streaming connection. Calls made while a connect is in
    /// flight, or while already connected, are no-ops: at most one transport
    /// is ever constructed per logical attempt.
    ///
    /// Refuses (quietly, staying Disconnected) when the resolved signalling
    /// URL is empty, or when it is a loopback address and the debug override
    /// layer is not active.
    pub async fn connect(&self, override_url: Option<&str>) -> Result<(), SessionError> {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(target = "pixelstream::session", "connect ignored; already active");
            return Ok(());
        }
        if self
            .connect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target = "pixelstream::session", "connect ignored; attempt in flight");
            return Ok(());
        }
        let result = self.connect_inner(override_url).await;
        self.connect_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn connect_inner(&self, override_url: Option<&str>) -> Result<(), SessionError> {
        let effective = self.shared.settings.effective();
        let target = override_url
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| effective.signalling_url.trim().to_string());

        if target.is_empty() {
            warn!(
                target = "pixelstream::session",
                "no signalling url resolved; staying disconnected"
            );
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(err) => {
                let reason = err.to_string();
                self.shared.record_error(format!("invalid signalling url: {reason}"));
                self.shared.set_state(ConnectionState::Error);
                return Err(SessionError::InvalidUrl {
                    url: target,
                    reason,
                });
            }
        };

        if is_loopback_url(&url) && !self.shared.settings.debug_active() {
            warn!(
                target = "pixelstream::session",
                url = %url,
                "refusing loopback signalling url without debug overrides"
            );
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        // Clear out any half-open remains of a previous attempt first.
        self.teardown_tasks().await;
        self.shared.clear_error();
        self.shared.set_state(ConnectionState::Connecting);

        match self.connector.connect(&url, &effective).await {
            Ok((transport, events)) => {
                let supervisor = tokio::spawn(supervise(
                    transport.clone(),
                    events,
                    self.shared.clone(),
                    self.connect_timeout,
                    self.reconcile_interval,
                ));
                let mut tasks = self.tasks.lock();
                tasks.transport = Some(transport);
                tasks.supervisor = Some(supervisor);
                Ok(())
            }
            Err(err) => {
                self.shared.record_error(err.to_string());
                self.shared.set_state(ConnectionState::Error);
                Err(SessionError::Transport(err))
            }
        }
    }

    /// Tear down the connection and return to Disconnected, clearing any
    /// recorded error.
    pub async fn disconnect(&self) {
        self.teardown_tasks().await;
        self.shared.clear_error();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect then connect. Not atomic against concurrent external
    /// connect() calls; callers serialize.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.disconnect().await;
        self.connect(None).await
    }

    /// Emit an engine command frame: `{"command": name, "data": ...}`.
    /// Fire-and-forget: while not connected this logs and returns Ok.
    pub async fn send_command(
        &self,
        name: &str,
        payload: Option<Value>,
    ) -> Result<(), SessionError> {
        let mut frame = json!({ "command": name });
        if let Some(payload) = payload {
            frame["data"] = payload;
        }
        self.emit(frame).await
    }

    /// Emit a fitting-room event frame: `{"type": kind, "data": ...}`.
    pub async fn send_fitting_room_command(
        &self,
        kind: &str,
        payload: Option<Value>,
    ) -> Result<(), SessionError> {
        let mut frame = json!({ "type": kind });
        if let Some(payload) = payload {
            frame["data"] = payload;
        }
        self.emit(frame).await
    }

    async fn emit(&self, frame: Value) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            debug!(
                target = "pixelstream::session",
                %frame,
                "dropping command while not connected"
            );
            return Ok(());
        }
        let transport = self.tasks.lock().transport.clone();
        let Some(transport) = transport else {
            debug!(target = "pixelstream::session", "no transport; command dropped");
            return Ok(());
        };
        transport
            .send_text(&frame.to_string())
            .await
            .map_err(SessionError::Transport)
    }

    /// Register a handler for inbound data-channel messages. Returns an id
    /// for [`StreamingSession::unsubscribe`].
    pub fn subscribe<F>(&self, handler: F) -> u64
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.handlers.lock().insert(id, Arc::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.handlers.lock().remove(&id).is_some()
    }

    async fn teardown_tasks(&self) {
        let (transport, supervisor) = {
            let mut tasks = self.tasks.lock();
            (tasks.transport.take(), tasks.supervisor.take())
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        if let Some(supervisor) = tasks.supervisor.take() {
            supervisor.abort();
        }
    }
}

impl SessionShared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn record_error(&self, message: String) {
        warn!(target = "pixelstream::session", error = %message, "session error");
        *self.last_error.lock() = Some(message);
    }

    fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Decode one inbound frame and fan it out. JSON parse failure delivers
    /// the raw text under a wrapper key instead of dropping the frame. A
    /// panicking handler is caught and logged; the rest still run.
    ///
    /// The handler map is snapshotted before invocation so a handler may
    /// subscribe or unsubscribe (itself included) without deadlocking the
    /// supervisor.
    fn dispatch(&self, text: &str) {
        let value =
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| json!({ "raw": text }));
        let handlers: Vec<(u64, MessageHandler)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, handler)| (*id, handler.clone()))
            .collect();
        for (id, handler) in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&value))).is_err() {
                warn!(
                    target = "pixelstream::session",
                    handler = id,
                    "message handler panicked; continuing fan-out"
                );
            }
        }
    }
}

/// Supervise one transport: map its events onto connection states, enforce
/// the connect timeout, and keep the viewport-matching flag pinned while
/// the session exists.
async fn supervise(
    transport: Arc<dyn StreamTransport>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<SessionShared>,
    connect_timeout: Duration,
    reconcile_interval: Duration,
) {
    let timeout = tokio::time::sleep(connect_timeout);
    tokio::pin!(timeout);
    let mut reconcile = tokio::time::interval(reconcile_interval);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut connected = false;

    loop {
        tokio::select! {
            _ = &mut timeout, if !connected => {
                shared.record_error(format!(
                    "no connected event within {}s; abandoning attempt",
                    connect_timeout.as_secs()
                ));
                transport.close().await;
                shared.set_state(ConnectionState::Error);
                return;
            }
            _ = reconcile.tick() => {
                if enforce_viewport_match(&shared.settings) {
                    debug!(
                        target = "pixelstream::session",
                        "viewport matching drifted; re-pinned"
                    );
                }
            }
            event = events.recv() => {
                match event {
                    Some(TransportEvent::Connected) => {
                        connected = true;
                        info!(target = "pixelstream::session", "stream connected");
                        shared.set_state(ConnectionState::Connected);
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!(target = "pixelstream::session", "stream disconnected by remote");
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    Some(TransportEvent::Failed(reason)) => {
                        shared.record_error(reason);
                        transport.close().await;
                        shared.set_state(ConnectionState::Error);
                        return;
                    }
                    Some(TransportEvent::Binary(data)) => {
                        shared.dispatch(&String::from_utf8_lossy(&data));
                    }
                    Some(TransportEvent::Text(text)) => {
                        shared.dispatch(&text);
                    }
                }
            }
        }
    }
}
