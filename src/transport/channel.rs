use crate::config::ReconnectPolicy;
use crate::error::{SyncError, SyncResult};
use crate::transport::backoff::Backoff;
use crate::transport::protocol::{
    Envelope, OutboundMessage, CONNECTION_ESTABLISHED, CONNECTION_LOST, RECONNECTING,
};
use crate::transport::Transport;
use crate::utils::journal::{Direction, JournalHandle};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Display identity presented to the server. Not an authentication token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Closed,
    Shutdown,
}

struct Inner {
    server_url: String,
    policy: ReconnectPolicy,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    journal: Option<JournalHandle>,
}

/// Real-time duplex connection to the collaboration server with automatic
/// reconnect. Outbound sends are fire-and-forget: while disconnected they are
/// dropped, and frames still queued for a connection that dies are discarded
/// with it rather than replayed on the next one.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("server_url", &self.inner.server_url)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl TransportChannel {
    pub fn new(server_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::build(server_url.into(), policy, None)
    }

    pub fn with_journal(server_url: impl Into<String>, policy: ReconnectPolicy, journal: JournalHandle) -> Self {
        Self::build(server_url.into(), policy, Some(journal))
    }

    fn build(server_url: String, policy: ReconnectPolicy, journal: Option<JournalHandle>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                server_url,
                policy,
                handlers: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                state,
                shutdown,
                driver: Mutex::new(None),
                journal,
            }),
        }
    }

    /// Registers a handler for a named inbound event. Handlers for the same
    /// name run in registration order.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Starts the connection driver. Calling this while a driver is already
    /// running is a no-op.
    #[instrument(skip(self, identity), fields(username = %identity.username))]
    pub fn connect(&self, identity: &Identity) -> SyncResult<()> {
        let mut driver = self.inner.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Transport already connected or connecting");
            return Ok(());
        }

        let mut url = Url::parse(&self.inner.server_url)?;
        url.query_pairs_mut().append_pair("username", &identity.username);

        self.inner.shutdown.send_replace(false);
        let inner = self.inner.clone();
        *driver = Some(tokio::spawn(drive(inner, url)));
        info!(server = %self.inner.server_url, "Transport driver started");
        Ok(())
    }

    /// Closes the connection and stops reconnecting.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Transport driver ended abnormally");
            }
        }
    }

    /// Like [`Transport::send`], but reports why a frame was not queued.
    pub fn try_send(&self, message: &OutboundMessage) -> SyncResult<()> {
        let text = message.encode()?;
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(SyncError::NotConnected)?;
        tx.send(text).map_err(|_| SyncError::NotConnected)?;
        drop(outbound);
        if let Some(journal) = &self.inner.journal {
            if let Ok(Value::Object(frame)) = serde_json::to_value(message) {
                let data = frame.get("data").cloned().unwrap_or(Value::Null);
                journal.record(Direction::Outbound, message.event_name(), &data);
            }
        }
        Ok(())
    }
}

impl Transport for TransportChannel {
    fn send(&self, message: &OutboundMessage) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(SyncError::NotConnected) => {
                debug!(event = message.event_name(), "Dropping outbound message while disconnected");
                false
            }
            Err(e) => {
                error!(event = message.event_name(), error = %e, "Failed to send outbound message");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn dispatch(&self, event: &str, data: &Value) {
        // Clone the list so handlers may register further handlers.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(event)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = %event, "No handlers registered for inbound event");
        }
        for handler in handlers {
            handler(data);
        }
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable frame from server");
                return;
            }
        };
        if matches!(
            envelope.event.as_str(),
            CONNECTION_ESTABLISHED | CONNECTION_LOST | RECONNECTING
        ) {
            // Lifecycle events are raised by the channel itself.
            debug!(event = %envelope.event, payload = %envelope.data, "Ignoring server-sent lifecycle frame");
            return;
        }
        if let Some(journal) = &self.journal {
            journal.record(Direction::Inbound, &envelope.event, &envelope.data);
        }
        self.dispatch(&envelope.event, &envelope.data);
    }
}

async fn drive(inner: Arc<Inner>, url: Url) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::new(inner.policy);
    let mut ever_connected = false;
    let mut retrying = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if retrying {
            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempt(), "Giving up reconnecting to collaboration server");
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            let attempt = backoff.attempt();
            inner.set_state(ConnectionState::Reconnecting { attempt });
            inner.dispatch(RECONNECTING, &json!({ "attempt": attempt }));
        } else {
            inner.set_state(ConnectionState::Connecting);
        }

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };
        let ws = match connected {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(error = %e, attempt = backoff.attempt(), "Connection attempt failed");
                retrying = true;
                continue;
            }
        };

        let reconnected = ever_connected;
        ever_connected = true;
        backoff.reset();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        *inner.outbound.lock() = Some(tx);
        inner.set_state(ConnectionState::Connected);
        info!(url = %inner.server_url, reconnected, "Connected to collaboration server");
        inner.dispatch(
            CONNECTION_ESTABLISHED,
            &json!({ "server": inner.server_url, "reconnected": reconnected }),
        );

        let end = pump(&inner, ws, rx, &mut shutdown).await;

        // Frames still queued for this connection are dropped with it.
        *inner.outbound.lock() = None;
        inner.set_state(ConnectionState::Disconnected);
        warn!(url = %inner.server_url, "Lost connection to collaboration server");
        inner.dispatch(CONNECTION_LOST, &json!({ "server": inner.server_url }));

        if end == PumpEnd::Shutdown {
            break;
        }
        retrying = true;
    }

    *inner.outbound.lock() = None;
    inner.set_state(ConnectionState::Disconnected);
    debug!("Transport driver stopped");
}

async fn pump(
    inner: &Inner,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpEnd {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => return PumpEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    return PumpEnd::Closed;
                }
            },
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "WebSocket write failed");
                        return PumpEnd::Closed;
                    }
                }
                None => return PumpEnd::Closed,
            },
            _ = shutdown.changed() => {
                // Frames queued before shutdown (e.g. flushed edits) still go out.
                while let Ok(text) = rx.try_recv() {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return PumpEnd::Shutdown;
            }
        }
    }
}
