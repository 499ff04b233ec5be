//! Streaming feed connection
//!
//! Maintains one push subscription for the configured stream:
//!
//! ```text
//!   Disconnected ──connect──► Connecting ──open──► Connected
//!        ▲                        │                    │
//!        └──── reconnect delay ◄──┴── error/close ◄────┤
//!                                                      │
//!        Connecting ◄──────────── rotation timer ◄─────┘
//! ```
//!
//! Reconnects use a constant delay. A healthy connection is closed and
//! reopened on the rotation timer, ahead of the exchange's 24h cut-off.
//! Decoded updates and connectivity changes are sent to the engine over an
//! unbounded channel, in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kline_types::candle::Candle;
use kline_types::errors::{FeedError, TransportError};
use kline_types::ids::SessionId;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::{FeedConfig, StreamKind};
use crate::events::{parse_stream_message, FeedEvent, StreamMessage, TradeAccumulator};
use crate::metrics::EngineMetrics;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Opens streaming sessions.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, TransportError>;
}

/// One open streaming session.
#[async_trait]
pub trait StreamSession: Send {
    /// Next text frame. `None` once the peer has closed the session.
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the session; errors are ignored.
    async fn close(&mut self);
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(WsSession { ws }))
    }
}

struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.ws.send(Message::Pong(payload)).await {
                        return Some(Err(TransportError::Send(e.to_string())));
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server closed stream");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            trace!(error = %e, "Close handshake failed");
        }
    }
}

/// Resolves once `true` is signalled or the sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionExit {
    Shutdown,
    Rotated,
    Failed(TransportError),
    ReceiverGone,
}

/// Feed connection task. Built with [`FeedConnection::new`] and started
/// with [`FeedConnection::spawn`].
pub struct FeedConnection {
    url: String,
    stream_name: String,
    kind: StreamKind,
    reconnect_delay: Duration,
    rotation_interval: Duration,
    connector: Arc<dyn StreamConnector>,
    events: mpsc::UnboundedSender<FeedEvent>,
    state: watch::Sender<ConnectionState>,
    metrics: Arc<EngineMetrics>,
    /// Newest closed bucket seen; survives reconnects.
    last_closed_bucket: Option<i64>,
    trades: TradeAccumulator,
}

impl FeedConnection {
    pub fn new(
        config: &FeedConfig,
        connector: Arc<dyn StreamConnector>,
        events: mpsc::UnboundedSender<FeedEvent>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: config.stream_url(),
            stream_name: config.stream_name(),
            kind: config.stream_kind,
            reconnect_delay: config.reconnect_delay,
            rotation_interval: config.rotation_interval,
            connector,
            events,
            state,
            metrics,
            last_closed_bucket: None,
            trades: TradeAccumulator::new(),
        }
    }

    /// Start the connection task.
    pub fn spawn(self) -> ConnectionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        ConnectionHandle {
            shutdown: shutdown_tx,
            state,
            task: Some(task),
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, stream = %self.stream_name, "Feed connection started");

        loop {
            self.set_state(ConnectionState::Connecting);
            let session_id = SessionId::new();
            debug!(%session_id, url = %self.url, "Connecting");

            let connected = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                result = self.connector.connect(&self.url) => result,
            };

            let mut session = match connected {
                Ok(session) => session,
                Err(err) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        %session_id,
                        error = %FeedError::from(err),
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Connect failed, retrying"
                    );
                    if self.wait_reconnect_delay(&mut shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            self.set_state(ConnectionState::Connected);
            self.metrics.record_connect();
            info!(%session_id, "Stream connected");
            if !self.emit(FeedEvent::Connectivity(true)) {
                session.close().await;
                break;
            }

            let exit = self.pump(session.as_mut(), &mut shutdown).await;
            session.close().await;
            self.set_state(ConnectionState::Disconnected);

            match exit {
                SessionExit::Shutdown | SessionExit::ReceiverGone => break,
                SessionExit::Rotated => {
                    self.metrics.record_disconnect(true);
                    info!(%session_id, "Connection rotated");
                    if !self.emit(FeedEvent::Connectivity(false)) {
                        break;
                    }
                }
                SessionExit::Failed(err) => {
                    self.metrics.record_disconnect(false);
                    warn!(%session_id, error = %FeedError::from(err), "Stream ended");
                    if !self.emit(FeedEvent::Connectivity(false)) {
                        break;
                    }
                    if !self.wait_reconnect_delay(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(url = %self.url, "Feed connection stopped");
    }

    /// Read frames until the session ends, rotates or shutdown is signalled.
    async fn pump(&mut self, session: &mut dyn StreamSession, shutdown: &mut watch::Receiver<bool>) -> SessionExit {
        let rotation = tokio::time::sleep(self.rotation_interval);
        tokio::pin!(rotation);

        loop {
            tokio::select! {
                _ = shutdown_signalled(shutdown) => return SessionExit::Shutdown,
                _ = &mut rotation => return SessionExit::Rotated,
                frame = session.next_text() => match frame {
                    None => return SessionExit::Failed(TransportError::Closed),
                    Some(Err(err)) => return SessionExit::Failed(err),
                    Some(Ok(text)) => {
                        if !self.handle_text(&text) {
                            return SessionExit::ReceiverGone;
                        }
                    }
                },
            }
        }
    }

    /// Decode and forward one frame. Returns `false` once the engine side
    /// of the channel is gone.
    fn handle_text(&mut self, text: &str) -> bool {
        self.metrics.record_message();

        let message = match parse_stream_message(text, &self.stream_name, self.kind) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.record_malformed();
                warn!(error = %FeedError::from(err), "Dropping malformed message");
                return true;
            }
        };

        match message {
            StreamMessage::Kline(candle) => match self.accept_kline(candle) {
                Some(candle) => self.emit(FeedEvent::Update(candle)),
                None => true,
            },
            StreamMessage::Trade(trade) => match self.trades.fold(&trade) {
                Some(candle) => self.emit(FeedEvent::Update(candle)),
                None => {
                    self.metrics.record_stale();
                    true
                }
            },
            StreamMessage::Unrecognized { stream } => {
                trace!(?stream, "Ignoring message for another stream");
                true
            }
        }
    }

    /// Drop updates for buckets older than the newest closed one.
    fn accept_kline(&mut self, candle: Candle) -> Option<Candle> {
        if let Some(last) = self.last_closed_bucket {
            if candle.bucket_start < last {
                self.metrics.record_stale();
                debug!(bucket = candle.bucket_start, last_closed = last, "Dropping stale kline");
                return None;
            }
        }
        if candle.is_closed {
            self.last_closed_bucket = Some(candle.bucket_start);
        }
        Some(candle)
    }

    fn emit(&self, event: FeedEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Sleep out the reconnect delay. `false` if shutdown arrived first.
    async fn wait_reconnect_delay(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown_signalled(shutdown) => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

/// Owner handle for a running [`FeedConnection`].
pub struct ConnectionHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Cancel pending timers, close the socket and wait for the task.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Feed connection task failed");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
