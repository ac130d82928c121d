//! Layered client runtime
//!
//! [`LayeredClient`] wires the layers together:
//!
//! ```text
//! Session  <- MessageEvent --  MessageHandler --FrameSink-->  Connection --> Transport
//!    |                              ^ worker thread                 ^
//!    +--> EventBus (SessionEvent)   |                               | LoopWaker
//!                                   +------------ run() loop -------+
//! ```
//!
//! [`LayeredClient::run`] owns the event loop: it connects through the
//! configured [`Connector`], drives the [`Connection`], routes message
//! events into the [`Session`] and reconnects with exponential backoff
//! until [`LayeredClient::stop`] is called or the attempts run out.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use layered_ws::prelude::*;
//! use layered_ws::transport::io::TcpConnector;
//!
//! let config = Config::builder().server("127.0.0.1", 9001).build()?;
//! let client = Arc::new(LayeredClient::new(config, TcpConnector)?);
//! client.on_session_event(|event| println!("{event:?}"));
//!
//! let runner = tokio::spawn({
//!     let client = client.clone();
//!     async move { client.run().await }
//! });
//! client.subscribe("news")?;
//! client.stop();
//! runner.await??;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, info, trace, warn};

use crate::Config;
use crate::connection::{Connection, ConnectionEvent, ConnectionStats, Message};
use crate::envelope::{Envelope, timestamp_ms};
use crate::error::{CloseReason, Error, Result};
use crate::event::{Event, EventBus, EventBusConfig, EventKind, EventStats, ListenerId};
use crate::message::{FrameSink, MessageEvent, MessageHandler, MessageStats};
use crate::session::{
    ClientState, ReconnectDecision, ReconnectPolicy, Session, SessionEvent, SessionStats,
    Subscription,
};
use crate::transport::{Connector, LoopWaker, Transport};

type SharedConnection = Arc<Mutex<Connection<Box<dyn Transport>>>>;

// ============================================================================
// FrameSink over the live connection
// ============================================================================

/// Lets the message worker write into the connection owned by the loop
struct ConnectionSink {
    conn: SharedConnection,
    waker: LoopWaker,
}

impl FrameSink for ConnectionSink {
    fn send_text(&self, text: &str) -> Result<()> {
        let result = self.conn.lock().send_text(text);
        // the loop picks up partial writes and any resulting events
        self.waker.wake();
        result
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Client-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub current_state: ClientState,
    pub uptime_ms: u64,
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub reconnections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors_count: u64,
    pub avg_response_time_ms: f64,
    pub last_connected_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub message: MessageStats,
    pub session: SessionStats,
    pub events: EventStats,
}

impl ClientStats {
    /// Pretty-printed JSON export
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Default)]
struct Counters {
    total_connections: u64,
    successful_connections: u64,
    failed_connections: u64,
    reconnections: u64,
    errors: u64,
    last_connected_at: Option<u64>,
    last_message_at: Option<u64>,
    /// Totals of connections that have closed
    retired: ConnectionStats,
}

fn accumulate(total: &mut ConnectionStats, add: &ConnectionStats) {
    total.frames_sent += add.frames_sent;
    total.frames_received += add.frames_received;
    total.bytes_sent += add.bytes_sent;
    total.bytes_received += add.bytes_received;
    total.messages_sent += add.messages_sent;
    total.messages_received += add.messages_received;
    total.pings_received += add.pings_received;
}

// ============================================================================
// LayeredClient
// ============================================================================

/// How one connection ended
struct DriveEnd {
    opened: bool,
    error: Option<Error>,
}

/// WebSocket client with message queueing, events and session management
pub struct LayeredClient {
    config: Config,
    connector: Box<dyn Connector>,
    bus: Arc<EventBus>,
    messages: Arc<MessageHandler>,
    session: Arc<Session>,
    message_rx: Mutex<Option<UnboundedReceiver<MessageEvent>>>,
    waker: LoopWaker,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    reconnect: Mutex<ReconnectPolicy>,
    counters: Mutex<Counters>,
    current: Mutex<Option<SharedConnection>>,
    started: Instant,
}

impl LayeredClient {
    /// Build the layers; nothing connects until [`run`](Self::run)
    pub fn new(config: Config, connector: impl Connector + 'static) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(EventBusConfig::from(&config)));
        let waker = LoopWaker::new();
        if bus.is_loop_driven() {
            bus.set_loop_waker(waker.clone());
        }
        let (tx, rx) = unbounded_channel();
        let messages = Arc::new(MessageHandler::new(&config, tx));
        let session = Session::new(&config, messages.clone(), bus.clone());

        info!(
            server = %config.authority(),
            path = %config.path,
            client_id = %config.client_id,
            "client created"
        );

        Ok(Self {
            reconnect: Mutex::new(ReconnectPolicy::new(&config)),
            connector: Box::new(connector),
            bus,
            messages,
            session,
            message_rx: Mutex::new(Some(rx)),
            waker,
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            counters: Mutex::new(Counters::default()),
            current: Mutex::new(None),
            started: Instant::now(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect and drive the client until stopped
    ///
    /// Returns `Ok(())` after [`stop`](Self::stop), the last connection
    /// error when reconnecting is disabled, or
    /// [`Error::ReconnectExhausted`] once every attempt has failed.
    pub async fn run(&self) -> Result<()> {
        let Some(mut rx) = self.message_rx.lock().take() else {
            return Err(Error::InvalidState("client is already running"));
        };
        self.stop_requested.store(false, Ordering::Release);

        let result = self.run_loop(&mut rx).await;

        // route whatever the workers produced after the last poll
        while let Ok(event) = rx.try_recv() {
            self.session.on_message_event(event);
        }
        if self.bus.is_loop_driven() {
            self.bus.process_all();
        }
        *self.message_rx.lock() = Some(rx);
        result
    }

    async fn run_loop(&self, rx: &mut UnboundedReceiver<MessageEvent>) -> Result<()> {
        let mut state = ClientState::Connecting;
        loop {
            if self.is_stop_requested() {
                self.session.set_state(ClientState::Disconnected);
                return Ok(());
            }
            self.session.set_state(state);
            self.counters.lock().total_connections += 1;

            let end = match self.connect().await {
                Ok(conn) => self.drive(conn, rx).await,
                Err(error) => DriveEnd {
                    opened: false,
                    error: Some(error),
                },
            };

            if !end.opened {
                self.counters.lock().failed_connections += 1;
            }
            if let Some(error) = &end.error {
                warn!(%error, "connection ended with error");
                self.counters.lock().errors += 1;
                self.session.report_error(error);
            }
            if self.is_stop_requested() {
                self.session.set_state(ClientState::Disconnected);
                return Ok(());
            }

            let decision = self.reconnect.lock().on_disconnect();
            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                    self.session.set_state(ClientState::Reconnecting);
                    self.counters.lock().reconnections += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop_notify.notified() => {}
                    }
                    state = ClientState::Reconnecting;
                }
                ReconnectDecision::Exhausted => {
                    let error = Error::ReconnectExhausted(self.config.max_reconnect_attempts);
                    warn!(%error, "giving up");
                    self.session.set_state(ClientState::Error);
                    self.session.report_error(&error);
                    return Err(error);
                }
                ReconnectDecision::Disabled => {
                    self.session.set_state(ClientState::Disconnected);
                    return match end.error {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    async fn connect(&self) -> Result<SharedConnection> {
        let transport =
            tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(&self.config))
                .await
                .map_err(|_| Error::Timeout("connect".into()))??;

        let mut conn = Connection::client(transport, &self.config);
        conn.transport_mut().set_waker(self.waker.clone());
        conn.start(Instant::now())?;
        debug!(server = %self.config.authority(), "upgrade request sent");
        Ok(Arc::new(Mutex::new(conn)))
    }

    async fn drive(&self, conn: SharedConnection, rx: &mut UnboundedReceiver<MessageEvent>) -> DriveEnd {
        let sink: Arc<dyn FrameSink> = Arc::new(ConnectionSink {
            conn: conn.clone(),
            waker: self.waker.clone(),
        });
        *self.current.lock() = Some(conn.clone());
        let mut opened = false;
        let mut closing = false;
        let tick = self.config.tick_interval();

        loop {
            let events = conn.lock().poll(Instant::now());
            for event in events {
                match event {
                    ConnectionEvent::Opened { protocol } => {
                        opened = true;
                        info!(?protocol, "connected");
                        {
                            let mut counters = self.counters.lock();
                            counters.successful_connections += 1;
                            counters.last_connected_at = Some(timestamp_ms());
                        }
                        self.reconnect.lock().on_connected();
                        self.messages.set_sink(Some(sink.clone()));
                        self.session.on_connected();
                    }
                    ConnectionEvent::Message(message) => self.on_message(message),
                    ConnectionEvent::Closed { reason, error } => {
                        info!(?reason, "disconnected");
                        self.messages.set_sink(None);
                        self.retire(&conn);
                        if opened {
                            self.session.on_disconnected(reason);
                        }
                        return DriveEnd { opened, error };
                    }
                }
            }

            while let Ok(event) = rx.try_recv() {
                self.session.on_message_event(event);
            }
            if self.bus.is_loop_driven() {
                self.bus.process_all();
            }

            if !closing && self.is_stop_requested() {
                closing = true;
                self.session.set_state(ClientState::ShuttingDown);
                if let Err(e) = conn.lock().close(CloseReason::NORMAL, "client shutdown") {
                    debug!(error = %e, "close failed");
                }
                continue;
            }

            tokio::select! {
                _ = self.waker.notified() => {}
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.session.on_message_event(event);
                    }
                }
                _ = tokio::time::sleep(tick) => {}
                _ = self.stop_notify.notified(), if !closing => {}
            }
        }
    }

    fn on_message(&self, message: Message) {
        self.counters.lock().last_message_at = Some(timestamp_ms());
        match message {
            Message::Text(text) => self.messages.on_text(&text),
            Message::Binary(data) => debug!(len = data.len(), "ignoring binary message"),
            Message::Ping(_) | Message::Pong(_) => trace!("control frame"),
            Message::Close(reason) => debug!(?reason, "peer sent close"),
        }
    }

    fn retire(&self, conn: &SharedConnection) {
        let stats = conn.lock().stats();
        accumulate(&mut self.counters.lock().retired, &stats);
        *self.current.lock() = None;
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Ask [`run`](Self::run) to close the connection and return
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.stop_notify.notify_one();
        self.waker.wake();
    }

    /// Stop and tear down every worker
    ///
    /// Workers are joined before their queues are released. Further sends
    /// fail with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.stop();
        self.session.stop_heartbeat();
        self.messages.shutdown();
        self.bus.shutdown();
        debug!("client shut down");
    }

    // ------------------------------------------------------------------------
    // Session passthroughs
    // ------------------------------------------------------------------------

    /// Send a query request; see [`Session::send_request`]
    pub fn send_request(&self, query_type: &str, parameters: Option<Value>) -> Result<String> {
        self.session.send_request(query_type, parameters)
    }

    pub fn send_notification(&self, kind: &str, data: Value) -> Result<String> {
        self.session.send_notification(kind, data)
    }

    /// Queue a caller-built envelope
    pub fn send_envelope(&self, envelope: Envelope) -> Result<String> {
        self.messages.send(envelope)
    }

    pub fn subscribe(&self, topic: &str) -> Result<String> {
        self.session.subscribe(topic)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<String> {
        self.session.unsubscribe(topic)
    }

    pub fn publish(&self, topic: &str, content: Value) -> Result<String> {
        self.session.publish(topic, content)
    }

    pub fn send_heartbeat(&self) -> Result<bool> {
        self.session.send_heartbeat()
    }

    pub fn authenticate(&self, username: Option<&str>, password: Option<&str>, token: Option<&str>) -> Result<String> {
        self.session.authenticate(username, password, token)
    }

    /// Toggle auto-reconnect; returns false once attempts are exhausted
    pub fn set_auto_reconnect(&self, enabled: bool) -> bool {
        self.reconnect.lock().set_enabled(enabled)
    }

    pub fn state(&self) -> ClientState {
        self.session.state()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.session.subscriptions()
    }

    /// Average request round trip in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.messages.stats().avg_response_time_ms
    }

    /// Listen for bus events of `kind`
    pub fn on_event<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    /// Listen for [`SessionEvent`]s
    pub fn on_session_event<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(EventKind::Session, move |event| {
            if let Some(session_event) = event.payload::<SessionEvent>() {
                handler(session_event);
            }
        })
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.bus.unsubscribe(kind, id)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn messages(&self) -> &Arc<MessageHandler> {
        &self.messages
    }

    /// Snapshot of every layer's counters
    pub fn stats(&self) -> ClientStats {
        let live = self.current.lock().clone().map(|conn| conn.lock().stats());
        let message = self.messages.stats();
        let counters = self.counters.lock();
        let mut traffic = counters.retired;
        if let Some(live) = live {
            accumulate(&mut traffic, &live);
        }

        ClientStats {
            current_state: self.session.state(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            total_connections: counters.total_connections,
            successful_connections: counters.successful_connections,
            failed_connections: counters.failed_connections,
            reconnections: counters.reconnections,
            messages_sent: traffic.messages_sent,
            messages_received: traffic.messages_received,
            bytes_sent: traffic.bytes_sent,
            bytes_received: traffic.bytes_received,
            errors_count: counters.errors,
            avg_response_time_ms: message.avg_response_time_ms,
            last_connected_at: counters.last_connected_at,
            last_message_at: counters.last_message_at,
            message,
            session: self.session.stats(),
            events: self.bus.stats(),
        }
    }
}

impl Drop for LayeredClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn config() -> Config {
        Config::builder()
            .server("test.local", 4433)
            .heartbeat_interval(0)
            .worker_threads(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (connector, _rx) = MemoryConnector::new();
        let mut config = config();
        config.message_queue_size = 0;
        assert!(matches!(LayeredClient::new(config, connector), Err(Error::Config(_))));
    }

    #[test]
    fn test_stats_json() {
        let (connector, _rx) = MemoryConnector::new();
        let client = LayeredClient::new(config(), connector).unwrap();
        let stats = client.stats();
        assert_eq!(stats.current_state, ClientState::Disconnected);
        let value: Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(value["current_state"], "disconnected");
        assert_eq!(value["total_connections"], 0);
        assert!(value["message"].is_object());
    }

    #[tokio::test]
    async fn test_disabled_reconnect_returns_error() {
        let (connector, _rx) = MemoryConnector::new();
        connector.fail_next(1);
        let config = Config::builder()
            .heartbeat_interval(0)
            .worker_threads(0)
            .reconnect(false, 0, 10, 2.0)
            .build()
            .unwrap();
        let client = LayeredClient::new(config, connector).unwrap();
        assert!(matches!(client.run().await, Err(Error::Transport(_))));
        let stats = client.stats();
        assert_eq!(stats.failed_connections, 1);
        assert_eq!(stats.current_state, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_exhausted() {
        let (connector, _rx) = MemoryConnector::new();
        connector.fail_next(10);
        let config = Config::builder()
            .heartbeat_interval(0)
            .worker_threads(0)
            .reconnect(true, 2, 1, 1.0)
            .build()
            .unwrap();
        let client = LayeredClient::new(config, connector).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        client.on_session_event(move |event| {
            if let SessionEvent::Error { code, .. } = event {
                e.lock().push(*code);
            }
        });

        assert!(matches!(client.run().await, Err(Error::ReconnectExhausted(2))));
        assert_eq!(client.state(), ClientState::Error);
        assert_eq!(client.stats().total_connections, 3);
        assert_eq!(client.stats().reconnections, 2);
        assert!(!client.set_auto_reconnect(true));
        assert!(errors.lock().contains(&crate::ErrorCode::ReconnectExhausted));
    }

    #[tokio::test]
    async fn test_run_twice_concurrently_rejected() {
        let (connector, _rx) = MemoryConnector::new();
        let client = Arc::new(LayeredClient::new(config(), connector).unwrap());
        let runner = tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(client.run().await, Err(Error::InvalidState(_))));
        client.stop();
        runner.await.unwrap().unwrap();
    }
}
