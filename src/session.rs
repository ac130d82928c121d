//! Session layer: subscriptions, heartbeat, auth and reconnect policy
//!
//! [`Session`] sits on top of the [`MessageHandler`] and turns raw
//! [`MessageEvent`]s into [`SessionEvent`]s published on the
//! [`EventBus`] under [`EventKind::Session`].
//!
//! Session state is guarded by one lock which is always released before
//! anything is published or sent, so listeners may call back into the
//! session (subscribe from a notification handler, etc.).

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::Config;
use crate::envelope::{Envelope, Priority, kind, timestamp_ms};
use crate::error::{CloseReason, Error, ErrorCode, Result};
use crate::event::{EventBus, EventKind};
use crate::message::{MessageEvent, MessageHandler};
use crate::timer::TimerId;

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
    Error,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
            ClientState::ShuttingDown => "shutting_down",
            ClientState::Error => "error",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One topic subscription record
///
/// Records are never removed; unsubscribing only clears `active`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub active: bool,
    /// Milliseconds since the Unix epoch of the last (re)activation
    pub subscribed_at: u64,
    pub message_count: u64,
    pub filters: Option<Value>,
}

/// Events published on the bus under [`EventKind::Session`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: ClientState, to: ClientState },
    Connected,
    Disconnected { reason: Option<CloseReason> },
    /// Inbound envelope with no more specific route
    MessageReceived(Envelope),
    NotificationReceived {
        topic: String,
        content: Value,
        timestamp: Option<u64>,
        envelope: Envelope,
    },
    /// A `publish` for a topic this session is subscribed to
    TopicMessage {
        topic: String,
        content: Value,
        envelope: Envelope,
    },
    ResponseReceived {
        request_id: String,
        envelope: Envelope,
        elapsed_ms: f64,
    },
    RequestTimeout { request_id: String },
    /// Subscription acknowledged (or refused) by the server
    Subscribed { topic: String, success: bool },
    Authenticated {
        success: bool,
        session_id: Option<String>,
        error: Option<String>,
    },
    /// `error` envelope from the server
    ServerError { code: Option<i64>, message: String },
    HeartbeatAck,
    Error { code: ErrorCode, description: String },
    QueueFull { id: String },
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub notifications_received: u64,
    pub subscriptions_active: u64,
    pub publications_sent: u64,
    pub heartbeats_sent: u64,
    pub last_heartbeat_at: Option<u64>,
    pub avg_response_time_ms: f64,
    pub session_started_at: u64,
    pub session_id: Option<String>,
}

/// Outcome of [`ReconnectPolicy::on_disconnect`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` counts from 1
    Retry { attempt: u32, delay: Duration },
    /// Attempts used up; auto-reconnect is now off for good
    Exhausted,
    /// Auto-reconnect is off
    Disabled,
}

/// Exponential backoff with a hard attempt limit
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    exhausted: bool,
    max_attempts: u32,
    base_delay: Duration,
    factor: f64,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.auto_reconnect,
            exhausted: false,
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_delay_ms),
            factor: config.reconnect_backoff_factor,
            attempts: 0,
        }
    }

    /// `base * factor^attempt`, saturating at `Duration::MAX`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Decide what to do after losing the connection
    pub fn on_disconnect(&mut self) -> ReconnectDecision {
        if !self.enabled {
            return ReconnectDecision::Disabled;
        }
        if self.attempts >= self.max_attempts {
            self.enabled = false;
            self.exhausted = true;
            return ReconnectDecision::Exhausted;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Reset the attempt counter after a successful connect
    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Toggle auto-reconnect; an exhausted policy stays off
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if enabled && self.exhausted {
            return false;
        }
        self.enabled = enabled;
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Auth request payload; absent credentials are omitted
pub fn build_auth_request(username: Option<&str>, password: Option<&str>, token: Option<&str>) -> Value {
    let mut data = Map::new();
    for (key, value) in [("username", username), ("password", password), ("token", token)] {
        if let Some(value) = value {
            data.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(data)
}

/// Query request payload
pub fn build_query_request(query_type: &str, parameters: Option<Value>) -> Value {
    let mut data = json!({ "query_type": query_type });
    if let Some(parameters) = parameters {
        data["parameters"] = parameters;
    }
    data
}

pub fn build_subscribe_request(topic: &str, filters: Option<&Value>) -> Value {
    let mut data = json!({ "topic": topic });
    if let Some(filters) = filters {
        data["filters"] = filters.clone();
    }
    data
}

pub fn build_publish_request(topic: &str, content: Value) -> Value {
    json!({
        "topic": topic,
        "content": content,
        "timestamp": timestamp_ms(),
    })
}

pub fn build_heartbeat_request(client_id: &str, timestamp: u64) -> Value {
    json!({
        "client_id": client_id,
        "timestamp": timestamp,
        "status": "alive",
    })
}

/// Parsed auth response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub success: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

/// Read `success`, `session_id` and `error` from a response body
///
/// The fields may sit at the top level or inside `payload`.
pub fn parse_auth_response(data: &Value) -> AuthResponse {
    let field = |name: &str| {
        data.get(name)
            .or_else(|| data.get("payload").and_then(|p| p.get(name)))
    };
    let success = field("success").and_then(Value::as_bool).unwrap_or(false);
    let text = |name: &str| field(name).and_then(Value::as_str).map(str::to_string);
    AuthResponse {
        success,
        session_id: if success { text("session_id") } else { None },
        error: if success { None } else { text("error") },
    }
}

/// Parsed notification body
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub content: Value,
    pub timestamp: Option<u64>,
}

/// Notification body; `None` without a string `topic`
pub fn parse_notification(data: &Value) -> Option<Notification> {
    let topic = data.get("topic")?.as_str()?.to_string();
    Some(Notification {
        topic,
        content: data.get("content").cloned().unwrap_or(Value::Null),
        timestamp: data.get("timestamp").and_then(Value::as_u64),
    })
}

/// `(topic, success)` of a subscription acknowledgement
pub fn parse_subscription_response(data: &Value) -> Option<(String, bool)> {
    let topic = data.get("topic")?.as_str()?.to_string();
    let success = data.get("success").and_then(Value::as_bool).unwrap_or(true);
    Some((topic, success))
}

struct Inner {
    state: ClientState,
    subscriptions: Vec<Subscription>,
    stats: SessionStats,
    pending_auth: Option<String>,
    heartbeat: Option<TimerId>,
}

/// Business layer for one client
pub struct Session {
    messages: Arc<MessageHandler>,
    bus: Arc<EventBus>,
    client_id: String,
    heartbeat_interval: Duration,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(config: &Config, messages: Arc<MessageHandler>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            messages,
            bus,
            client_id: config.client_id.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            inner: Mutex::new(Inner {
                state: ClientState::Disconnected,
                subscriptions: Vec::new(),
                stats: SessionStats {
                    session_started_at: timestamp_ms(),
                    ..SessionStats::default()
                },
                pending_auth: None,
                heartbeat: None,
            }),
        })
    }

    fn emit(&self, event: SessionEvent) {
        let priority = match &event {
            SessionEvent::Error { .. } | SessionEvent::Disconnected { .. } => Priority::Urgent,
            SessionEvent::StateChanged { .. } | SessionEvent::Connected => Priority::High,
            _ => Priority::Normal,
        };
        if let Err(e) = self.bus.publish_owned(EventKind::Session, priority, event) {
            debug!(error = %e, "session event not published");
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Move to `state`, publishing `StateChanged` if it differs
    pub fn set_state(&self, state: ClientState) -> ClientState {
        let from = std::mem::replace(&mut self.inner.lock().state, state);
        if from != state {
            debug!(%from, to = %state, "client state changed");
            self.emit(SessionEvent::StateChanged { from, to: state });
        }
        from
    }

    /// Connection opened: go `Connected`, restore subscriptions, start heartbeats
    pub fn on_connected(self: &Arc<Self>) {
        self.set_state(ClientState::Connected);
        self.emit(SessionEvent::Connected);

        let restore: Vec<(String, Option<Value>)> = self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .map(|s| (s.topic.clone(), s.filters.clone()))
            .collect();
        for (topic, filters) in restore {
            let data = build_subscribe_request(&topic, filters.as_ref());
            if let Err(e) = self.messages.send_notification(kind::SUBSCRIBE, data) {
                warn!(%topic, error = %e, "failed to restore subscription");
            }
        }

        self.start_heartbeat();
    }

    /// Connection lost
    pub fn on_disconnected(&self, reason: Option<CloseReason>) {
        self.stop_heartbeat();
        self.inner.lock().pending_auth = None;
        self.emit(SessionEvent::Disconnected { reason });
    }

    /// Publish an error event for a failure outside the message layer
    pub fn report_error(&self, error: &Error) {
        self.emit(SessionEvent::Error {
            code: error.code(),
            description: error.to_string(),
        });
    }

    /// Subscribe to `topic`
    pub fn subscribe(&self, topic: &str) -> Result<String> {
        self.subscribe_with_filters(topic, None)
    }

    /// Subscribe with server-side filters
    ///
    /// Reactivates an inactive record for `topic`; fails with
    /// [`Error::AlreadySubscribed`] if one is active.
    pub fn subscribe_with_filters(&self, topic: &str, filters: Option<Value>) -> Result<String> {
        let reactivated = {
            let mut inner = self.inner.lock();
            let now = timestamp_ms();
            let reactivated = match inner.subscriptions.iter_mut().find(|s| s.topic == topic) {
                Some(sub) if sub.active => return Err(Error::AlreadySubscribed(topic.to_string())),
                Some(sub) => {
                    sub.active = true;
                    sub.subscribed_at = now;
                    sub.filters = filters.clone();
                    true
                }
                None => {
                    inner.subscriptions.push(Subscription {
                        topic: topic.to_string(),
                        active: true,
                        subscribed_at: now,
                        message_count: 0,
                        filters: filters.clone(),
                    });
                    false
                }
            };
            inner.stats.subscriptions_active += 1;
            reactivated
        };

        let data = build_subscribe_request(topic, filters.as_ref());
        match self.messages.send_notification(kind::SUBSCRIBE, data) {
            Ok(id) => {
                info!(%topic, reactivated, "subscribed");
                Ok(id)
            }
            Err(e) => {
                self.deactivate(topic);
                Err(e)
            }
        }
    }

    fn deactivate(&self, topic: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.subscriptions.iter_mut().find(|s| s.topic == topic && s.active) {
            Some(sub) => {
                sub.active = false;
                inner.stats.subscriptions_active = inner.stats.subscriptions_active.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Unsubscribe from an active topic
    pub fn unsubscribe(&self, topic: &str) -> Result<String> {
        if !self.deactivate(topic) {
            return Err(Error::NotSubscribed(topic.to_string()));
        }
        self.messages
            .send_notification(kind::UNSUBSCRIBE, json!({ "topic": topic }))
    }

    /// Publish `content` to `topic`
    pub fn publish(&self, topic: &str, content: Value) -> Result<String> {
        let id = self
            .messages
            .send_notification(kind::PUBLISH, build_publish_request(topic, content))?;
        self.inner.lock().stats.publications_sent += 1;
        Ok(id)
    }

    /// Send a query request; the answer arrives as `ResponseReceived`
    pub fn send_request(&self, query_type: &str, parameters: Option<Value>) -> Result<String> {
        let id = self
            .messages
            .send_request(kind::REQUEST, build_query_request(query_type, parameters), None)?;
        self.inner.lock().stats.requests_sent += 1;
        Ok(id)
    }

    pub fn send_notification(&self, kind: &str, data: Value) -> Result<String> {
        self.messages.send_notification(kind, data)
    }

    /// Send an `auth` request; the outcome arrives as `Authenticated`
    pub fn authenticate(&self, username: Option<&str>, password: Option<&str>, token: Option<&str>) -> Result<String> {
        let data = build_auth_request(username, password, token);
        let id = self.messages.send_request("auth", data, None)?;
        let mut inner = self.inner.lock();
        inner.pending_auth = Some(id.clone());
        inner.stats.requests_sent += 1;
        Ok(id)
    }

    /// Send a heartbeat if connected
    ///
    /// Returns `Ok(false)` without sending when not `Connected`.
    pub fn send_heartbeat(&self) -> Result<bool> {
        if self.state() != ClientState::Connected {
            return Ok(false);
        }
        let now = timestamp_ms();
        self.messages.send_message(
            kind::HEARTBEAT,
            build_heartbeat_request(&self.client_id, now),
            Priority::High,
        )?;
        let mut inner = self.inner.lock();
        inner.stats.heartbeats_sent += 1;
        inner.stats.last_heartbeat_at = Some(now);
        Ok(true)
    }

    /// Heartbeat timer body; failures are logged only
    pub fn heartbeat_tick(&self) {
        if let Err(e) = self.send_heartbeat() {
            warn!(error = %e, "heartbeat not sent");
        }
    }

    /// Start the periodic heartbeat (no-op if the interval is zero or already running)
    pub fn start_heartbeat(self: &Arc<Self>) {
        if self.heartbeat_interval.is_zero() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.heartbeat.is_some() {
            return;
        }
        let session: Weak<Session> = Arc::downgrade(self);
        let id = self.bus.create_timer(self.heartbeat_interval, true, move || {
            if let Some(session) = session.upgrade() {
                session.heartbeat_tick();
            }
        });
        inner.heartbeat = Some(id);
    }

    pub fn stop_heartbeat(&self) {
        let timer = self.inner.lock().heartbeat.take();
        if let Some(id) = timer {
            self.bus.destroy_timer(id);
        }
    }

    fn count_topic_message(&self, topic: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.subscriptions.iter_mut().find(|s| s.topic == topic && s.active) {
            Some(sub) => {
                sub.message_count += 1;
                true
            }
            None => false,
        }
    }

    /// Route one message layer event
    pub fn on_message_event(&self, event: MessageEvent) {
        match event {
            MessageEvent::Received(envelope) => self.on_envelope(envelope),
            MessageEvent::Response {
                request_id,
                envelope,
                elapsed,
            } => {
                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                let auth = {
                    let mut inner = self.inner.lock();
                    inner.stats.responses_received += 1;
                    let avg = inner.stats.avg_response_time_ms;
                    inner.stats.avg_response_time_ms =
                        if avg == 0.0 { elapsed_ms } else { avg * 0.9 + elapsed_ms * 0.1 };

                    if inner.pending_auth.as_deref() == Some(request_id.as_str()) {
                        inner.pending_auth = None;
                        let auth = parse_auth_response(&envelope.data);
                        if auth.success {
                            inner.stats.session_id = auth.session_id.clone();
                        }
                        Some(auth)
                    } else {
                        None
                    }
                };
                if let Some(auth) = auth {
                    info!(success = auth.success, "authentication finished");
                    self.emit(SessionEvent::Authenticated {
                        success: auth.success,
                        session_id: auth.session_id,
                        error: auth.error,
                    });
                }
                self.emit(SessionEvent::ResponseReceived {
                    request_id,
                    envelope,
                    elapsed_ms,
                });
            }
            MessageEvent::Timeout { request_id } => {
                let was_auth = {
                    let mut inner = self.inner.lock();
                    let was_auth = inner.pending_auth.as_deref() == Some(request_id.as_str());
                    if was_auth {
                        inner.pending_auth = None;
                    }
                    was_auth
                };
                if was_auth {
                    self.emit(SessionEvent::Authenticated {
                        success: false,
                        session_id: None,
                        error: Some("timeout".to_string()),
                    });
                }
                self.emit(SessionEvent::RequestTimeout { request_id });
            }
            MessageEvent::Error { id, error } => {
                let description = match id {
                    Some(id) => format!("{id}: {error}"),
                    None => error.to_string(),
                };
                self.emit(SessionEvent::Error {
                    code: error.code(),
                    description,
                });
            }
            MessageEvent::QueueFull(envelope) => {
                self.emit(SessionEvent::QueueFull { id: envelope.id });
            }
            MessageEvent::Sent { .. } => {}
        }
    }

    fn on_envelope(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            kind::NOTIFICATION => {
                self.inner.lock().stats.notifications_received += 1;
                match parse_notification(&envelope.data) {
                    Some(n) => {
                        self.count_topic_message(&n.topic);
                        self.emit(SessionEvent::NotificationReceived {
                            topic: n.topic,
                            content: n.content,
                            timestamp: n.timestamp,
                            envelope,
                        });
                    }
                    None => self.emit(SessionEvent::MessageReceived(envelope)),
                }
            }
            kind::PUBLISH => match parse_notification(&envelope.data) {
                Some(n) if self.count_topic_message(&n.topic) => {
                    self.emit(SessionEvent::TopicMessage {
                        topic: n.topic,
                        content: n.content,
                        envelope,
                    });
                }
                _ => self.emit(SessionEvent::MessageReceived(envelope)),
            },
            kind::SUBSCRIBE => match parse_subscription_response(&envelope.data) {
                Some((topic, success)) => {
                    if !success {
                        self.deactivate(&topic);
                    }
                    self.emit(SessionEvent::Subscribed { topic, success });
                }
                None => self.emit(SessionEvent::MessageReceived(envelope)),
            },
            kind::HEARTBEAT => self.emit(SessionEvent::HeartbeatAck),
            kind::ERROR => {
                let code = envelope.data.get("code").and_then(Value::as_i64);
                let message = envelope
                    .data_str("message")
                    .or_else(|| envelope.data.as_str())
                    .unwrap_or("server error")
                    .to_string();
                warn!(?code, %message, "server error");
                self.emit(SessionEvent::ServerError { code, message });
            }
            _ => self.emit(SessionEvent::MessageReceived(envelope)),
        }
    }

    /// Snapshot of every subscription record
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().stats.session_id.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.lock().stats.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(id) = self.inner.get_mut().heartbeat.take() {
            self.bus.destroy_timer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBusConfig;
    use crate::message::FrameSink;
    use std::time::Instant;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    #[derive(Default)]
    struct Sink(Mutex<Vec<Envelope>>);

    impl FrameSink for Sink {
        fn send_text(&self, text: &str) -> Result<()> {
            self.0.lock().push(Envelope::from_json(text)?);
            Ok(())
        }
    }

    struct Harness {
        session: Arc<Session>,
        bus: Arc<EventBus>,
        sink: Arc<Sink>,
        rx: UnboundedReceiver<MessageEvent>,
        seen: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let bus = Arc::new(EventBus::new(EventBusConfig {
                worker_threads: 0,
                queue_size: 256,
                priority: false,
            }));
            let seen = Arc::new(Mutex::new(Vec::new()));
            let s = seen.clone();
            bus.subscribe(EventKind::Session, move |e| {
                if let Some(event) = e.payload::<SessionEvent>() {
                    s.lock().push(event.clone());
                }
            });
            let (tx, rx) = unbounded_channel();
            let messages = Arc::new(MessageHandler::new(&config, tx));
            let sink = Arc::new(Sink::default());
            messages.set_sink(Some(sink.clone()));
            let session = Session::new(&config, messages, bus.clone());
            Self {
                session,
                bus,
                sink,
                rx,
                seen,
            }
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.bus.process_all();
            std::mem::take(&mut *self.seen.lock())
        }

        fn wait_sent(&self, n: usize) -> Vec<Envelope> {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.sink.0.lock().len() < n {
                assert!(Instant::now() < deadline, "messages not sent");
                std::thread::sleep(Duration::from_millis(2));
            }
            self.sink.0.lock().clone()
        }
    }

    fn config() -> Config {
        Config::builder()
            .client_id("sess")
            .heartbeat_interval(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_subscribe_idempotence() {
        let h = Harness::new(config());
        h.session.subscribe("news").unwrap();
        assert!(matches!(
            h.session.subscribe("news"),
            Err(Error::AlreadySubscribed(t)) if t == "news"
        ));
        assert_eq!(h.session.subscriptions().len(), 1);

        h.session.unsubscribe("news").unwrap();
        assert!(matches!(h.session.unsubscribe("news"), Err(Error::NotSubscribed(_))));
        let subs = h.session.subscriptions();
        assert_eq!(subs.len(), 1);
        assert!(!subs[0].active);

        h.session.subscribe("news").unwrap();
        let subs = h.session.subscriptions();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].active);
        assert_eq!(h.session.stats().subscriptions_active, 1);

        let sent = h.wait_sent(3);
        let kinds: Vec<&str> = sent.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["subscribe", "unsubscribe", "subscribe"]);
        assert_eq!(sent[0].data, json!({"topic": "news"}));
    }

    #[test]
    fn test_message_count_survives_unsubscribe() {
        let h = Harness::new(config());
        h.session.subscribe("chat").unwrap();
        let note = Envelope::new(
            kind::NOTIFICATION,
            "n1",
            json!({"topic": "chat", "content": "hi", "timestamp": 5}),
        );
        h.session.on_message_event(MessageEvent::Received(note.clone()));
        h.session.unsubscribe("chat").unwrap();
        h.session.on_message_event(MessageEvent::Received(note));
        assert_eq!(h.session.subscriptions()[0].message_count, 1);

        let events = h.events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::NotificationReceived { topic, content, timestamp: Some(5), .. }
                if topic == "chat" && content == "hi"
        )));
        assert_eq!(h.session.stats().notifications_received, 2);
    }

    #[test]
    fn test_heartbeat_only_when_connected() {
        let h = Harness::new(config());
        assert!(!h.session.send_heartbeat().unwrap());
        assert_eq!(h.session.stats().heartbeats_sent, 0);

        h.session.set_state(ClientState::Connected);
        assert!(h.session.send_heartbeat().unwrap());
        let sent = h.wait_sent(1);
        assert!(sent[0].is(kind::HEARTBEAT));
        assert_eq!(sent[0].priority, Priority::High);
        assert_eq!(sent[0].data["client_id"], "sess");
        assert_eq!(sent[0].data["status"], "alive");
        assert_eq!(h.session.stats().heartbeats_sent, 1);
    }

    #[test]
    fn test_heartbeat_timer() {
        let config = Config::builder()
            .client_id("sess")
            .heartbeat_interval(10)
            .build()
            .unwrap();
        let h = Harness::new(config);
        h.session.on_connected();
        std::thread::sleep(Duration::from_millis(80));
        h.session.on_disconnected(None);
        std::thread::sleep(Duration::from_millis(20));
        let sent = h.session.stats().heartbeats_sent;
        assert!(sent >= 2);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(h.session.stats().heartbeats_sent, sent);
    }

    #[test]
    fn test_auth_flow() {
        let mut h = Harness::new(config());
        let id = h.session.authenticate(Some("alice"), Some("pw"), None).unwrap();
        let sent = h.wait_sent(1);
        assert!(sent[0].is("auth"));
        assert_eq!(sent[0].data, json!({"username": "alice", "password": "pw"}));

        let reply = Envelope::new(
            kind::RESPONSE,
            "srv_1",
            json!({"request_id": id, "success": true, "session_id": "s-42"}),
        );
        h.session.messages.on_text(&reply.to_json().unwrap());
        while let Ok(event) = h.rx.try_recv() {
            h.session.on_message_event(event);
        }

        let events = h.events();
        assert!(events.contains(&SessionEvent::Authenticated {
            success: true,
            session_id: Some("s-42".into()),
            error: None,
        }));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::ResponseReceived { request_id, .. } if *request_id == id)));
        assert_eq!(h.session.session_id().as_deref(), Some("s-42"));
    }

    #[test]
    fn test_routing() {
        let h = Harness::new(config());
        h.session.subscribe("room").unwrap();
        h.session.on_message_event(MessageEvent::Received(Envelope::new(
            kind::PUBLISH,
            "p1",
            json!({"topic": "room", "content": {"text": "yo"}}),
        )));
        h.session.on_message_event(MessageEvent::Received(Envelope::new(
            kind::PUBLISH,
            "p2",
            json!({"topic": "elsewhere", "content": "x"}),
        )));
        h.session.on_message_event(MessageEvent::Received(Envelope::new(
            kind::SUBSCRIBE,
            "a1",
            json!({"topic": "room", "success": false}),
        )));
        h.session.on_message_event(MessageEvent::Received(Envelope::new(
            kind::ERROR,
            "e1",
            json!({"code": 42, "message": "nope"}),
        )));
        h.session.on_message_event(MessageEvent::Timeout {
            request_id: "r9".into(),
        });
        h.session.on_message_event(MessageEvent::QueueFull(Envelope::new("x", "q1", json!({}))));

        let events = h.events();
        assert!(events.iter().any(|e| matches!(e, SessionEvent::TopicMessage { topic, .. } if topic == "room")));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::MessageReceived(env) if env.id == "p2")));
        assert!(events.contains(&SessionEvent::Subscribed {
            topic: "room".into(),
            success: false
        }));
        assert!(events.contains(&SessionEvent::ServerError {
            code: Some(42),
            message: "nope".into()
        }));
        assert!(events.contains(&SessionEvent::RequestTimeout {
            request_id: "r9".into()
        }));
        assert!(events.contains(&SessionEvent::QueueFull { id: "q1".into() }));
        // refused subscription is inactive again
        assert!(!h.session.subscriptions()[0].active);
    }

    #[test]
    fn test_state_changes_published() {
        let h = Harness::new(config());
        assert_eq!(h.session.set_state(ClientState::Connecting), ClientState::Disconnected);
        h.session.set_state(ClientState::Connecting);
        let events = h.events();
        assert_eq!(
            events,
            vec![SessionEvent::StateChanged {
                from: ClientState::Disconnected,
                to: ClientState::Connecting
            }]
        );
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = Config::builder().reconnect(true, 3, 100, 2.0).build().unwrap();
        let mut policy = ReconnectPolicy::new(&config);
        let delays: Vec<_> = (0..3)
            .map(|_| match policy.on_disconnect() {
                ReconnectDecision::Retry { delay, .. } => delay,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(policy.on_disconnect(), ReconnectDecision::Exhausted);
        assert_eq!(policy.on_disconnect(), ReconnectDecision::Disabled);
        assert!(!policy.set_enabled(true));
        assert!(policy.is_exhausted());
    }

    #[test]
    fn test_reconnect_resets_on_connect() {
        let config = Config::builder().reconnect(true, 2, 10, 3.0).build().unwrap();
        let mut policy = ReconnectPolicy::new(&config);
        policy.on_disconnect();
        policy.on_disconnect();
        policy.on_connected();
        assert_eq!(
            policy.on_disconnect(),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert!(policy.set_enabled(false));
        assert_eq!(policy.on_disconnect(), ReconnectDecision::Disabled);
    }

    #[test]
    fn test_payload_parsers() {
        let auth = parse_auth_response(&json!({"success": false, "error": "bad password"}));
        assert_eq!(auth.error.as_deref(), Some("bad password"));
        assert!(auth.session_id.is_none());

        let nested = parse_auth_response(&json!({"payload": {"success": true, "session_id": "x"}}));
        assert_eq!(nested.session_id.as_deref(), Some("x"));

        assert!(parse_notification(&json!({"content": "no topic"})).is_none());
        assert_eq!(
            parse_subscription_response(&json!({"topic": "t"})),
            Some(("t".to_string(), true))
        );
        assert_eq!(
            build_query_request("status", Some(json!({"verbose": true}))),
            json!({"query_type": "status", "parameters": {"verbose": true}})
        );
        assert_eq!(build_auth_request(None, None, Some("tok")), json!({"token": "tok"}));
    }
}
