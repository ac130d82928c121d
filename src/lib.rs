//! # layered-ws: RFC 6455 WebSocket over a header/stream transport
//!
//! A WebSocket endpoint for transports that hand out a bidirectional byte
//! stream plus a header-list exchange (HTTP/3 request streams, or a plain
//! TCP stream through [`transport::io::IoTransport`]), with a layered client
//! runtime on top:
//!
//! - **Frame codec** ([`frame`]): stateless parse/encode with masking,
//!   minimal length encoding and control-frame validation
//! - **Connection** ([`connection`]): handshake, open/closing/closed states,
//!   fragment reassembly, close echo
//! - **Messages** ([`message`]): JSON envelopes, bounded send queue with a
//!   worker thread, request/response correlation with timeouts
//! - **Events** ([`event`]): priority pub/sub bus with timers
//! - **Session** ([`session`]): subscriptions, heartbeats, reconnect policy
//!
//! ## Example
//!
//! ```ignore
//! use layered_ws::prelude::*;
//! use layered_ws::transport::io::TcpConnector;
//!
//! let client = LayeredClient::new(Config::default(), TcpConnector)?;
//! client.on_event(EventKind::Session, |event| {
//!     if let Some(SessionEvent::NotificationReceived { topic, .. }) = event.payload() {
//!         println!("notification on {topic}");
//!     }
//! });
//! client.subscribe("news")?;
//! client.run().await?;
//! ```

pub mod client;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod queue;
pub mod server;
pub mod session;
pub mod timer;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{CloseReason, Error, ErrorCode, Result};
pub use frame::{Frame, OpCode};

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Control frames carry at most this many payload bytes
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Only protocol version spoken
pub const WS_VERSION: &str = "13";

/// Default receive buffer size
pub const RECV_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Client and connection configuration
///
/// Every field has a default, so a JSON config only needs the fields it
/// changes:
///
/// ```
/// let config = layered_ws::Config::from_json_str(r#"{"host": "example.com", "port": 9000}"#).unwrap();
/// assert_eq!(config.authority(), "example.com:9000");
/// assert_eq!(config.max_reconnect_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host name
    pub host: String,
    /// Server port
    pub port: u16,
    /// Request path for the upgrade
    pub path: String,
    /// Optional Origin header
    pub origin: Option<String>,
    /// Client identifier placed in heartbeats and message ids
    pub client_id: String,
    /// Client version reported in the user agent
    pub client_version: String,
    /// Handshake/connect deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Default request timeout in milliseconds
    pub response_timeout_ms: u64,
    /// Heartbeat period in milliseconds (0 disables heartbeats)
    pub heartbeat_interval_ms: u64,
    /// How long to wait for the peer's close echo
    pub close_timeout_ms: u64,
    /// Reconnect automatically after a disconnect
    pub auto_reconnect: bool,
    /// Maximum reconnect attempts before giving up for good
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay in milliseconds
    pub reconnect_delay_ms: u64,
    /// Multiplier applied per attempt
    pub reconnect_backoff_factor: f64,
    /// Maximum reassembled message size in bytes
    pub max_message_size: usize,
    /// Maximum single frame payload in bytes; larger outgoing messages are fragmented
    pub max_frame_size: usize,
    /// Outbound envelope queue capacity
    pub message_queue_size: usize,
    /// Event bus queue capacity
    pub event_queue_size: usize,
    /// Event bus worker threads (0 = dispatch from the client loop)
    pub worker_threads: usize,
    /// Dispatch higher-priority envelopes and events first
    pub enable_priority_queue: bool,
    /// Upper bound between client loop iterations in milliseconds
    pub tick_interval_ms: u64,
    /// Default log filter for binaries
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4433,
            path: "/websocket".to_string(),
            origin: None,
            client_id: "layered_client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            close_timeout_ms: 5_000,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            reconnect_backoff_factor: 2.0,
            max_message_size: 1024 * 1024,
            max_frame_size: 1024 * 1024,
            message_queue_size: 1000,
            event_queue_size: 1000,
            worker_threads: 2,
            enable_priority_queue: true,
            tick_interval_ms: 50,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Parse a JSON config and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".into()));
        }
        if !self.path.starts_with('/') {
            return Err(Error::Config("path must start with '/'".into()));
        }
        if self.max_message_size == 0 || self.max_frame_size == 0 {
            return Err(Error::Config("message and frame limits must be positive".into()));
        }
        if self.message_queue_size == 0 || self.event_queue_size == 0 {
            return Err(Error::Config("queue sizes must be positive".into()));
        }
        if !(self.reconnect_backoff_factor >= 1.0) {
            return Err(Error::Config("reconnect_backoff_factor must be >= 1".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` for the `:authority` pseudo-header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// User agent sent with the upgrade request
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.client_id, self.client_version)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Builder for client configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set server host and port
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Set the upgrade path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the Origin header
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = Some(origin.into());
        self
    }

    /// Set the client identifier
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    /// Set connect and response timeouts in milliseconds
    pub fn timeouts(mut self, connect_ms: u64, response_ms: u64) -> Self {
        self.config.connect_timeout_ms = connect_ms;
        self.config.response_timeout_ms = response_ms;
        self
    }

    /// Set the close-handshake timeout in milliseconds
    pub fn close_timeout(mut self, ms: u64) -> Self {
        self.config.close_timeout_ms = ms;
        self
    }

    /// Set heartbeat interval (0 disables)
    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    /// Configure reconnection
    pub fn reconnect(mut self, enabled: bool, max_attempts: u32, base_delay_ms: u64, factor: f64) -> Self {
        self.config.auto_reconnect = enabled;
        self.config.max_reconnect_attempts = max_attempts;
        self.config.reconnect_delay_ms = base_delay_ms;
        self.config.reconnect_backoff_factor = factor;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set outbound queue capacity
    pub fn message_queue_size(mut self, size: usize) -> Self {
        self.config.message_queue_size = size;
        self
    }

    /// Set event bus queue capacity
    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.config.event_queue_size = size;
        self
    }

    /// Set event worker threads (0 = dispatch from the client loop)
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Enable or disable priority ordering
    pub fn priority_queue(mut self, enabled: bool) -> Self {
        self.config.enable_priority_queue = enabled;
        self
    }

    /// Set client loop tick interval
    pub fn tick_interval(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    /// Set default log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::client::{ClientStats, LayeredClient};
    pub use crate::connection::{Connection, ConnectionEvent, Message, Role, State};
    pub use crate::envelope::{Envelope, Priority};
    pub use crate::error::{CloseReason, Error, ErrorCode, Result};
    pub use crate::event::{Event, EventBus, EventKind, ListenerId};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::session::{ClientState, SessionEvent, Subscription};
    pub use crate::transport::{Connector, Transport};
    pub use crate::{Config, ConfigBuilder};
}
