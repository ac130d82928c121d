//! Error types for the layered WebSocket runtime
//!
//! Every layer reports through the single [`Error`] enum. Each variant maps to
//! a machine-readable [`ErrorCode`] so application-facing `Error` events can
//! carry both a stable code and the human description from `Display`.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Frame or message level protocol violation
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Opening handshake rejected (missing headers, bad accept key)
    #[error("Handshake failed: {0}")]
    Handshake(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Reassembled message exceeds the configured limit
    #[error("Message too large")]
    MessageTooLarge,
    /// Single frame exceeds the configured limit
    #[error("Frame too large")]
    FrameTooLarge,
    /// Close frame carries a code not allowed on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Transport cannot accept more bytes right now
    #[error("Would block")]
    WouldBlock,
    /// Peer reset the stream
    #[error("Connection reset by peer")]
    ConnectionReset,
    /// Stream finished or connection already closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Failure reported by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),
    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// Bounded send queue is at capacity
    #[error("Send queue is full")]
    QueueFull,
    /// Request or handshake deadline expired
    #[error("Timed out: {0}")]
    Timeout(String),
    /// Envelope could not be serialized or parsed
    #[error("Envelope error: {0}")]
    Envelope(#[from] serde_json::Error),
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Topic already has an active subscription
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),
    /// No active subscription for topic
    #[error("Not subscribed to {0}")]
    NotSubscribed(String),
    /// Reconnect attempts used up; auto-reconnect is now disabled
    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
    /// Component is shutting down
    #[error("Shutting down")]
    Shutdown,
}

/// Machine-readable error code surfaced in application `Error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Io,
    Protocol,
    Handshake,
    InvalidPayload,
    TooLarge,
    Transport,
    InvalidState,
    QueueFull,
    Timeout,
    Envelope,
    Config,
    Subscription,
    ReconnectExhausted,
    Shutdown,
}

impl ErrorCode {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Handshake => "handshake",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::TooLarge => "too_large",
            ErrorCode::Transport => "transport",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Envelope => "envelope",
            ErrorCode::Config => "config",
            ErrorCode::Subscription => "subscription",
            ErrorCode::ReconnectExhausted => "reconnect_exhausted",
            ErrorCode::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::Io,
            Error::Protocol(_) | Error::InvalidCloseCode(_) => ErrorCode::Protocol,
            Error::Handshake(_) => ErrorCode::Handshake,
            Error::InvalidUtf8 => ErrorCode::InvalidPayload,
            Error::MessageTooLarge | Error::FrameTooLarge => ErrorCode::TooLarge,
            Error::WouldBlock
            | Error::ConnectionReset
            | Error::ConnectionClosed
            | Error::Transport(_) => ErrorCode::Transport,
            Error::InvalidState(_) => ErrorCode::InvalidState,
            Error::QueueFull => ErrorCode::QueueFull,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Envelope(_) => ErrorCode::Envelope,
            Error::Config(_) => ErrorCode::Config,
            Error::AlreadySubscribed(_) | Error::NotSubscribed(_) => ErrorCode::Subscription,
            Error::ReconnectExhausted(_) => ErrorCode::ReconnectExhausted,
            Error::Shutdown => ErrorCode::Shutdown,
        }
    }

    /// Close code to send to the peer when this error aborts the session
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge | Error::FrameTooLarge => CloseReason::TOO_BIG,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., client shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (never sent on the wire)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear in a close frame
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Error::Protocol("x").code(), ErrorCode::Protocol);
        assert_eq!(Error::Handshake("x").code().as_str(), "handshake");
        assert_eq!(Error::QueueFull.code().as_str(), "queue_full");
        assert_eq!(Error::Timeout("req-1".into()).code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_io_mapping() {
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(e, Error::ConnectionClosed));
        let e = Error::from(io::Error::new(io::ErrorKind::WouldBlock, "later"));
        assert!(matches!(e, Error::WouldBlock));
    }

    #[test]
    fn test_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(4000));
        assert!(!CloseReason::is_valid_code(1005));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(999));
        assert_eq!(Error::InvalidUtf8.close_code(), CloseReason::INVALID_PAYLOAD);
    }
}
