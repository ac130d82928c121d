//! WebSocket connection state machine
//!
//! One [`Connection`] owns one transport stream for its whole life:
//!
//! ```text
//! Connecting --handshake ok--> Open --close sent/received--> Closing --> Closed
//!      \______________________________ handshake or protocol error ____/
//! ```
//!
//! The connection is driven by [`Connection::poll`], which flushes buffered
//! writes, completes the handshake, reads and dispatches frames, and checks
//! deadlines. Nothing blocks; every call returns the events produced so far.

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::Config;
use crate::error::{CloseReason, Error, ErrorCode, Result};
use crate::frame::{self, Frame, OpCode, Parsed};
use crate::handshake::{self, ClientHandshake};
use crate::mask::generate_mask;
use crate::transport::Transport;

/// Connection role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends masked frames, expects unmasked frames
    Client,
    /// Sends unmasked frames, expects masked frames
    Server,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the opening handshake to complete
    Connecting,
    /// Handshake verified, frames flow both ways
    Open,
    /// A close frame has been sent
    Closing,
    /// Terminal
    Closed,
}

/// A complete WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Bytes),
    /// Ping control frame
    Ping(Bytes),
    /// Pong control frame
    Pong(Bytes),
    /// Close frame from the peer
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(s.into())
    }

    /// Create a binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Get text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Output of [`Connection::poll`]
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake verified; the connection is open
    Opened { protocol: Option<String> },
    /// A complete message arrived
    Message(Message),
    /// The connection reached `Closed`
    ///
    /// `error` is set when the close was caused by a failure rather than a
    /// completed close handshake.
    Closed {
        reason: Option<CloseReason>,
        error: Option<Error>,
    },
}

/// Monotonic connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pings_received: u64,
}

/// One WebSocket session over one transport stream
pub struct Connection<T> {
    transport: T,
    role: Role,
    state: State,
    handshake: Option<ClientHandshake>,
    read_buf: BytesMut,
    /// Encoded frames the transport has not accepted yet
    write_buf: BytesMut,
    /// Finish the send side once `write_buf` drains
    fin_pending: bool,
    fin_sent: bool,
    fragment: Option<(OpCode, BytesMut)>,
    close_sent: bool,
    close_received: bool,
    close_reason: Option<CloseReason>,
    connect_deadline: Option<Instant>,
    closing_deadline: Option<Instant>,
    /// Latest `now` passed to `start` or `poll`
    clock: Instant,
    connect_timeout: Duration,
    close_timeout: Duration,
    max_frame_size: usize,
    max_message_size: usize,
    events: Vec<ConnectionEvent>,
    stats: ConnectionStats,
}

impl<T: Transport> Connection<T> {
    /// Client-side connection; call [`start`](Self::start) to send the upgrade
    pub fn client(transport: T, config: &Config) -> Self {
        let mut handshake = ClientHandshake::new(config.authority(), config.path.as_str())
            .user_agent(config.user_agent());
        if let Some(origin) = &config.origin {
            handshake = handshake.origin(origin.as_str());
        }
        Self::with_role(transport, Role::Client, Some(handshake), config)
    }

    /// Server-side connection; waits for the upgrade request
    pub fn server(transport: T, config: &Config) -> Self {
        Self::with_role(transport, Role::Server, None, config)
    }

    fn with_role(
        transport: T,
        role: Role,
        handshake: Option<ClientHandshake>,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            role,
            state: State::Connecting,
            handshake,
            read_buf: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
            write_buf: BytesMut::new(),
            fin_pending: false,
            fin_sent: false,
            fragment: None,
            close_sent: false,
            close_received: false,
            close_reason: None,
            connect_deadline: None,
            closing_deadline: None,
            clock: Instant::now(),
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            events: Vec::new(),
            stats: ConnectionStats::default(),
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Connection role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Counters
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport (e.g. to register a waker)
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Begin the handshake and arm the connect deadline
    ///
    /// Clients send their upgrade request here. A failure closes the
    /// connection and is also reported from the next `poll`.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != State::Connecting || self.connect_deadline.is_some() {
            return Err(Error::InvalidState("connection already started"));
        }
        self.clock = now;
        self.connect_deadline = Some(now + self.connect_timeout);

        if let Some(hs) = &self.handshake {
            let headers = hs.request_headers();
            debug!(headers = headers.len(), "sending upgrade request");
            if let Err(e) = self.transport.send_headers(&headers, false) {
                self.abort(Error::Transport(e.to_string()));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drive the connection and collect events
    pub fn poll(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        self.clock = self.clock.max(now);
        if self.state != State::Closed {
            self.drive(now);
        }
        std::mem::take(&mut self.events)
    }

    fn drive(&mut self, now: Instant) {
        if let Err(e) = self.flush() {
            self.abort(e);
            return;
        }

        if self.state == State::Connecting {
            match self.poll_handshake() {
                Ok(true) => {}
                Ok(false) => {
                    if self.connect_deadline.is_some_and(|d| now >= d) {
                        self.abort(Error::Timeout("opening handshake".into()));
                    }
                    return;
                }
                Err(e) => {
                    self.abort(e);
                    return;
                }
            }
        }

        if let Err(e) = self.read_frames() {
            self.fail(e);
            return;
        }

        if self.state == State::Closing && self.closing_deadline.is_some_and(|d| now >= d) {
            warn!("close handshake timed out");
            self.finish_closed(None);
            return;
        }

        if let Err(e) = self.flush() {
            self.abort(e);
        }
    }

    /// Returns `Ok(true)` once the connection is open
    fn poll_handshake(&mut self) -> Result<bool> {
        let Some(headers) = self.transport.recv_headers()? else {
            return Ok(false);
        };

        match self.role {
            Role::Client => {
                let hs = self
                    .handshake
                    .as_ref()
                    .ok_or(Error::InvalidState("missing client handshake"))?;
                let response = hs.verify_response(&headers)?;
                self.open(response.protocol);
            }
            Role::Server => match handshake::parse_request(&headers) {
                Ok(request) => {
                    let response =
                        handshake::build_response(&request.accept_key(), None);
                    self.transport.send_headers(&response, false)?;
                    debug!(path = %request.path, "accepted upgrade request");
                    self.open(None);
                }
                Err(e) => {
                    let _ = self
                        .transport
                        .send_headers(&handshake::build_rejection(400), true);
                    return Err(e);
                }
            },
        }
        Ok(true)
    }

    fn open(&mut self, protocol: Option<String>) {
        info!(role = ?self.role, "websocket open");
        self.state = State::Open;
        self.connect_deadline = None;
        self.events.push(ConnectionEvent::Opened { protocol });
    }

    fn read_frames(&mut self) -> Result<()> {
        loop {
            match self.transport.stream_recv(&mut self.read_buf) {
                Ok(0) => {
                    self.dispatch_buffered()?;
                    self.on_transport_closed();
                    return Ok(());
                }
                Ok(n) => self.stats.bytes_received += n as u64,
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        self.dispatch_buffered()
    }

    fn dispatch_buffered(&mut self) -> Result<()> {
        while matches!(self.state, State::Open | State::Closing) {
            match frame::parse_with_limit(&self.read_buf, self.max_frame_size)? {
                Parsed::Frame { frame, consumed } => {
                    self.read_buf.advance(consumed);
                    self.stats.frames_received += 1;
                    self.handle_frame(frame)?;
                }
                Parsed::NeedMoreData => break,
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match (self.role, frame.is_masked()) {
            (Role::Server, false) => return Err(Error::Protocol("client frames must be masked")),
            (Role::Client, true) => return Err(Error::Protocol("server frames must not be masked")),
            _ => {}
        }

        if self.close_received {
            // nothing may follow the peer's close
            return Ok(());
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(Error::Protocol("expected continuation frame"));
                }
                if frame.fin {
                    self.deliver(frame.opcode, frame.payload)?;
                } else {
                    if frame.payload.len() > self.max_message_size {
                        return Err(Error::MessageTooLarge);
                    }
                    self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                let (_, buf) = self
                    .fragment
                    .as_mut()
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;
                if buf.len() + frame.payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    if let Some((opcode, buf)) = self.fragment.take() {
                        self.deliver(opcode, buf.freeze())?;
                    }
                }
            }
            OpCode::Ping => {
                self.stats.pings_received += 1;
                if !self.close_sent {
                    self.queue_frame(OpCode::Pong, &frame.payload)?;
                }
                self.events.push(ConnectionEvent::Message(Message::Ping(frame.payload)));
            }
            OpCode::Pong => {
                self.events.push(ConnectionEvent::Message(Message::Pong(frame.payload)));
            }
            OpCode::Close => self.handle_close(&frame)?,
        }
        Ok(())
    }

    fn deliver(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let message = match opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidUtf8)?;
                Message::Text(text)
            }
            _ => Message::Binary(payload),
        };
        self.stats.messages_received += 1;
        self.events.push(ConnectionEvent::Message(message));
        Ok(())
    }

    fn handle_close(&mut self, frame: &Frame) -> Result<()> {
        let reason = frame.parse_close()?;
        self.close_received = true;
        self.events
            .push(ConnectionEvent::Message(Message::Close(reason.clone())));

        if self.close_sent {
            // our close was echoed
            debug!("close handshake complete");
            self.finish_closed(reason);
            return Ok(());
        }

        // echo exactly once, then wait for the transport to finish
        let echo = match &reason {
            Some(r) => Frame::close(r.code, ""),
            None => Frame::close_empty(),
        };
        self.queue_frame(OpCode::Close, &echo.payload)?;
        self.close_sent = true;
        self.fin_pending = true;
        self.close_reason = reason;
        self.state = State::Closing;
        self.closing_deadline = Some(self.clock + self.close_timeout);
        debug!(code = ?self.close_reason.as_ref().map(|r| r.code), "peer initiated close");
        Ok(())
    }

    /// Transport reported end of stream
    fn on_transport_closed(&mut self) {
        match self.state {
            State::Closed => {}
            State::Closing => {
                let reason = self.close_reason.take();
                self.finish_closed(reason);
            }
            State::Open | State::Connecting => {
                warn!("transport closed without close handshake");
                self.state = State::Closed;
                self.transport.close();
                self.events.push(ConnectionEvent::Closed {
                    reason: Some(CloseReason::new(CloseReason::ABNORMAL, "transport closed")),
                    error: Some(Error::ConnectionClosed),
                });
            }
        }
    }

    fn finish_closed(&mut self, reason: Option<CloseReason>) {
        let _ = self.flush();
        self.state = State::Closed;
        self.transport.close();
        self.events.push(ConnectionEvent::Closed {
            reason,
            error: None,
        });
    }

    /// Failure while open or closing: best-effort close frame, then `Closed`
    ///
    /// Only protocol-level failures are reported to the peer; a broken
    /// transport gets no close frame.
    fn fail(&mut self, error: Error) {
        let protocol_level = matches!(
            error.code(),
            ErrorCode::Protocol | ErrorCode::InvalidPayload | ErrorCode::TooLarge
        );
        let reason = if protocol_level {
            let code = error.close_code();
            if !self.close_sent {
                let close = Frame::close(code, "");
                if self.queue_frame(OpCode::Close, &close.payload).is_ok() {
                    self.close_sent = true;
                    self.fin_pending = true;
                    let _ = self.flush();
                }
            }
            CloseReason::new(code, error.to_string())
        } else {
            CloseReason::new(CloseReason::ABNORMAL, error.to_string())
        };

        warn!(error = %error, "connection failed");
        self.state = State::Closed;
        self.transport.close();
        self.events.push(ConnectionEvent::Closed {
            reason: Some(reason),
            error: Some(error),
        });
    }

    /// Handshake or transport failure: straight to `Closed`
    fn abort(&mut self, error: Error) {
        if self.state == State::Closed {
            return;
        }
        warn!(error = %error, state = ?self.state, "connection aborted");
        self.state = State::Closed;
        self.transport.close();
        self.events.push(ConnectionEvent::Closed {
            reason: None,
            error: Some(error),
        });
    }

    /// Send a message
    ///
    /// Data messages larger than the frame limit are split into fragments.
    pub fn send(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => self.send_data(OpCode::Text, text.as_bytes()),
            Message::Binary(data) => self.send_data(OpCode::Binary, &data),
            Message::Ping(data) => self.send_control(OpCode::Ping, &data),
            Message::Pong(data) => self.send_control(OpCode::Pong, &data),
            Message::Close(reason) => match reason {
                Some(r) => self.close(r.code, &r.reason),
                None => self.close(CloseReason::NORMAL, ""),
            },
        }
    }

    /// Send a text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_data(OpCode::Text, text.as_bytes())
    }

    /// Send a binary message
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_data(OpCode::Binary, data)
    }

    /// Send a ping
    pub fn ping(&mut self, data: &[u8]) -> Result<()> {
        self.send_control(OpCode::Ping, data)
    }

    fn send_data(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        if payload.len() <= self.max_frame_size {
            self.queue_frame(opcode, payload)?;
        } else {
            let mut chunks = payload.chunks(self.max_frame_size).peekable();
            let mut op = opcode;
            while let Some(chunk) = chunks.next() {
                self.queue_fragment(op, chunk, chunks.peek().is_none())?;
                op = OpCode::Continuation;
            }
        }
        self.stats.messages_sent += 1;
        self.flush()
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.queue_frame(opcode, payload)?;
        self.flush()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Connecting => Err(Error::InvalidState("connection not open yet")),
            State::Closing | State::Closed => Err(Error::ConnectionClosed),
        }
    }

    /// Start the closing handshake
    ///
    /// Idempotent once a close frame has been sent. Closing a connection
    /// that never opened goes straight to `Closed`.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        match self.state {
            State::Open => {
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let frame = Frame::close(code, reason);
                self.queue_frame(OpCode::Close, &frame.payload)?;
                self.close_sent = true;
                self.state = State::Closing;
                self.closing_deadline = Some(self.clock + self.close_timeout);
                self.close_reason = Some(CloseReason::new(code, reason));
                debug!(code, "close sent");
                self.flush()
            }
            State::Connecting => {
                self.state = State::Closed;
                self.transport.close();
                self.events.push(ConnectionEvent::Closed {
                    reason: Some(CloseReason::new(code, reason)),
                    error: None,
                });
                Ok(())
            }
            State::Closing | State::Closed => Ok(()),
        }
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.queue_fragment(opcode, payload, true)
    }

    fn queue_fragment(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let mask = match self.role {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        };
        let before = self.write_buf.len();
        frame::encode_into(&mut self.write_buf, opcode, payload, mask, fin)?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += (self.write_buf.len() - before) as u64;
        Ok(())
    }

    /// Push buffered bytes into the transport
    ///
    /// Bytes the transport cannot take stay buffered for the next poll.
    pub fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let fin = self.fin_pending;
            match self.transport.stream_send(&self.write_buf, fin) {
                Ok(n) => {
                    self.write_buf.advance(n);
                    if n == 0 {
                        break;
                    }
                    if fin && self.write_buf.is_empty() {
                        self.fin_sent = true;
                    }
                }
                Err(Error::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if self.fin_pending && !self.fin_sent && self.write_buf.is_empty() {
            match self.transport.stream_send(&[], true) {
                Ok(_) => self.fin_sent = true,
                Err(Error::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes waiting for the transport
    pub fn buffered(&self) -> usize {
        self.write_buf.len()
    }
}
