//! Server side of the envelope protocol
//!
//! [`serve`] drives a server-role [`Connection`] over one transport stream
//! and answers every decoded [`Envelope`] through a [`Responder`].
//! [`serve_tcp`] accepts TCP connections and spawns one `serve` task each.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use layered_ws::Config;
//! use layered_ws::server::{EchoResponder, serve_tcp};
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9001").await?;
//! serve_tcp(listener, Config::default(), Arc::new(EchoResponder::new())).await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::Config;
use crate::connection::{Connection, ConnectionEvent, Message};
use crate::envelope::{Envelope, IdGenerator, kind, timestamp_ms};
use crate::error::{CloseReason, Result};
use crate::transport::io::IoTransport;
use crate::transport::{LoopWaker, Transport};

/// Maps an inbound envelope to the replies to send back
pub trait Responder: Send + Sync {
    fn respond(&self, envelope: &Envelope) -> Vec<Envelope>;
}

/// Reference responder
///
/// - `request` gets a `response` echoing `data` as `payload`
/// - `auth` succeeds when a username or token is present
/// - `subscribe` is acknowledged with `{topic, success: true}`
/// - `publish` comes back as a `notification` for the same topic
/// - `heartbeat` is answered with a heartbeat
pub struct EchoResponder {
    ids: IdGenerator,
}

impl EchoResponder {
    pub fn new() -> Self {
        Self {
            ids: IdGenerator::new("server"),
        }
    }

    fn reply(&self, kind: &str, data: serde_json::Value) -> Envelope {
        Envelope::new(kind, self.ids.next_id(), data)
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Responder for EchoResponder {
    fn respond(&self, envelope: &Envelope) -> Vec<Envelope> {
        let data = &envelope.data;
        let reply = match envelope.kind.as_str() {
            kind::REQUEST => self.reply(
                kind::RESPONSE,
                json!({
                    "request_id": envelope.id,
                    "success": true,
                    "payload": data,
                }),
            ),
            "auth" => {
                let known = data.get("username").is_some() || data.get("token").is_some();
                let body = if known {
                    json!({
                        "request_id": envelope.id,
                        "success": true,
                        "session_id": format!("session_{}", self.ids.next_id()),
                    })
                } else {
                    json!({
                        "request_id": envelope.id,
                        "success": false,
                        "error": "missing credentials",
                    })
                };
                self.reply(kind::RESPONSE, body)
            }
            kind::SUBSCRIBE => match envelope.data_str("topic") {
                Some(topic) => self.reply(kind::SUBSCRIBE, json!({"topic": topic, "success": true})),
                None => self.reply(kind::ERROR, json!({"code": 400, "message": "subscribe without topic"})),
            },
            kind::PUBLISH => match envelope.data_str("topic") {
                Some(topic) => self.reply(
                    kind::NOTIFICATION,
                    json!({
                        "topic": topic,
                        "content": data.get("content").cloned().unwrap_or_default(),
                        "timestamp": timestamp_ms(),
                    }),
                ),
                None => return Vec::new(),
            },
            kind::HEARTBEAT => self.reply(
                kind::HEARTBEAT,
                json!({"status": "ok", "timestamp": timestamp_ms()}),
            ),
            _ => return Vec::new(),
        };
        vec![reply.with_priority(envelope.priority)]
    }
}

/// Serve one stream until it closes
///
/// Returns the close reason, or the error that ended the connection.
pub async fn serve<T: Transport>(
    mut transport: T,
    config: &Config,
    responder: Arc<dyn Responder>,
) -> Result<Option<CloseReason>> {
    let waker = LoopWaker::new();
    transport.set_waker(waker.clone());
    let mut conn = Connection::server(transport, config);
    conn.start(Instant::now())?;
    let tick = config.tick_interval();

    loop {
        for event in conn.poll(Instant::now()) {
            match event {
                ConnectionEvent::Opened { protocol } => info!(?protocol, "client connected"),
                ConnectionEvent::Message(Message::Text(text)) => {
                    let replies = match Envelope::from_json(&text) {
                        Ok(envelope) => {
                            debug!(kind = %envelope.kind, id = %envelope.id, "envelope received");
                            responder.respond(&envelope)
                        }
                        Err(e) => {
                            debug!(error = %e, "undecodable envelope");
                            vec![Envelope::new(
                                kind::ERROR,
                                "",
                                json!({"code": 400, "message": "invalid envelope"}),
                            )]
                        }
                    };
                    for reply in replies {
                        if let Err(e) = conn.send_text(&reply.to_json()?) {
                            warn!(error = %e, "reply not sent");
                        }
                    }
                }
                ConnectionEvent::Message(message) => debug!(?message, "ignoring non-text message"),
                ConnectionEvent::Closed { reason, error } => {
                    info!(?reason, "client disconnected");
                    return match error {
                        Some(error) => Err(error),
                        None => Ok(reason),
                    };
                }
            }
        }

        tokio::select! {
            _ = waker.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

/// Accept TCP clients forever
pub async fn serve_tcp(listener: TcpListener, config: Config, responder: Arc<dyn Responder>) -> Result<()> {
    let config = Arc::new(config);
    loop {
        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let config = config.clone();
        let responder = responder.clone();
        tokio::spawn(async move {
            debug!(%addr, "accepted");
            match serve(IoTransport::server(stream), &config, responder).await {
                Ok(reason) => debug!(%addr, ?reason, "connection finished"),
                Err(e) => warn!(%addr, error = %e, "connection failed"),
            }
        });
    }
}
