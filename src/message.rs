//! Outbound message queue and request/response correlation
//!
//! [`MessageHandler::send`] never blocks: envelopes go into a bounded queue
//! and a single worker thread serializes them and hands the text to the
//! connection through a [`FrameSink`]. A full queue rejects the envelope
//! and reports [`MessageEvent::QueueFull`].
//!
//! Requests register a pending record before they are queued. The inbound
//! response and the timeout timer race to resolve it; a compare-and-set on
//! the record's `completed` flag lets exactly one of them win, so every
//! request yields one [`MessageEvent::Response`] or one
//! [`MessageEvent::Timeout`], never both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use crate::Config;
use crate::envelope::{Envelope, IdGenerator, Priority, kind};
use crate::error::{Error, Result};
use crate::queue::{BoundedQueue, Prioritized, PushError, QueueOrdering};
use crate::timer::{TimerId, Timers};

impl Prioritized for Envelope {
    #[inline]
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Where the worker writes serialized envelopes
pub trait FrameSink: Send + Sync {
    /// Send one text message
    fn send_text(&self, text: &str) -> Result<()>;
}

/// Output of the message layer
#[derive(Debug)]
pub enum MessageEvent {
    /// A non-response envelope arrived
    Received(Envelope),
    /// The worker handed an envelope to the connection
    Sent { id: String },
    /// A pending request was answered
    Response {
        request_id: String,
        envelope: Envelope,
        elapsed: Duration,
    },
    /// A pending request expired
    Timeout { request_id: String },
    /// Sending or decoding failed; `id` names the envelope when known
    Error { id: Option<String>, error: Error },
    /// The queue rejected an envelope
    QueueFull(Envelope),
}

/// Message layer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_timeout: u64,
    pub messages_error: u64,
    pub queue_size: usize,
    pub max_queue_size_reached: usize,
    pub pending_requests: usize,
    /// Moving average request round trip in milliseconds
    pub avg_response_time_ms: f64,
}

struct PendingRequest {
    completed: AtomicBool,
    timer: Mutex<Option<TimerId>>,
    sent_at: Instant,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    timeout: AtomicU64,
    error: AtomicU64,
    avg_response_ms: Mutex<f64>,
}

struct Shared {
    queue: BoundedQueue<Envelope>,
    pending: Mutex<HashMap<String, Arc<PendingRequest>>>,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    events: UnboundedSender<MessageEvent>,
    counters: Counters,
}

impl Shared {
    fn emit(&self, event: MessageEvent) {
        // receiver gone means the owner is shutting down
        let _ = self.events.send(event);
    }

    /// Claim a pending request; only the first caller gets it
    fn resolve(&self, id: &str) -> Option<Arc<PendingRequest>> {
        let record = self.pending.lock().get(id).cloned()?;
        if record
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.pending.lock().remove(id);
        Some(record)
    }

    fn deliver(&self, envelope: Envelope) {
        let id = envelope.id.clone();
        let result = envelope.to_json().and_then(|text| {
            let sink = self.sink.read().clone();
            match sink {
                Some(sink) => sink.send_text(&text),
                None => Err(Error::ConnectionClosed),
            }
        });
        match result {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!(%id, kind = %envelope.kind, "message sent");
                self.emit(MessageEvent::Sent { id });
            }
            Err(error) => {
                self.counters.error.fetch_add(1, Ordering::Relaxed);
                debug!(%id, %error, "message send failed");
                self.emit(MessageEvent::Error { id: Some(id), error });
            }
        }
    }

    fn record_rtt(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.counters.avg_response_ms.lock();
        *avg = if *avg == 0.0 { ms } else { *avg * 0.9 + ms * 0.1 };
    }
}

/// Queue, worker and pending-request table
pub struct MessageHandler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timers: Timers,
    ids: IdGenerator,
    default_timeout: Duration,
}

impl MessageHandler {
    /// Create the handler and start its worker
    pub fn new(config: &Config, events: UnboundedSender<MessageEvent>) -> Self {
        let ordering = if config.enable_priority_queue {
            QueueOrdering::Priority
        } else {
            QueueOrdering::Fifo
        };
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.message_queue_size, ordering),
            pending: Mutex::new(HashMap::new()),
            sink: RwLock::new(None),
            events,
            counters: Counters::default(),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("layered-ws-messages".into())
                .spawn(move || {
                    while let Some(envelope) = shared.queue.pop() {
                        shared.deliver(envelope);
                    }
                    debug!("message worker stopped");
                })
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn message worker");
                None
            }
        };

        Self {
            shared,
            worker: Mutex::new(worker),
            timers: Timers::new(),
            ids: IdGenerator::new(config.client_id.clone()),
            default_timeout: config.response_timeout(),
        }
    }

    /// Attach (or detach) the connection the worker writes to
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        *self.shared.sink.write() = sink;
    }

    /// Next envelope id
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Queue an envelope
    ///
    /// Fails with [`Error::QueueFull`] when the queue is at capacity; a
    /// [`MessageEvent::QueueFull`] carrying the envelope is emitted as well.
    pub fn send(&self, envelope: Envelope) -> Result<String> {
        let id = envelope.id.clone();
        match self.shared.queue.try_push(envelope) {
            Ok(()) => Ok(id),
            Err(PushError::Full(envelope)) => {
                warn!(%id, "message queue full");
                self.shared.emit(MessageEvent::QueueFull(envelope));
                Err(Error::QueueFull)
            }
            Err(PushError::Closed(_)) => Err(Error::Shutdown),
        }
    }

    /// Build and queue an envelope with a fresh id
    pub fn send_message(&self, kind: &str, data: Value, priority: Priority) -> Result<String> {
        let envelope = Envelope::new(kind, self.next_id(), data).with_priority(priority);
        self.send(envelope)
    }

    /// Queue a fire-and-forget envelope
    pub fn send_notification(&self, kind: &str, data: Value) -> Result<String> {
        self.send_message(kind, data, Priority::Normal)
    }

    /// Queue a request and wait for its response or timeout
    ///
    /// `timeout` of `None` uses the configured response timeout. The
    /// outcome arrives as a [`MessageEvent::Response`] or
    /// [`MessageEvent::Timeout`] carrying the returned id.
    pub fn send_request(&self, kind: &str, data: Value, timeout: Option<Duration>) -> Result<String> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let id = self.next_id();
        let record = Arc::new(PendingRequest {
            completed: AtomicBool::new(false),
            timer: Mutex::new(None),
            sent_at: Instant::now(),
        });
        self.shared.pending.lock().insert(id.clone(), record.clone());

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let request_id = id.clone();
        let timer = self.timers.create(timeout, false, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.resolve(&request_id).is_some() {
                shared.counters.timeout.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request_id, "request timed out");
                shared.emit(MessageEvent::Timeout {
                    request_id: request_id.clone(),
                });
            }
        });
        *record.timer.lock() = Some(timer);

        let envelope = Envelope::new(kind, id.clone(), data);
        if let Err(e) = self.send(envelope) {
            self.cancel_request(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Queue a response to `request_id`
    pub fn send_response(&self, request_id: &str, success: bool, payload: Value) -> Result<String> {
        self.send_notification(
            kind::RESPONSE,
            json!({
                "request_id": request_id,
                "success": success,
                "payload": payload,
            }),
        )
    }

    /// Drop a pending request without emitting an event
    pub fn cancel_request(&self, id: &str) -> bool {
        match self.shared.resolve(id) {
            Some(record) => {
                if let Some(timer) = record.timer.lock().take() {
                    self.timers.destroy(timer);
                }
                true
            }
            None => false,
        }
    }

    /// Handle one inbound text message
    pub fn on_text(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.shared.counters.error.fetch_add(1, Ordering::Relaxed);
                debug!(%error, "undecodable message");
                self.shared.emit(MessageEvent::Error { id: None, error });
                return;
            }
        };
        self.shared.counters.received.fetch_add(1, Ordering::Relaxed);

        if !envelope.is(kind::RESPONSE) {
            self.shared.emit(MessageEvent::Received(envelope));
            return;
        }

        let request_id = envelope
            .correlation_id()
            .unwrap_or(envelope.id.as_str())
            .to_string();
        let Some(record) = self.shared.resolve(&request_id) else {
            debug!(%request_id, "dropping unmatched response");
            return;
        };
        if let Some(timer) = record.timer.lock().take() {
            self.timers.destroy(timer);
        }
        let elapsed = record.sent_at.elapsed();
        self.shared.record_rtt(elapsed);
        self.shared.emit(MessageEvent::Response {
            request_id,
            envelope,
            elapsed,
        });
    }

    /// Number of unresolved requests
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MessageStats {
        let c = &self.shared.counters;
        MessageStats {
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_timeout: c.timeout.load(Ordering::Relaxed),
            messages_error: c.error.load(Ordering::Relaxed),
            queue_size: self.shared.queue.len(),
            max_queue_size_reached: self.shared.queue.high_water(),
            pending_requests: self.pending_requests(),
            avg_response_time_ms: *c.avg_response_ms.lock(),
        }
    }

    /// Stop the worker and drop pending requests
    pub fn shutdown(&self) {
        self.shared.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.timers.shutdown();
        let pending: Vec<_> = self.shared.pending.lock().drain().collect();
        for (_, record) in pending {
            record.completed.store(true, Ordering::Release);
        }
        self.shared.queue.clear();
        *self.shared.sink.write() = None;
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
