//! Priority pub/sub event bus with timers
//!
//! Producers publish typed payloads under an [`EventKind`]; listeners
//! subscribed to that kind are invoked in registration order.
//!
//! - **Owned payloads**: [`EventBus::publish`] clones the payload, so the
//!   producer's value can be dropped or reused as soon as the call returns.
//!   The clone is dropped after every listener has seen it.
//! - **Priority dispatch**: with priority mode on, every queued
//!   higher-priority event is dispatched before any lower one (strict, so
//!   sustained urgent traffic can starve low-priority events).
//! - **Two execution modes**: `worker_threads > 0` starts workers that
//!   block on the queue; `worker_threads == 0` leaves dispatch to the owner,
//!   which calls [`EventBus::process_all`] from its loop after being woken
//!   through the registered [`LoopWaker`].
//!
//! With several workers only per-worker ordering holds.
//!
//! # Example
//!
//! ```
//! use layered_ws::event::{EventBus, EventBusConfig, EventKind};
//! use layered_ws::envelope::Priority;
//!
//! let bus = EventBus::new(EventBusConfig { worker_threads: 0, ..Default::default() });
//! bus.subscribe(EventKind::Custom(7), |event| {
//!     assert_eq!(event.payload::<String>().map(String::as_str), Some("hello"));
//! });
//! let text = String::from("hello");
//! bus.publish(EventKind::Custom(7), Priority::Normal, &text).unwrap();
//! drop(text);
//! assert_eq!(bus.process_all(), 1);
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::envelope::{Priority, timestamp_ms};
use crate::error::{Error, Result};
use crate::queue::{BoundedQueue, Prioritized, PushError, QueueOrdering};
use crate::timer::{TimerId, Timers};
use crate::transport::LoopWaker;

/// Event category listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// Connection lifecycle
    Connection,
    /// Raw inbound messages
    Message,
    /// Session layer output for the application
    Session,
    /// Timer ticks
    Timer,
    /// Application-defined
    Custom(u16),
}

/// A published event
pub struct Event {
    pub kind: EventKind,
    pub priority: Priority,
    /// Milliseconds since the Unix epoch at publish time
    pub timestamp: u64,
    pub id: u64,
    payload: Box<dyn Any + Send + Sync>,
}

impl Event {
    /// Borrow the payload as `T`
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Prioritized for Event {
    #[inline]
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Stable handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;
type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    handler: Handler,
}

/// Event bus settings
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Dispatch threads; 0 means the owner drives dispatch
    pub worker_threads: usize,
    /// Queue capacity; publishes beyond it are dropped
    pub queue_size: usize,
    /// Priority-ordered dispatch
    pub priority: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            queue_size: 1000,
            priority: true,
        }
    }
}

impl From<&crate::Config> for EventBusConfig {
    fn from(config: &crate::Config) -> Self {
        Self {
            worker_threads: config.worker_threads,
            queue_size: config.event_queue_size,
            priority: config.enable_priority_queue,
        }
    }
}

/// Bus counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub queue_size: usize,
    pub max_queue_size_reached: usize,
    pub active_listeners: usize,
    pub active_timers: usize,
    /// Moving average of per-event dispatch time in microseconds
    pub avg_processing_time_us: f64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    avg_processing_us: Mutex<f64>,
}

struct Shared {
    queue: BoundedQueue<Event>,
    listeners: RwLock<Vec<Listener>>,
    filter: RwLock<Option<Filter>>,
    waker: RwLock<Option<LoopWaker>>,
    next_event: AtomicU64,
    next_listener: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn dispatch(&self, event: Event) {
        let started = Instant::now();
        // snapshot so handlers may subscribe/unsubscribe re-entrantly
        let handlers: Vec<Handler> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind == event.kind)
            .map(|l| l.handler.clone())
            .collect();

        for handler in &handlers {
            handler(&event);
        }
        drop(event);

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed().as_secs_f64() * 1_000_000.0;
        let mut avg = self.counters.avg_processing_us.lock();
        *avg = if *avg == 0.0 { elapsed } else { *avg * 0.9 + elapsed * 0.1 };
    }
}

/// Priority pub/sub bus
pub struct EventBus {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timers: Timers,
    worker_threads: usize,
}

impl EventBus {
    /// Create the bus and start its workers
    pub fn new(config: EventBusConfig) -> Self {
        let ordering = if config.priority {
            QueueOrdering::Priority
        } else {
            QueueOrdering::Fifo
        };
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.queue_size, ordering),
            listeners: RwLock::new(Vec::new()),
            filter: RwLock::new(None),
            waker: RwLock::new(None),
            next_event: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            counters: Counters::default(),
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads {
            let shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("layered-ws-events-{i}"))
                .spawn(move || {
                    while let Some(event) = shared.queue.pop() {
                        shared.dispatch(event);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, worker = i, "failed to spawn event worker"),
            }
        }

        Self {
            shared,
            workers: Mutex::new(workers),
            timers: Timers::new(),
            worker_threads: config.worker_threads,
        }
    }

    /// Whether dispatch is driven by the owner's loop
    pub fn is_loop_driven(&self) -> bool {
        self.worker_threads == 0
    }

    /// Register the loop waker notified on every publish
    pub fn set_loop_waker(&self, waker: LoopWaker) {
        *self.shared.waker.write() = Some(waker);
    }

    /// Publish a copy of `payload`
    pub fn publish<T>(&self, kind: EventKind, priority: Priority, payload: &T) -> Result<u64>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.publish_owned(kind, priority, payload.clone())
    }

    /// Publish an owned payload
    ///
    /// Fails with [`Error::QueueFull`] when the queue is at capacity; the
    /// event is dropped and counted.
    pub fn publish_owned<T>(&self, kind: EventKind, priority: Priority, payload: T) -> Result<u64>
    where
        T: Send + Sync + 'static,
    {
        let id = self.shared.next_event.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            kind,
            priority,
            timestamp: timestamp_ms(),
            id,
            payload: Box::new(payload),
        };

        let filter = self.shared.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(&event) {
                self.shared.counters.filtered.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }

        match self.shared.queue.try_push(event) {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                if let Some(waker) = self.shared.waker.read().as_ref() {
                    waker.wake();
                }
                Ok(id)
            }
            Err(PushError::Full(event)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = ?event.kind, "event queue full, dropping event");
                Err(Error::QueueFull)
            }
            Err(PushError::Closed(_)) => Err(Error::Shutdown),
        }
    }

    /// Publish at [`Priority::Urgent`]
    pub fn publish_urgent<T>(&self, kind: EventKind, payload: &T) -> Result<u64>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.publish(kind, Priority::Urgent, payload)
    }

    /// Add a listener for `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a listener; returns false if it was not registered for `kind`
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !(l.id == id && l.kind == kind));
        listeners.len() != before
    }

    /// Install a publish-time filter; events it rejects are never queued
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        *self.shared.filter.write() = Some(Arc::new(filter));
    }

    /// Remove the publish filter
    pub fn remove_filter(&self) {
        *self.shared.filter.write() = None;
    }

    /// Dispatch one queued event on the calling thread
    pub fn process_once(&self) -> bool {
        match self.shared.queue.try_pop() {
            Some(event) => {
                self.shared.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch every queued event on the calling thread
    pub fn process_all(&self) -> usize {
        let mut n = 0;
        while self.process_once() {
            n += 1;
        }
        n
    }

    /// Register a timer; see [`Timers::create`]
    pub fn create_timer<F>(&self, interval: Duration, repeat: bool, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.create(interval, repeat, callback)
    }

    /// Register a timer that publishes a [`EventKind::Timer`] event carrying its id
    pub fn create_timer_event(self: &Arc<Self>, interval: Duration, repeat: bool) -> TimerId {
        let bus = Arc::downgrade(self);
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let id_slot = slot.clone();
        let id = self.timers.create(interval, repeat, move || {
            let (Some(bus), Some(id)) = (bus.upgrade(), *id_slot.lock()) else {
                return;
            };
            let _ = bus.publish(EventKind::Timer, Priority::Normal, &id);
        });
        *slot.lock() = Some(id);
        id
    }

    /// Stop a timer from firing without removing it
    pub fn pause_timer(&self, id: TimerId) -> bool {
        self.timers.pause(id)
    }

    /// Re-arm a paused timer
    pub fn resume_timer(&self, id: TimerId) -> bool {
        self.timers.resume(id)
    }

    /// Remove a timer; `false` if the id is unknown
    pub fn destroy_timer(&self, id: TimerId) -> bool {
        self.timers.destroy(id)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> EventStats {
        let c = &self.shared.counters;
        EventStats {
            events_published: c.published.load(Ordering::Relaxed),
            events_processed: c.processed.load(Ordering::Relaxed),
            events_dropped: c.dropped.load(Ordering::Relaxed),
            events_filtered: c.filtered.load(Ordering::Relaxed),
            queue_size: self.shared.queue.len(),
            max_queue_size_reached: self.shared.queue.high_water(),
            active_listeners: self.shared.listeners.read().len(),
            active_timers: self.timers.active_count(),
            avg_processing_time_us: *c.avg_processing_us.lock(),
        }
    }

    /// Stop workers and timers
    ///
    /// Closes the queue (waking every blocked worker), then joins the
    /// workers before the timers and queued events are released.
    pub fn shutdown(&self) {
        self.shared.queue.close();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        self.timers.shutdown();
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            debug!(dropped, "discarded queued events at shutdown");
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
