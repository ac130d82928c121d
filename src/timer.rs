//! Timer service with stable handles
//!
//! One background thread fires every due timer. Timers live in a map keyed
//! by [`TimerId`]; pausing and resuming only toggle the `active` flag, so a
//! handle stays valid until [`Timers::destroy`] or a one-shot timer fires.
//!
//! Callbacks run on the timer thread with the timer lock released, so a
//! callback may create, pause or destroy timers (including its own).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Handle to a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Callback = Box<dyn FnMut() + Send>;

struct Entry {
    interval: Duration,
    repeat: bool,
    active: bool,
    next_fire: Instant,
    /// Taken while the callback runs
    callback: Option<Callback>,
}

#[derive(Default)]
struct State {
    timers: HashMap<TimerId, Entry>,
    next_id: u64,
    active: usize,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Timer service
pub struct Timers {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    /// Start the timer thread
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                running: true,
                ..State::default()
            }),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("layered-ws-timers".into())
            .spawn(move || run(&worker))
            .ok();
        if thread.is_none() {
            tracing::error!("failed to spawn timer thread");
        }
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Register a timer firing every `interval` (once if `repeat` is false)
    pub fn create<F>(&self, interval: Duration, repeat: bool, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.timers.insert(
            id,
            Entry {
                interval,
                repeat,
                active: true,
                next_fire: Instant::now() + interval,
                callback: Some(Box::new(callback)),
            },
        );
        state.active += 1;
        drop(state);
        self.shared.cond.notify_one();
        id
    }

    /// Stop firing without removing the timer
    pub fn pause(&self, id: TimerId) -> bool {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.timers.get_mut(&id) {
            Some(entry) if entry.active => {
                entry.active = false;
                state.active -= 1;
                true
            }
            _ => false,
        }
    }

    /// Resume a paused timer; the next fire is one interval from now
    pub fn resume(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        let resumed = match state.timers.get_mut(&id) {
            Some(entry) if !entry.active => {
                entry.active = true;
                entry.next_fire = Instant::now() + entry.interval;
                true
            }
            _ => false,
        };
        if resumed {
            state.active += 1;
            drop(state);
            self.shared.cond.notify_one();
        }
        resumed
    }

    /// Remove a timer
    pub fn destroy(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        match state.timers.remove(&id) {
            Some(entry) => {
                if entry.active {
                    state.active -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Whether `id` is registered and active
    pub fn is_active(&self, id: TimerId) -> bool {
        self.shared
            .state
            .lock()
            .timers
            .get(&id)
            .is_some_and(|e| e.active)
    }

    /// Number of active timers
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Stop the thread and drop every timer
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            // a callback dropping the last handle must not join its own thread
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        let mut state = self.shared.state.lock();
        state.timers.clear();
        state.active = 0;
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    while state.running {
        let now = Instant::now();
        let next = state
            .timers
            .values()
            .filter(|e| e.active && e.callback.is_some())
            .map(|e| e.next_fire)
            .min();

        match next {
            None => {
                shared.cond.wait(&mut state);
                continue;
            }
            Some(at) if at > now => {
                shared.cond.wait_until(&mut state, at);
                continue;
            }
            Some(_) => {}
        }

        let mut due = Vec::new();
        let mut finished = Vec::new();
        for (id, entry) in state.timers.iter_mut() {
            if !entry.active || entry.next_fire > now {
                continue;
            }
            let Some(callback) = entry.callback.take() else {
                continue;
            };
            if entry.repeat {
                entry.next_fire = now + entry.interval.max(Duration::from_millis(1));
            } else {
                finished.push(*id);
            }
            due.push((*id, callback));
        }
        for id in finished {
            if state.timers.remove(&id).is_some() {
                state.active -= 1;
            }
        }

        drop(state);
        for (_, callback) in due.iter_mut() {
            callback();
        }
        state = shared.state.lock();

        for (id, callback) in due {
            // destroyed timers drop their callback here
            if let Some(entry) = state.timers.get_mut(&id) {
                entry.callback = Some(callback);
            }
        }
    }
    debug!("timer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_one_shot_fires_once() {
        let timers = Timers::new();
        let (count, cb) = counter();
        let id = timers.create(Duration::from_millis(10), false, cb);
        assert_eq!(timers.active_count(), 1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
        assert!(!timers.destroy(id));
    }

    #[test]
    fn test_repeating_timer() {
        let timers = Timers::new();
        let (count, cb) = counter();
        timers.create(Duration::from_millis(5), true, cb);
        std::thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_pause_resume_keeps_entry() {
        let timers = Timers::new();
        let (count, cb) = counter();
        let id = timers.create(Duration::from_millis(5), true, cb);

        assert!(timers.pause(id));
        assert!(!timers.pause(id));
        assert_eq!(timers.active_count(), 0);
        std::thread::sleep(Duration::from_millis(20));
        let paused_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        assert!(timers.resume(id));
        assert_eq!(timers.active_count(), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) > paused_at);
    }

    #[test]
    fn test_destroy_decrements_once() {
        let timers = Timers::new();
        let a = timers.create(Duration::from_secs(60), true, || {});
        let b = timers.create(Duration::from_secs(60), true, || {});
        timers.pause(b);
        assert_eq!(timers.active_count(), 1);

        assert!(timers.destroy(a));
        assert!(!timers.destroy(a));
        assert_eq!(timers.active_count(), 0);
        assert!(timers.destroy(b));
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn test_callback_can_destroy_itself() {
        let timers = Arc::new(Timers::new());
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let (count, mut cb) = counter();
        let id = {
            let timers_ref = Arc::downgrade(&timers);
            let slot = slot.clone();
            timers.create(Duration::from_millis(20), true, move || {
                cb();
                if let (Some(t), Some(id)) = (timers_ref.upgrade(), *slot.lock()) {
                    t.destroy(id);
                }
            })
        };
        *slot.lock() = Some(id);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn test_shutdown_joins() {
        let timers = Timers::new();
        timers.create(Duration::from_millis(1), true, || {});
        timers.shutdown();
        timers.shutdown();
        assert_eq!(timers.active_count(), 0);
    }
}
