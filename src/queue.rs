//! Bounded blocking queue shared by the message and event workers
//!
//! - Capacity is fixed; [`BoundedQueue::try_push`] fails immediately when full
//!   instead of blocking the producer
//! - [`QueueOrdering::Priority`] keeps items sorted by priority (highest
//!   first, FIFO within a tier) so a consumer always drains every queued
//!   higher-priority item before a lower one
//! - [`BoundedQueue::close`] flips the running flag and wakes every blocked
//!   consumer; closed queues reject pushes and pops return `None`

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::envelope::Priority;

/// Items that carry a dispatch priority
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

/// Queue ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrdering {
    /// Strict arrival order
    Fifo,
    /// Highest priority first, arrival order within a priority
    Priority,
}

/// Rejected push; the item is handed back
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Queue at capacity
    Full(T),
    /// Queue closed
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    running: bool,
    high_water: usize,
}

/// Mutex + condvar guarded bounded queue
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    capacity: usize,
    ordering: QueueOrdering,
}

impl<T: Prioritized> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize, ordering: QueueOrdering) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                running: true,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            capacity,
            ordering,
        }
    }

    /// Enqueue without blocking and wake one consumer
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(PushError::Closed(item));
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }

        match self.ordering {
            QueueOrdering::Fifo => inner.items.push_back(item),
            QueueOrdering::Priority => {
                let p = item.priority();
                let pos = inner
                    .items
                    .iter()
                    .position(|queued| queued.priority() < p)
                    .unwrap_or(inner.items.len());
                inner.items.insert(pos, item);
            }
        }
        inner.high_water = inner.high_water.max(inner.items.len());
        drop(inner);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while empty
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.running {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Dequeue without blocking
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return None;
        }
        inner.items.pop_front()
    }

    /// Stop the queue and wake every blocked consumer
    pub fn close(&self) {
        self.inner.lock().running = false;
        self.not_empty.notify_all();
    }

    /// Drop every queued item, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        n
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest length observed
    pub fn high_water(&self) -> usize {
        self.inner.lock().high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    struct Item(u32, Priority);

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.1
        }
    }

    #[test]
    fn test_full_rejects_immediately() {
        let q = BoundedQueue::new(2, QueueOrdering::Fifo);
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 2);
        q.try_push(Item(1, Priority::Normal)).unwrap();
        q.try_push(Item(2, Priority::Normal)).unwrap();
        let err = q.try_push(Item(3, Priority::Urgent)).unwrap_err();
        assert_eq!(err, PushError::Full(Item(3, Priority::Urgent)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.high_water(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(8, QueueOrdering::Fifo);
        q.try_push(Item(1, Priority::Low)).unwrap();
        q.try_push(Item(2, Priority::Urgent)).unwrap();
        assert_eq!(q.try_pop(), Some(Item(1, Priority::Low)));
        assert_eq!(q.try_pop(), Some(Item(2, Priority::Urgent)));
    }

    #[test]
    fn test_priority_order_stable_within_tier() {
        let q = BoundedQueue::new(8, QueueOrdering::Priority);
        q.try_push(Item(1, Priority::Low)).unwrap();
        q.try_push(Item(2, Priority::Normal)).unwrap();
        q.try_push(Item(3, Priority::Urgent)).unwrap();
        q.try_push(Item(4, Priority::Normal)).unwrap();
        q.try_push(Item(5, Priority::Urgent)).unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| q.try_pop()).map(|i| i.0).collect();
        assert_eq!(order, vec![3, 5, 2, 4, 1]);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let q = Arc::new(BoundedQueue::<Item>::new(4, QueueOrdering::Fifo));
        let worker = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(worker.join().unwrap(), None);
        assert!(matches!(
            q.try_push(Item(1, Priority::Low)),
            Err(PushError::Closed(_))
        ));
    }

    #[test]
    fn test_blocking_handoff() {
        let q = Arc::new(BoundedQueue::new(4, QueueOrdering::Fifo));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || (0..3).filter_map(|_| q.pop()).map(|i: Item| i.0).collect::<Vec<_>>())
        };
        for i in 0..3 {
            while q.try_push(Item(i, Priority::Normal)).is_err() {
                thread::yield_now();
            }
        }
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }
}
