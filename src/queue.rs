//! A bounded FIFO queue with blocking push, used for the host-bound and
//! peripheral-bound queues.
//!
//! `std::sync::mpsc`'s bounded channel gives blocking-send backpressure but
//! exposes neither a length nor a way to drop everything currently queued,
//! both of which the hub's credit accounting and reset handling need. This
//! is a small `Mutex`/`Condvar` queue that provides exactly the operations
//! the spec calls for: bounded blocking push, blocking pop, `len`, `clear`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Free capacity right now (never negative).
    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Push an item, blocking the caller while the queue is full. This is
    /// the spec's "producer blocks" backpressure policy — no item is ever
    /// silently dropped for capacity reasons.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        while items.len() >= self.capacity {
            items = self.not_full.wait(items).expect("queue mutex poisoned");
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Pop the oldest item, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return item;
            }
            items = self.not_empty.wait(items).expect("queue mutex poisoned");
        }
    }

    /// Pop the oldest item, giving up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) =
                self.not_empty.wait_timeout(items, remaining).expect("queue mutex poisoned");
            items = guard;
            if result.timed_out() && items.is_empty() {
                return None;
            }
        }
    }

    /// Drop everything currently queued.
    pub fn clear(&self) {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        if items.is_empty() {
            return;
        }
        items.clear();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo_order() {
        let q = BoundedQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_is_full_and_free_capacity() {
        let q = BoundedQueue::new(2);
        assert_eq!(q.free_capacity(), 2);
        q.push("a");
        q.push("b");
        assert!(q.is_full());
        assert_eq!(q.free_capacity(), 0);
    }

    #[test]
    fn test_clear_unblocks_waiting_producer() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1);
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.push(2); // blocks until capacity frees up
        });
        thread::sleep(Duration::from_millis(20));
        q.clear();
        handle.join().expect("producer thread panicked");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_pop_timeout_returns_none_when_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        let start = Instant::now();
        let result = q.pop_timeout(Duration::from_millis(20));
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_timeout_returns_item_if_pushed_in_time() {
        let q = Arc::new(BoundedQueue::new(2));
        let q2 = Arc::clone(&q);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            q2.push(42);
        });
        let result = q.pop_timeout(Duration::from_millis(200));
        assert_eq!(result, Some(42));
    }
}
