//! Bounded handoff from the delivery worker to the application's `recv`.
//!
//! A classic bounded FIFO with two conditions: consumers block on not-empty,
//! the producer blocks on not-full. Closing marks end-of-stream: queued
//! actions drain first, then `pop` reports the closed error, and a blocked
//! producer gives up immediately.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::types::Action;
use crate::{GcsError, GcsResult};

#[derive(Debug)]
struct Inner {
    items: VecDeque<Action>,
    closed: bool,
}

/// The receive queue of one connection.
#[derive(Debug)]
pub struct RecvQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl RecvQueue {
    /// Creates a queue holding at most `capacity` actions.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends an action, blocking while the queue is full.
    pub fn push(&self, action: Action) -> GcsResult<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        while inner.items.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).expect("queue lock poisoned");
        }
        if inner.closed {
            return Err(GcsError::Closed);
        }
        inner.items.push_back(action);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest action, blocking while the queue is empty.
    ///
    /// After close, drains remaining actions and then reports
    /// [`GcsError::Closed`] (end-of-stream).
    pub fn pop(&self) -> GcsResult<Action> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        loop {
            if let Some(action) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Ok(action);
            }
            if inner.closed {
                return Err(GcsError::Closed);
            }
            inner = self.not_empty.wait(inner).expect("queue lock poisoned");
        }
    }

    /// Marks end-of-stream and wakes all blocked producers and consumers.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Current number of queued actions.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    /// Returns true if no actions are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionType, Seqno};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn action(local: i64) -> Action {
        Action {
            kind: ActionType::Ordered,
            buf: vec![local as u8],
            global_seqno: Seqno::new(local),
            local_seqno: Seqno::new(local),
            sender_idx: Some(0),
        }
    }

    #[test]
    fn fifo_order() {
        let queue = RecvQueue::new(8);
        queue.push(action(1)).unwrap();
        queue.push(action(2)).unwrap();

        assert_eq!(queue.pop().unwrap().local_seqno, Seqno::new(1));
        assert_eq!(queue.pop().unwrap().local_seqno, Seqno::new(2));
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(RecvQueue::new(4));
        let queue2 = Arc::clone(&queue);

        let handle = thread::spawn(move || queue2.pop().unwrap());
        thread::sleep(Duration::from_millis(10));
        queue.push(action(7)).unwrap();

        assert_eq!(handle.join().unwrap().local_seqno, Seqno::new(7));
    }

    #[test]
    fn push_blocks_at_capacity() {
        let queue = Arc::new(RecvQueue::new(1));
        queue.push(action(1)).unwrap();

        let queue2 = Arc::clone(&queue);
        let handle = thread::spawn(move || queue2.push(action(2)));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.len(), 1);

        queue.pop().unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap().local_seqno, Seqno::new(2));
    }

    #[test]
    fn close_drains_then_end_of_stream() {
        let queue = RecvQueue::new(4);
        queue.push(action(1)).unwrap();
        queue.close();

        assert_eq!(queue.pop().unwrap().local_seqno, Seqno::new(1));
        assert!(matches!(queue.pop(), Err(GcsError::Closed)));
        // End-of-stream is sticky.
        assert!(matches!(queue.pop(), Err(GcsError::Closed)));
    }

    #[test]
    fn close_unblocks_full_producer() {
        let queue = Arc::new(RecvQueue::new(1));
        queue.push(action(1)).unwrap();

        let queue2 = Arc::clone(&queue);
        let handle = thread::spawn(move || queue2.push(action(2)));
        thread::sleep(Duration::from_millis(10));
        queue.close();

        assert!(matches!(handle.join().unwrap(), Err(GcsError::Closed)));
    }

    #[test]
    fn close_unblocks_empty_consumer() {
        let queue = Arc::new(RecvQueue::new(1));
        let queue2 = Arc::clone(&queue);
        let handle = thread::spawn(move || queue2.pop());
        thread::sleep(Duration::from_millis(10));
        queue.close();

        assert!(matches!(handle.join().unwrap(), Err(GcsError::Closed)));
    }
}
