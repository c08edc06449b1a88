//! An awaitable FIFO queue.
//!
//! Backs the inbound message queue of a session: the reader task pushes,
//! while `receive()` callers and the dispatch loop pop. Closing the queue
//! lets consumers drain what is already buffered and then observe the end.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded multi-producer, multi-consumer FIFO with async pop.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    readable: Notify,
}

impl<T> Queue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), closed: false }),
            readable: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("queue lock poisoned")
    }

    /// Append `value`. Returns `false` (dropping the value) if the queue has
    /// been closed.
    pub fn push(&self, value: T) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.items.push_back(value);
        drop(inner);
        self.readable.notify_waiters();
        true
    }

    /// Remove and return the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Wait for an item.
    ///
    /// Returns `None` once the queue is closed and drained; items pushed
    /// before the close are still delivered in order.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register interest before checking, so a push or close between
            // the check and the await cannot be missed. `notify_waiters`
            // only reaches futures that are already enabled.
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Close the queue, waking every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// True if no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
