//! Bounded FIFO queue between `publish` callers and a partition worker.
//!
//! [`BufferedQueue`] is the only backpressure mechanism in the publisher: when
//! a leader is slow or unreachable its queue fills up and producers suspend
//! in [`BufferedQueue::enqueue`] instead of buffering without limit.
//!
//! Closing a queue never discards what it holds. Consumers keep receiving the
//! buffered items and only observe the end of the queue once it is both
//! closed and empty.
//!
//! # Example
//!
//! ```rust
//! use mq_publisher::queue::BufferedQueue;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let queue = BufferedQueue::new(2);
//! queue.enqueue("a").await.unwrap();
//! queue.enqueue("b").await.unwrap();
//! queue.close();
//!
//! assert_eq!(queue.dequeue().await, Some("a"));
//! assert_eq!(queue.dequeue().await, Some("b"));
//! assert_eq!(queue.dequeue().await, None);
//! assert!(queue.enqueue("c").await.is_err());
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Notify;

/// Default number of records buffered per partition.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Returned by enqueue attempts on a closed queue, handing the item back.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue closed")
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO with async blocking enqueue/dequeue and close-and-drain.
pub struct BufferedQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BufferedQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Appends an item, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`QueueClosed`] if the queue is closed, either
    /// before the call or while it was waiting for space.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut item = item;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent dequeue or
            // close cannot slip between the check and the wait.
            notified.as_mut().enable();

            match self.try_enqueue(item) {
                Ok(()) => return Ok(()),
                Err(TryEnqueueError::Closed(rejected)) => return Err(QueueClosed(rejected)),
                Err(TryEnqueueError::Full(rejected)) => item = rejected,
            }

            notified.await;
        }
    }

    /// Appends an item without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryEnqueueError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(TryEnqueueError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and every buffered item has
    /// been handed out. Cancel safe: dropping the future never loses an item.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Closes the queue. Idempotent; wakes every waiter and keeps buffered items.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Takes every item still buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_waiters();
        }
        items
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for BufferedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Error returned by [`BufferedQueue::try_enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryEnqueueError<T> {
    Full(T),
    Closed(T),
}
