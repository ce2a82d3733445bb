//! Bounded in-memory channel between the submit path and the workers.
//!
//! Producers (source monitors, the disk-buffer recovery loop, DLQ
//! reprocessing) never block: pushes either succeed immediately, displace
//! the oldest entry, or report the queue full so the dispatcher can apply
//! its overflow policy. Consumers await new items without holding any lock
//! across the wait.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

/// Error returned by [`LimitedSender::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The receiver side is gone or the channel was closed.
    Closed(T),
}

#[derive(Debug)]
struct Inner<T> {
    data: ArrayQueue<T>,
    len: AtomicUsize,
    closed: AtomicBool,
    read_waker: Notify,
}

impl<T> Inner<T> {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.read_waker.notify_waiters();
    }
}

/// Cloneable producer handle.
#[derive(Debug)]
pub struct LimitedSender<T> {
    inner: Arc<Inner<T>>,
    sender_count: Arc<AtomicUsize>,
}

/// Consumer handle. One per queue shard; not cloneable.
#[derive(Debug)]
pub struct LimitedReceiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> LimitedSender<T> {
    /// Attempts to enqueue without blocking.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TrySendError::Closed(item));
        }
        match self.inner.data.push(item) {
            Ok(()) => {
                self.inner.len.fetch_add(1, Ordering::SeqCst);
                self.inner.read_waker.notify_one();
                Ok(())
            }
            Err(item) => Err(TrySendError::Full(item)),
        }
    }

    /// Enqueues, evicting the oldest entry when at capacity. Returns the
    /// displaced entry so the caller can account for the drop.
    pub fn force_send(&self, item: T) -> Result<Option<T>, TrySendError<T>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TrySendError::Closed(item));
        }
        let displaced = self.inner.data.force_push(item);
        if displaced.is_none() {
            self.inner.len.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.read_waker.notify_one();
        Ok(displaced)
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.data.capacity()
    }

    /// Closes the channel. Queued items remain readable; the receiver sees
    /// `None` once they are drained.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T> Clone for LimitedSender<T> {
    fn clone(&self) -> Self {
        self.sender_count.fetch_add(1, Ordering::SeqCst);
        LimitedSender {
            inner: Arc::clone(&self.inner),
            sender_count: Arc::clone(&self.sender_count),
        }
    }
}

impl<T> Drop for LimitedSender<T> {
    fn drop(&mut self) {
        // The last sender to drop closes the channel so readers don't hang.
        if self.sender_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.close();
        }
    }
}

impl<T> LimitedReceiver<T> {
    /// Pops the next item without waiting.
    pub fn try_recv(&self) -> Option<T> {
        let item = self.inner.data.pop();
        if item.is_some() {
            self.inner.len.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Waits for the next item. Returns `None` once the channel is closed
    /// and fully drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Register for a wakeup before re-checking the queue, otherwise
            // a push between the check and the await would be missed.
            let notified = self.inner.read_waker.notified();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                // One more look: a producer may have pushed right before
                // closing.
                return self.try_recv();
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

/// Creates a bounded channel holding at most `limit` items.
pub fn limited<T>(limit: usize) -> (LimitedSender<T>, LimitedReceiver<T>) {
    let inner = Arc::new(Inner {
        data: ArrayQueue::new(limit),
        len: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        read_waker: Notify::new(),
    });
    let sender = LimitedSender {
        inner: Arc::clone(&inner),
        sender_count: Arc::new(AtomicUsize::new(1)),
    };
    let receiver = LimitedReceiver { inner };
    (sender, receiver)
}
