//! Unbounded FIFO queue with a broadcast terminal value.

use std::cell::RefCell;
use std::collections::VecDeque;

use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    terminal: Option<T>,
}

/// Async FIFO queue for a single-threaded runtime.
///
/// Ordinary values are consumed exactly once, in order. The terminal
/// value is different: once installed it wakes every waiter and every
/// later [`dequeue`](Self::dequeue) resolves to a clone of it — after
/// draining whatever ordinary values were still buffered ahead of it.
/// This is how a process exit reaches every observer while buffered
/// output chunks are still delivered first.
pub struct AsyncQueue<T> {
    inner: RefCell<Inner<T>>,
    notify: Notify,
}

impl<T: Clone> AsyncQueue<T> {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                items: VecDeque::new(),
                terminal: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a value, waking one waiter.
    pub fn enqueue(&self, item: T) {
        self.inner.borrow_mut().items.push_back(item);
        self.notify.notify_one();
    }

    /// Install the terminal value, waking every waiter.
    ///
    /// Buffered values are still delivered first; afterwards the queue
    /// yields the terminal value forever.
    pub fn enqueue_terminal(&self, item: T) {
        self.inner.borrow_mut().terminal = Some(item);
        self.notify.notify_waiters();
        // A waiter registered between buffer check and notify_waiters
        // would miss the wakeup; the stored permit covers it.
        self.notify.notify_one();
    }

    /// Remove and return the next value, waiting if none is available.
    pub async fn dequeue(&self) -> T {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.borrow_mut();
                if let Some(item) = inner.items.pop_front() {
                    return item;
                }
                if let Some(term) = &inner.terminal {
                    return term.clone();
                }
            }
            notified.await;
        }
    }

    /// Number of ordinary values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    /// Whether no ordinary values are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the terminal value has been installed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.borrow().terminal.is_some()
    }
}

impl<T: Clone> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
