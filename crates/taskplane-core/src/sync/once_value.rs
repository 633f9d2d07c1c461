//! Single-shot broadcast value cell.

use std::cell::RefCell;

use tokio::sync::Notify;

/// A cell that is set at most once and observed by everyone.
///
/// [`set`](Self::set) wakes every waiter with the value; any later
/// [`get`](Self::get) resolves immediately. The process engine stores the
/// exit status here so cancellation and progress can both await it
/// without consuming it.
pub struct OnceValue<T> {
    slot: RefCell<Option<T>>,
    notify: Notify,
}

impl<T: Clone> OnceValue<T> {
    /// Empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RefCell::new(None),
            notify: Notify::new(),
        }
    }

    /// Whether the value has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Non-blocking read.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Install the value, waking all waiters. A second set is ignored.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.slot.borrow_mut();
            if slot.is_some() {
                return;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Wait for the value.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.peek() {
                return v;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for OnceValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[tokio::test]
    async fn set_before_get_resolves_immediately() {
        let cell = OnceValue::new();
        cell.set(7u32);
        assert_eq!(cell.get().await, 7);
        assert_eq!(cell.peek(), Some(7));
    }

    #[tokio::test]
    async fn set_wakes_all_waiters() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let cell = Rc::new(OnceValue::new());
                let waiters: Vec<_> = (0..3)
                    .map(|_| {
                        let cell = cell.clone();
                        tokio::task::spawn_local(async move { cell.get().await })
                    })
                    .collect();
                tokio::task::yield_now().await;
                cell.set(99u32);
                for w in waiters {
                    assert_eq!(w.await.unwrap(), 99);
                }
            })
            .await;
    }

    #[tokio::test]
    async fn second_set_is_ignored() {
        let cell = OnceValue::new();
        cell.set(1u32);
        cell.set(2u32);
        assert_eq!(cell.get().await, 1);
    }
}
