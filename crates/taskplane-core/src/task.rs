//! Per-connection request task group.
//!
//! Every inbound frame is handled on its own local task so a handler
//! that suspends (child I/O, transfer FIFO, progress wait) never blocks
//! the read loop. `TaskSlots` owns those tasks: it hands out the shared
//! stop token, reaps finished handlers, and drains everything on
//! shutdown.

use std::cell::RefCell;
use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Group of request-handler tasks tied to one connection.
///
/// Must be used from within a `LocalSet`; handlers are `!Send`.
pub struct TaskSlots {
    set: RefCell<JoinSet<()>>,
    cancel: CancellationToken,
}

impl TaskSlots {
    /// Empty group with a fresh stop token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            set: RefCell::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The stop token handlers should observe at suspension points.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn one handler task onto the current `LocalSet`.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.set.borrow_mut().spawn_local(task);
    }

    /// Collect handlers that have already finished.
    ///
    /// Called once per dispatch iteration, the way the original drained
    /// its finished-slot list on every tick.
    pub fn reap(&self) {
        let mut set = self.set.borrow_mut();
        while let Some(result) = set.try_join_next() {
            if let Err(err) = result {
                warn!("request task failed: {err}");
            }
        }
    }

    /// Number of handlers still running or unreaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.borrow().len()
    }

    /// Whether no handlers are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request stop and wait for every handler to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut set = self.set.take();
        while let Some(result) = set.join_next().await {
            if let Err(err) = result {
                warn!("request task failed during shutdown: {err}");
            }
        }
    }
}

impl Default for TaskSlots {
    fn default() -> Self {
        Self::new()
    }
}
