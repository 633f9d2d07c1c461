//! Per-resource operation serialiser.

use tokio::sync::Mutex;

/// Serialises async operations on a shared resource.
///
/// At most one wrapped operation executes at a time; the rest queue in
/// arrival order and start when the head completes, whether it finished
/// with a value, an error, or was cancelled. The file-transfer engine
/// runs every slot operation through one of these so writes to a file
/// can never interleave.
///
/// The tokio mutex is acquired in FIFO order, which is exactly the
/// ordering contract the queue needs; the unit `()` payload makes it a
/// pure turnstile.
pub struct SenderFifo {
    turnstile: Mutex<()>,
}

impl SenderFifo {
    /// Empty FIFO.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turnstile: Mutex::new(()),
        }
    }

    /// Run `op` once every previously submitted operation has completed.
    pub async fn run<F>(&self, op: F) -> F::Output
    where
        F: std::future::Future,
    {
        let _head = self.turnstile.lock().await;
        op.await
    }
}

impl Default for SenderFifo {
    fn default() -> Self {
        Self::new()
    }
}
