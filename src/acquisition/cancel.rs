//! Cooperative cancellation token.
//!
//! The controller keeps the [`CancelHandle`]; the worker receives the
//! [`CancellationSignal`]. Dropping the handle counts as cancellation, so a
//! worker never outlives a controller that forgot to stop it.

use tokio::sync::watch;

/// Create a linked handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancellationSignal { rx })
}

/// Owner side of the token.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Repeated calls are harmless.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Worker side of the token.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// Whether cancellation was requested or the handle is gone.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&mut self) {
        // Err means the handle was dropped, which also cancels.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
