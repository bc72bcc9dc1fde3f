//! A cloneable handle for stopping the session from other tasks.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// Stops the turn in flight from outside the task driving the session,
/// e.g. a Ctrl-C listener.
#[derive(Clone)]
pub struct ChatHandle {
    cancel: Arc<Mutex<CancellationToken>>,
    is_running: Arc<AtomicBool>,
}

impl ChatHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install a fresh token for a new turn and return it.
    pub(crate) fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.is_running.store(true, Ordering::Release);
        token
    }

    pub(crate) fn mark_idle(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    /// Stop the turn in flight.
    ///
    /// The session observes the cancellation before any further transport
    /// event and finalizes whatever text was already received.
    pub fn stop(&self) {
        self.cancel.lock().cancel();
    }

    /// Whether a turn is currently in flight.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}
