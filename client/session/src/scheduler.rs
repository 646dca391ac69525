//! Deferred single-shot execution for timed handshakes and connects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Handle to a scheduled action.
///
/// Dropping the handle does not cancel the action; call
/// [`ScheduledAction::cancel`] to suppress it.
#[derive(Debug)]
pub struct ScheduledAction {
    handle: JoinHandle<()>,
}

impl ScheduledAction {
    /// Cancel the action if it has not fired yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Cheap cloneable scheduler for deferred single-shot actions.
///
/// A scheduler may be shared across many sessions. A session shuts the
/// scheduler down on terminate only when it constructed the scheduler
/// itself; injected schedulers are left running.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a running scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, unless cancelled or shut down first.
    ///
    /// Returns `None` when the scheduler has already been shut down. Must be
    /// called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> Option<ScheduledAction>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            trace!("scheduler is shut down, dropping action");
            return None;
        }
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The shutdown flag may have been set while we slept.
            if !shutdown.load(Ordering::SeqCst) {
                action();
            }
        });
        Some(ScheduledAction { handle })
    }

    /// Stop accepting new actions and suppress any that have not fired.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether the scheduler has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
