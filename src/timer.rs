//! Timer service for per-connection deadlines.
//!
//! Each server instance owns one [`Scheduler`] and shares it with every
//! connection's timeout guard. Entries are one-shot and can be cancelled
//! through the returned [`TimerHandle`]. Cancellation is best effort: a task
//! that already started running is not interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Work run when a timer entry fires
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// A timer service accepting one-shot entries
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to a scheduled timer entry
#[derive(Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// Cancel the entry. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler backed by the tokio timer wheel
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling task.
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });

        TimerHandle {
            cancelled,
            abort: Some(join.abort_handle()),
        }
    }
}

#[cfg(test)]
pub(crate) use manual::ManualScheduler;
