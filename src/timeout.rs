//! Per-connection timeout guard.
//!
//! Every connection gets two one-shot timers at accept time:
//!
//! - **idle**: fires if no byte at all arrived within `max_idle_read` of
//!   connect. It is armed once and never re-armed per byte.
//! - **max wait**: fires if no complete query line arrived within
//!   `max_query_wait` of connect.
//!
//! The guard is a three-state latch (`Armed`, `Satisfied`, `TimedOut`)
//! held in a single atomic. Leaving `Armed` is a compare-and-swap, so
//! exactly one of {query arrival, idle timer, max-wait timer} wins. Timer
//! cancellation after a query arrives only frees resources; a timer that
//! fires anyway finds the latch already set and does nothing.

use crate::response::{CloseReason, Session};
use crate::timer::{Scheduler, TimerHandle};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Notice written when the idle timer closes a connection
pub const IDLE_TIMEOUT_NOTICE: &str = "Connection closed due to idle timeout";

/// Notice written when the max-wait timer closes a connection
pub const QUERY_TIMEOUT_NOTICE: &str = "Connection closed due to timeout";

/// Deadlines applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub max_query_wait: Duration,
    pub max_idle_read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            max_query_wait: Duration::from_millis(5000),
            max_idle_read: Duration::from_millis(1000),
        }
    }
}

/// Guard latch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuardState {
    /// Both timers pending, no query yet
    Armed = 0,
    /// A query line arrived; timers are inert
    Satisfied = 1,
    /// A timer fired first and closed the connection
    TimedOut = 2,
}

impl GuardState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GuardState::Armed,
            1 => GuardState::Satisfied,
            _ => GuardState::TimedOut,
        }
    }
}

#[derive(Debug)]
struct Latch {
    state: AtomicU8,
    data_seen: AtomicBool,
}

impl Latch {
    fn transition(&self, to: GuardState) -> Result<(), GuardState> {
        self.state
            .compare_exchange(
                GuardState::Armed as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(GuardState::from_u8)
    }
}

/// Timeout state machine for one connection
#[derive(Debug)]
pub struct TimeoutGuard {
    latch: Arc<Latch>,
    idle: TimerHandle,
    max_wait: TimerHandle,
}

impl TimeoutGuard {
    /// Arm both timers for a freshly accepted connection.
    pub fn arm(timeouts: Timeouts, scheduler: &dyn Scheduler, session: Session) -> Self {
        let latch = Arc::new(Latch {
            state: AtomicU8::new(GuardState::Armed as u8),
            data_seen: AtomicBool::new(false),
        });

        let max_wait = {
            let latch = Arc::clone(&latch);
            let session = session.clone();
            scheduler.schedule(
                timeouts.max_query_wait,
                Box::new(move || {
                    if latch.transition(GuardState::TimedOut).is_ok() {
                        session.write_and_close(QUERY_TIMEOUT_NOTICE, CloseReason::QueryTimeout);
                    }
                }),
            )
        };

        let idle = {
            let latch = Arc::clone(&latch);
            scheduler.schedule(
                timeouts.max_idle_read,
                Box::new(move || {
                    if latch.data_seen.load(Ordering::Acquire) {
                        return;
                    }
                    if latch.transition(GuardState::TimedOut).is_ok() {
                        session.write_and_close(IDLE_TIMEOUT_NOTICE, CloseReason::IdleTimeout);
                    }
                }),
            )
        };

        Self {
            latch,
            idle,
            max_wait,
        }
    }

    /// Record that bytes arrived, disarming the idle branch.
    pub fn data_received(&self) {
        self.latch.data_seen.store(true, Ordering::Release);
    }

    /// Record that a full query line arrived.
    ///
    /// Must be called before the query is parsed or looked up. Returns
    /// `false` if a timer already closed the connection.
    pub fn query_received(&self) -> bool {
        self.data_received();
        match self.latch.transition(GuardState::Satisfied) {
            Ok(()) => {
                self.cancel_timers();
                true
            }
            Err(GuardState::Satisfied) => true,
            Err(state) => {
                trace!(?state, "Query arrived after timeout");
                false
            }
        }
    }

    /// Current latch state, for tests
    #[cfg(test)]
    pub fn state(&self) -> GuardState {
        GuardState::from_u8(self.latch.state.load(Ordering::Acquire))
    }

    fn cancel_timers(&self) {
        self.idle.cancel();
        self.max_wait.cancel();
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Outbound;
    use crate::timer::{ManualScheduler, TimerTask};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn timeouts(wait_ms: u64, idle_ms: u64) -> Timeouts {
        Timeouts {
            max_query_wait: Duration::from_millis(wait_ms),
            max_idle_read: Duration::from_millis(idle_ms),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    /// Scheduler whose handles never reach the underlying entries.
    struct IgnoresCancel(ManualScheduler);

    impl Scheduler for IgnoresCancel {
        fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
            self.0.schedule(delay, task);
            TimerHandle::default()
        }
    }

    #[test]
    fn test_idle_fires_before_max_wait() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session);

        scheduler.advance(Duration::from_millis(1000));
        assert_eq!(guard.state(), GuardState::TimedOut);

        scheduler.advance(Duration::from_millis(10_000));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], IDLE_TIMEOUT_NOTICE.as_bytes());
        assert_eq!(frames[0].reason, CloseReason::IdleTimeout);
    }

    #[test]
    fn test_max_wait_fires_when_shorter() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(500, 1000), &scheduler, session);

        scheduler.advance(Duration::from_secs(2));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], QUERY_TIMEOUT_NOTICE.as_bytes());
        assert_eq!(guard.state(), GuardState::TimedOut);
    }

    #[test]
    fn test_partial_data_defers_to_max_wait() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session);

        guard.data_received();
        scheduler.advance(Duration::from_millis(1000));
        assert_eq!(guard.state(), GuardState::Armed);
        assert!(drain(&mut rx).is_empty());

        scheduler.advance(Duration::from_millis(4000));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].reason, CloseReason::QueryTimeout);
    }

    #[test]
    fn test_query_before_deadline_never_times_out() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session);

        scheduler.advance(Duration::from_millis(999));
        assert!(guard.query_received());
        assert_eq!(guard.state(), GuardState::Satisfied);
        assert_eq!(scheduler.pending(), 0);

        scheduler.advance(Duration::from_secs(60));
        assert!(drain(&mut rx).is_empty());
        assert!(guard.query_received());
    }

    #[test]
    fn test_latch_holds_when_cancel_is_lost() {
        let scheduler = IgnoresCancel(ManualScheduler::new());
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session);

        assert!(guard.query_received());
        assert_eq!(scheduler.0.pending(), 2);

        scheduler.0.advance(Duration::from_secs(60));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(guard.state(), GuardState::Satisfied);
    }

    #[test]
    fn test_query_after_timeout_is_rejected() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        let guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session);

        scheduler.advance(Duration::from_millis(1000));
        assert!(!guard.query_received());
        assert_eq!(guard.state(), GuardState::TimedOut);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_drop_cancels_timers() {
        let scheduler = ManualScheduler::new();
        let (session, mut rx) = Session::new();
        drop(TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session));

        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(Duration::from_secs(10));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_timer_after_finish_sends_nothing() {
        let scheduler = IgnoresCancel(ManualScheduler::new());
        let (session, mut rx) = Session::new();
        let _guard = TimeoutGuard::arm(timeouts(5000, 1000), &scheduler, session.clone());

        session.write_and_close("done", CloseReason::Finished);
        scheduler.0.advance(Duration::from_secs(10));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].reason, CloseReason::Finished);
    }
}
