// SPDX-License-Identifier: MIT
//! Per-request timeout tracking.
//!
//! Every outstanding request carries at most one [`TimeoutTracker`] armed at
//! submission. A request reaches exactly one terminal state — completion,
//! timeout, or another failure — and that exclusivity is enforced by a
//! [`TerminalLatch`] shared by all terminal paths: whichever path claims the
//! latch first owns delivery, everything else becomes a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Single-fire latch deciding which terminal event a request observes.
#[derive(Debug, Default)]
pub struct TerminalLatch {
    settled: AtomicBool,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the terminal slot. Returns `true` for exactly one caller over
    /// the lifetime of the latch.
    pub fn try_claim(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    /// True once any terminal path has claimed the latch.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// One-shot timer bound to a single request.
///
/// `arm` with `None` or a zero duration produces a tracker that never fires.
/// `cancel` is idempotent and safe to call after the timer has already
/// fired; a fired timer's callback is expected to consult the request's
/// latch, so a late cancel is harmless.
#[derive(Debug)]
pub struct TimeoutTracker {
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutTracker {
    /// A tracker with no deadline.
    pub fn disarmed() -> Self {
        Self {
            timer: Mutex::new(None),
        }
    }

    /// Start a one-shot timer that invokes `on_timeout` after `duration`.
    ///
    /// Must be called from within a tokio runtime when a deadline is set.
    pub fn arm(duration: Option<Duration>, on_timeout: impl FnOnce() + Send + 'static) -> Self {
        let timer = match duration {
            Some(d) if !d.is_zero() => Some(tokio::spawn(async move {
                tokio::time::sleep(d).await;
                trace!(after_ms = d.as_millis() as u64, "request timer fired");
                on_timeout();
            })),
            _ => None,
        };
        Self {
            timer: Mutex::new(timer),
        }
    }

    /// Stop the timer. The callback will not run unless it is already
    /// running on another thread, in which case the shared latch decides.
    pub fn cancel(&self) {
        if let Some(handle) = self
            .timer
            .lock()
            .expect("timeout tracker lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for TimeoutTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}
