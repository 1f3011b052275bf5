//! Cooperative cancellation via a shared atomic flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity at which sleeping pipelines notice cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Batch-wide cancellation flag, set by a signal handler or the caller.
///
/// Pipelines observe it at their next suspension point (before each request,
/// while waiting for a permit, during retry backoff).
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Set the flag and return whether it was already set (for signal handlers)
    pub fn swap_cancel(&self) -> bool {
        self.0.swap(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleep for `dur`, waking early on cancellation.
    ///
    /// Returns `false` if cancellation was observed.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}
