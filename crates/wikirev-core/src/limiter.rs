//! Shared rate limiter: concurrency budget, minimum spacing, throttle backoff.
//!
//! Uses `Mutex + Condvar` from std. All permit bookkeeping happens under the
//! one lock, so the in-flight count can never exceed the budget regardless of
//! how many workers race for it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::CancelFlag;
use crate::config::FetchConfig;

/// Longest a waiter sleeps before re-checking cancellation
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Result of a completed request, as far as pacing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Success,
    /// Non-throttle failure: resets the success streak, spacing unchanged
    Failure,
    /// Remote asked us to slow down, optionally with a `Retry-After`
    Throttled(Option<Duration>),
}

struct State {
    in_flight: usize,
    spacing: Duration,
    last_issue: Option<Instant>,
    /// No permits before this instant (set by throttle signals)
    resume_at: Option<Instant>,
    success_streak: u32,
}

enum Admission {
    Ready,
    Full,
    NotBefore(Instant),
}

/// Batch-wide request gate shared by every pipeline
pub struct RateLimiter {
    state: Mutex<State>,
    cond: Condvar,
    max_in_flight: usize,
    floor: Duration,
    ceiling: Duration,
    multiplier: f64,
    decay_after: u32,
}

/// RAII permit for one in-flight request; releases its slot on drop.
///
/// Call [`Permit::report`] to feed the outcome back into the pacing logic.
/// Dropping without reporting releases the slot as a neutral outcome.
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    signal: Option<Signal>,
}

impl RateLimiter {
    pub fn new(
        max_in_flight: usize,
        floor: Duration,
        ceiling: Duration,
        multiplier: f64,
        decay_after: u32,
    ) -> Self {
        // A floor above the ceiling (zero or vanishing rates) pins to the ceiling
        let floor = floor.min(ceiling);
        Self {
            state: Mutex::new(State {
                in_flight: 0,
                spacing: floor,
                last_issue: None,
                resume_at: None,
                success_streak: 0,
            }),
            cond: Condvar::new(),
            max_in_flight: max_in_flight.max(1),
            floor,
            ceiling,
            multiplier,
            decay_after: decay_after.max(1),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.concurrency,
            config.min_spacing(),
            config.backoff_ceiling(),
            config.backoff.multiplier,
            config.backoff.decay_after,
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admission(&self, st: &State, now: Instant) -> Admission {
        if st.in_flight >= self.max_in_flight {
            return Admission::Full;
        }
        let spaced = st.last_issue.map(|t| t + st.spacing);
        let not_before = match (spaced, st.resume_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match not_before {
            Some(t) if t > now => Admission::NotBefore(t),
            _ => Admission::Ready,
        }
    }

    fn grant(&self, st: &mut State, now: Instant) -> Permit<'_> {
        st.in_flight += 1;
        st.last_issue = Some(now);
        Permit {
            limiter: self,
            signal: None,
        }
    }

    /// Block until one request may be issued.
    ///
    /// Returns `None` if cancellation is observed while waiting.
    pub fn acquire(&self, cancel: &CancelFlag) -> Option<Permit<'_>> {
        let mut st = self.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let now = Instant::now();
            let wait = match self.admission(&st, now) {
                Admission::Ready => return Some(self.grant(&mut st, now)),
                Admission::Full => WAIT_SLICE,
                Admission::NotBefore(t) => (t - now).min(WAIT_SLICE),
            };
            st = self
                .cond
                .wait_timeout(st, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take a permit only if one is available right now
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut st = self.lock();
        let now = Instant::now();
        match self.admission(&st, now) {
            Admission::Ready => Some(self.grant(&mut st, now)),
            _ => None,
        }
    }

    /// Current minimum inter-request spacing
    pub fn spacing(&self) -> Duration {
        self.lock().spacing
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn release(&self, signal: Option<Signal>) {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
        match signal {
            Some(Signal::Success) => {
                st.success_streak += 1;
                if st.success_streak >= self.decay_after {
                    st.success_streak = 0;
                    st.spacing = st.spacing.div_f64(self.multiplier).max(self.floor);
                }
            }
            Some(Signal::Failure) => st.success_streak = 0,
            Some(Signal::Throttled(retry_after)) => {
                st.success_streak = 0;
                st.spacing = st.spacing.mul_f64(self.multiplier).min(self.ceiling);
                let pause = retry_after.unwrap_or_default().max(st.spacing);
                let resume = Instant::now() + pause;
                st.resume_at = Some(st.resume_at.map_or(resume, |r| r.max(resume)));
                log::debug!(
                    "throttled: spacing now {}ms, paused for {}ms",
                    st.spacing.as_millis(),
                    pause.as_millis()
                );
            }
            None => {}
        }
        self.cond.notify_all();
    }
}

impl Permit<'_> {
    /// Release the permit, recording how the request went
    pub fn report(mut self, signal: Signal) {
        self.signal = Some(signal);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.signal.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn limiter(max: usize, floor_ms: u64) -> RateLimiter {
        RateLimiter::new(
            max,
            Duration::from_millis(floor_ms),
            Duration::from_secs(5),
            2.0,
            2,
        )
    }

    /// Run one permit through release without pacing in the way
    fn cycle(lim: &RateLimiter, signal: Signal) {
        lim.lock().in_flight += 1;
        Permit {
            limiter: lim,
            signal: None,
        }
        .report(signal);
    }

    #[test]
    fn budget_caps_in_flight() {
        let lim = limiter(2, 0);
        let g1 = lim.try_acquire().unwrap();
        let _g2 = lim.try_acquire().unwrap();
        assert_eq!(lim.in_flight(), 2);
        assert!(lim.try_acquire().is_none());
        drop(g1);
        assert_eq!(lim.in_flight(), 1);
        assert!(lim.try_acquire().is_some());
    }

    #[test]
    fn spacing_enforced_between_issues() {
        let lim = limiter(4, 40);
        let g = lim.try_acquire().unwrap();
        g.report(Signal::Success);
        // Slot free, but spacing since last issue has not elapsed
        assert!(lim.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(60));
        assert!(lim.try_acquire().is_some());
    }

    #[test]
    fn throttle_widens_spacing_and_pauses() {
        let lim = limiter(4, 50);
        let before = lim.spacing();
        lim.try_acquire().unwrap().report(Signal::Throttled(None));
        let after = lim.spacing();
        assert!(after > before);
        assert_eq!(after, Duration::from_millis(100));
        // No permit until the widened spacing has elapsed
        assert!(lim.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(30));
        assert!(lim.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(110));
        assert!(lim.try_acquire().is_some());
    }

    #[test]
    fn throttle_honours_retry_after() {
        let lim = limiter(4, 1);
        lim.try_acquire()
            .unwrap()
            .report(Signal::Throttled(Some(Duration::from_millis(150))));
        std::thread::sleep(Duration::from_millis(30));
        assert!(lim.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(150));
        assert!(lim.try_acquire().is_some());
    }

    #[test]
    fn spacing_capped_at_ceiling() {
        let lim = RateLimiter::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
            10,
        );
        for _ in 0..5 {
            cycle(&lim, Signal::Throttled(None));
        }
        assert_eq!(lim.spacing(), Duration::from_millis(4));
    }

    #[test]
    fn unbounded_floor_pins_to_ceiling() {
        let lim = RateLimiter::new(1, Duration::MAX, Duration::from_millis(20), 2.0, 1);
        assert_eq!(lim.spacing(), Duration::from_millis(20));
        lim.try_acquire().unwrap().report(Signal::Throttled(None));
        assert_eq!(lim.spacing(), Duration::from_millis(20));
        assert!(lim.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(40));
        assert!(lim.try_acquire().is_some());
    }

    #[test]
    fn sustained_success_decays_to_floor() {
        let lim = limiter(1, 10);
        cycle(&lim, Signal::Throttled(None));
        cycle(&lim, Signal::Throttled(None));
        assert_eq!(lim.spacing(), Duration::from_millis(40));
        // decay_after = 2: two successes per halving step
        for _ in 0..2 {
            cycle(&lim, Signal::Success);
        }
        assert_eq!(lim.spacing(), Duration::from_millis(20));
        // A failure resets the streak
        cycle(&lim, Signal::Success);
        cycle(&lim, Signal::Failure);
        cycle(&lim, Signal::Success);
        assert_eq!(lim.spacing(), Duration::from_millis(20));
        for _ in 0..10 {
            cycle(&lim, Signal::Success);
        }
        assert_eq!(lim.spacing(), Duration::from_millis(10));
    }

    #[test]
    fn acquire_returns_none_when_cancelled() {
        let lim = limiter(1, 0);
        let _held = lim.try_acquire().unwrap();
        let cancel = CancelFlag::new();
        let c2 = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            c2.cancel();
        });
        assert!(lim.acquire(&cancel).is_none());
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_workers_never_exceed_budget() {
        let lim = Arc::new(limiter(3, 0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancelFlag::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lim = lim.clone();
                let peak = peak.clone();
                let cancel = cancel.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let permit = lim.acquire(&cancel).unwrap();
                        peak.fetch_max(lim.in_flight(), Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(1));
                        permit.report(Signal::Success);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(lim.in_flight(), 0);
    }
}
