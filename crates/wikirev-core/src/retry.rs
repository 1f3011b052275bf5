//! Per-page retry policy with exponential backoff

use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::IssueError;

/// Exponential backoff: base * 2^(attempt-1), capped at `ceiling`
pub fn backoff_duration(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(ceiling)
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-issue the same request after sleeping this long
    Retry(Duration),
    GiveUp,
}

/// Retry bookkeeping for one request (one continuation page).
///
/// Transient and malformed responses consume `max_retries`; throttles are
/// tracked against their own, larger ceiling and never sleep here, since
/// the rate limiter already holds back the next permit.
#[derive(Debug)]
pub struct RetryBudget {
    max_retries: u32,
    max_throttles: u32,
    base: Duration,
    ceiling: Duration,
    attempts: u32,
    failures: u32,
    throttles: u32,
}

impl RetryBudget {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_throttles: config.max_throttle_retries,
            base: config.retry_base(),
            ceiling: config.backoff_ceiling(),
            attempts: 0,
            failures: 0,
            throttles: 0,
        }
    }

    /// Record a failed attempt and decide whether to try again
    pub fn record(&mut self, err: &IssueError) -> Verdict {
        self.attempts += 1;
        if !err.is_retryable() {
            return Verdict::GiveUp;
        }
        if !err.counts_against_retries() {
            self.throttles += 1;
            return if self.throttles > self.max_throttles {
                Verdict::GiveUp
            } else {
                Verdict::Retry(Duration::ZERO)
            };
        }
        self.failures += 1;
        if self.failures > self.max_retries {
            Verdict::GiveUp
        } else {
            Verdict::Retry(backoff_duration(self.base, self.failures, self.ceiling))
        }
    }

    /// Failed attempts recorded so far, throttled ones included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Transient and malformed failures recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
