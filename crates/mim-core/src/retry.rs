//! Retry and backoff policy.
//!
//! Maps a failure class and a 1-based attempt number to a decision: retry
//! after some delay, or stop and quarantine. Rate-limit waits are honored
//! exactly as reported; they never consume the attempt budget, so they do
//! not appear in the `attempt` accounting at all.

use crate::failure::FailureClass;
use std::time::Duration;

/// Delay cap for network-ish exponential backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry; quarantine with the recorded class.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Per-task retry policy. `attempt` is the number of budget-consuming
/// failures so far including the one being decided (1 = first failure).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Generic retry budget per task.
    pub max_attempts: u32,
    /// Base for exponential backoff, in seconds.
    pub base_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_seconds: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_seconds: u64) -> Self {
        Self {
            max_attempts,
            base_seconds,
        }
    }

    /// Decide what to do after `attempt` budget-consuming failures of `class`.
    pub fn decide(&self, attempt: u32, class: &FailureClass) -> RetryDecision {
        match class {
            // Exact server-reported wait, unbounded budget.
            FailureClass::RateLimit { wait_secs } => {
                RetryDecision::RetryAfter(Duration::from_secs(*wait_secs))
            }

            FailureClass::Dns | FailureClass::Network => {
                if attempt >= self.max_attempts {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(self.capped_backoff(attempt))
            }

            FailureClass::Stall | FailureClass::Incomplete => {
                if attempt >= self.max_attempts {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(self.capped_backoff(attempt.saturating_sub(1)))
            }

            FailureClass::HttpStatus(_) => {
                if !class.retryable() || attempt >= self.max_attempts {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(self.capped_backoff(attempt))
            }

            // One immediate restart-from-zero attempt.
            FailureClass::Integrity => {
                if attempt > 1 {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(Duration::ZERO)
            }

            // Small bounded budget for encoder timeouts.
            FailureClass::NormalizeTimeout => {
                if attempt >= 2 {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(self.capped_backoff(attempt))
            }

            // Immediate retry once the offending photo has been recompressed.
            FailureClass::PhotoTooLarge => {
                if attempt >= self.max_attempts {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(Duration::ZERO)
            }

            // One sanity retry before the class hardens into Permanent.
            FailureClass::Unknown(_) => {
                if attempt > 1 {
                    return RetryDecision::NoRetry;
                }
                RetryDecision::RetryAfter(Duration::ZERO)
            }

            FailureClass::Canceled
            | FailureClass::MediaInvalid
            | FailureClass::Auth
            | FailureClass::Permanent(_) => RetryDecision::NoRetry,
        }
    }

    /// `base * 2^exp`, capped. `exp` saturates to keep the shift sane.
    fn capped_backoff(&self, exp: u32) -> Duration {
        let factor = 1u64 << exp.min(16);
        let raw = Duration::from_secs(self.base_seconds.saturating_mul(factor));
        raw.min(BACKOFF_CAP)
    }
}
