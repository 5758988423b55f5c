//! Retry policy for agent invocations.

use crate::types::{AgentResponse, RetryCode};
use std::time::Duration;

/// Extra delay added per retry beyond the explicit schedule.
const DELAY_STEP: Duration = Duration::from_secs(2);

/// Bounded retry with a backoff schedule.
///
/// A response is retried only if it failed with a retryable code. Retry
/// `n` (1-based) sleeps `delays[n - 1]`; past the end of the schedule each
/// retry adds another 2s to the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delays: Vec<Duration>,
    retryable: Vec<RetryCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        )
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries,
            delays,
            retryable: vec![
                RetryCode::TransientToolError,
                RetryCode::Timeout,
                RetryCode::ExecutionError,
                RetryCode::ErrorDuringExecution,
            ],
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total invocations allowed, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn is_retryable(&self, code: RetryCode) -> bool {
        self.retryable.contains(&code)
    }

    /// Whether `response` warrants another attempt, ignoring the budget.
    pub fn should_retry(&self, response: &AgentResponse) -> bool {
        !response.success && self.is_retryable(response.retry_code)
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let idx = retry.saturating_sub(1) as usize;
        if let Some(delay) = self.delays.get(idx) {
            return *delay;
        }
        let last = self.delays.last().copied().unwrap_or(Duration::ZERO);
        let beyond = (idx + 1 - self.delays.len()) as u32;
        last + DELAY_STEP * beyond
    }
}
