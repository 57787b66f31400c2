//! Retry policies for node execution.
//!
//! A policy declares how many attempts a node gets, the backoff between
//! them, and a predicate over the error deciding whether a retry makes
//! sense at all. Retries re-invoke the node with the same snapshot; task
//! identity is preserved and the attempt number is surfaced in lifecycle
//! events. Interrupt sentinels and cancellations are never retried.

use crate::node::NodeError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate = Arc<dyn Fn(&NodeError) -> bool + Send + Sync>;

/// Configuration for retrying failed node executions.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial interval between retries in seconds.
    pub initial_interval: f64,
    /// Multiplier for the interval after each retry.
    pub backoff_factor: f64,
    /// Maximum interval between retries in seconds.
    pub max_interval: f64,
    /// Whether to add random jitter to intervals.
    pub jitter: bool,
    /// Predicate deciding whether an error is worth retrying.
    retry_on: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .field("retry_on", &"<predicate>")
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: Arc::new(NodeError::is_retryable),
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Whether another attempt should follow `error` at 1-based `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &NodeError) -> bool {
        attempt < self.max_attempts && error.is_retryable() && (self.retry_on)(error)
    }

    /// Backoff before the retry following 1-based `attempt`.
    ///
    /// Exponential: `initial_interval * backoff_factor^(attempt-1)`, capped
    /// at `max_interval`, with a 0.5–1.5 jitter factor when enabled.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_interval);

        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
