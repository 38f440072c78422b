//! Resilience utilities: retry and backoff for outbound connectors.
//!
//! The engine's outbound connectors never busy-loop: a failed dial waits
//! [`RetryConfig::delay_for_attempt`] before the next attempt, with the delay
//! growing exponentially up to a hard cap.

use std::time::Duration;

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double the delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Long-running daemon backoff: retry forever, capped at 5 minutes.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Reasoning
    /// -------  -----     ---------
    /// 1        1s        Immediate transient retry
    /// 2        2s        Brief network blip
    /// 3        4s        DNS propagation
    /// 4        8s        Container restart
    /// 5        16s       Service recovery
    /// 6+       ...       Doubling, capped at 300s
    /// ```
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail backoff for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}
