use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};

/// Bounded retry with exponential backoff and a per-call timeout
///
/// Injected into the broker gateway so every external call shares one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2000, // Start with 2 seconds
            max_backoff_ms: 8000,
            call_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Run `call` until it succeeds or attempts run out
    ///
    /// Each attempt is bounded by `call_timeout`. Exhaustion yields
    /// `ExecutionFailure` carrying the last error.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            match timeout(self.call_timeout(), call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::info!("✓ {} succeeded after {} attempts", operation, attempt);
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {}ms", self.call_timeout_ms);
                }
            }

            if attempt < attempts {
                let backoff = self.backoff(attempt);
                tracing::warn!(
                    "Attempt {}/{} of {} failed: {}. Retrying in {}ms...",
                    attempt,
                    attempts,
                    operation,
                    last_error,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
        }

        Err(EngineError::ExecutionFailure {
            operation: operation.to_string(),
            attempts,
            message: last_error,
        })
    }
}
