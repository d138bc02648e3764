//! Retry with exponential backoff and jitter, capped by a process-wide budget.
//!
//! Only the LLM driver and explicitly idempotent callers retry. The budget is
//! a token bucket shared across the process so a failing upstream cannot turn
//! into a retry storm: each retry withdraws one token, and tokens refill at a
//! steady rate sized for the target error SLO.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{EngineError, Result};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (1-based), with full jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=1.0);
        capped.mul_f64(jitter)
    }
}

/// Process-wide retry token bucket.
pub struct RetryBudget {
    state: Mutex<BudgetState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BudgetState {
    tokens: f64,
    last_refill: Instant,
}

impl RetryBudget {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity as f64,
            refill_per_sec,
        }
    }

    /// Withdraw one retry token. Returns false when the budget is exhausted.
    pub fn try_withdraw(&self) -> bool {
        let mut state = self.state.lock().expect("retry budget poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        // 10 retries burst, refilling one every 6 seconds.
        Self::new(10, 1.0 / 6.0)
    }
}

/// Run `operation` with backoff. Retries only errors whose `retryable()` is
/// true, and only while the shared budget admits another attempt.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    budget: &RetryBudget,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt < config.max_attempts => {
                if !budget.try_withdraw() {
                    tracing::warn!(attempt, "retry budget exhausted, propagating error");
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Classify an HTTP status as retryable.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Wrap a provider failure into the right error kind for the retry loop.
pub fn classify_provider_error(status: Option<u16>, message: String) -> EngineError {
    match status {
        Some(code) if is_retryable_status(code) => EngineError::LlmTransient(message),
        Some(_) => EngineError::LlmFatal(message),
        // No status means the transport failed (timeout, reset): transient.
        None => EngineError::LlmTransient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let budget = RetryBudget::new(10, 100.0);
        let attempts = AtomicU32::new(0);

        let result = with_retry(&config, &budget, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::LlmTransient("503".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let config = RetryConfig::default();
        let budget = RetryBudget::default();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&config, &budget, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::LlmFatal("401".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_stops_retries() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        // One token, effectively no refill within the test.
        let budget = RetryBudget::new(1, 0.0001);
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&config, &budget, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::LlmTransient("flaky".to_string())) }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt plus the single budgeted retry.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }
}
