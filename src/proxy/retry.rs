//! Exponential backoff for transport-level request failures

use crate::config::RetryConfig;
use crate::error::{AuditError, Result};
use crate::proxy::trace::DebugTrace;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry policy applied to a single request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        if self.config.enabled {
            self.config.max_retries + 1
        } else {
            1
        }
    }

    /// Delay before retry number `attempt` (zero based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let delay = initial * self.config.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt`, with ±25% jitter, never above the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = self.base_delay(attempt).as_millis() as f64 * jitter;
        Duration::from_millis(delay.min(self.config.max_delay_ms as f64) as u64)
    }

    /// Only failures to reach the target are retried
    pub fn is_retryable(err: &AuditError) -> bool {
        match err {
            AuditError::Timeout(_) | AuditError::Io(_) | AuditError::Socks(_) => true,
            AuditError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, trace: &mut DebugTrace, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        trace.note(format!("[RETRY] {} succeeded on attempt {}", label, attempt + 1));
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < attempts && Self::is_retryable(&e) => {
                    let delay = self.delay(attempt);
                    trace.note(format!(
                        "[RETRY] {} failed ({}), retrying in {:?} ({}/{})",
                        label,
                        e,
                        delay,
                        attempt + 1,
                        attempts - 1
                    ));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn enabled() -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_retries: 2,
            initial_delay_ms: 10,
            max_delay_ms: 30,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::new(&enabled());
        assert_eq!(policy.base_delay(0), Duration::from_millis(10));
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(30));
        for attempt in 0..5 {
            assert!(policy.delay(attempt) <= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_disabled_policy_makes_one_attempt() {
        let policy = RetryPolicy::new(&RetryConfig::default());
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(RetryPolicy::new(&enabled()).max_attempts(), 3);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RetryPolicy::is_retryable(&AuditError::Timeout(Duration::from_secs(1))));
        assert!(!RetryPolicy::is_retryable(&AuditError::InvalidConfig("bad".to_string())));
        assert!(!RetryPolicy::is_retryable(&AuditError::Tunnel("bad".to_string())));
    }

    #[tokio::test]
    async fn test_retries_transport_errors_until_success() {
        let policy = RetryPolicy::new(&enabled());
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let mut trace = DebugTrace::new(true);

        let value = policy
            .run("request", &mut trace, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AuditError::Timeout(Duration::from_millis(1)))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(trace.into_string().contains("succeeded on attempt 3"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::new(&enabled());
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let mut trace = DebugTrace::new(false);

        let result: Result<()> = policy
            .run("request", &mut trace, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuditError::Tunnel("refused".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
