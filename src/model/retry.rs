//! Bounded retry with exponential backoff for model calls

use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempts` failed ones.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exp = (self.base_ms as f64) * self.factor.powi(attempts.saturating_sub(1) as i32);
        let capped = exp.min(self.cap_ms as f64);
        let jitter = 1.0 + (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * self.jitter;
        let floor = (self.base_ms as f64).min(self.cap_ms as f64);
        let delay = (capped * jitter).clamp(floor, self.cap_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn allowed(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 250,
            factor: 2.0,
            jitter: 0.3,
            cap_ms: 4_000,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy runs out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.allowed(attempts) => {
                let delay = policy.delay_after(attempts);
                warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "Retrying model call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_ms: 1,
            factor: 2.0,
            jitter: 0.0,
            cap_ms: 5,
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(10), Duration::from_millis(4_000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(&fast(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OrchestrationError::ModelTransport("503".into()))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OrchestrationError::ModelTransport("timeout".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OrchestrationError::ModelResponse("no candidates".into()))
        })
        .await;

        assert!(matches!(result, Err(OrchestrationError::ModelResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
