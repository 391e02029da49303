//! Exponential backoff with jitter for classifier retries. The delay
//! before attempt `n` (0-indexed, `n=0` is the first retry after the
//! initial attempt) is `base * factor^n`, jittered by ±`jitter_fraction`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_classifier_config(config: &crate::config::ClassifierConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            factor: config.retry_backoff_factor,
            jitter_fraction: 0.2,
            max_attempts: config.max_retries,
        }
    }

    /// The jittered delay before retry attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unjittered = self.base_delay_ms as f64 * self.factor.powi(attempt as i32);
        let jitter_span = unjittered * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let jittered_ms = (unjittered + jitter).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Run `operation` with retries under `policy`, stopping early on a
/// non-retryable error. `is_retryable` distinguishes transient failures
/// (worth retrying) from schema/validation/breaker failures (not).
pub async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    is_retryable: impl Fn(&crate::error::Error) -> bool,
    mut operation: F,
) -> crate::error::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                tracing::warn!(attempt, error = %e, "retrying classifier call");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
