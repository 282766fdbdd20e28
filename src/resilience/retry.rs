//! Bounded retries with exponential backoff

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::errors::{Result, RunbookError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(RunbookError::configuration(
                "retry.initial_delay_ms must be greater than 0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(RunbookError::configuration(
                "retry.max_delay_ms must not be less than initial_delay_ms",
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(RunbookError::configuration(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let max = self.max_delay_ms as f64;
        let delay = if self.jitter {
            base.min(max) * (0.5 + fastrand::f64())
        } else {
            base
        };
        Duration::from_millis(delay.min(max) as u64)
    }
}

/// Default retry classification
pub fn is_retryable(err: &RunbookError) -> bool {
    err.is_transient()
}

type RetryCallback<'a> = Box<dyn Fn(u32, &RunbookError, Duration) + Send + Sync + 'a>;
type RetryPredicate<'a> = Box<dyn Fn(&RunbookError, u32) -> bool + Send + Sync + 'a>;

/// Per-call hooks for `RetryHandler::execute_with`
#[derive(Default)]
pub struct RetryOptions<'a> {
    on_retry: Option<RetryCallback<'a>>,
    should_retry: Option<RetryPredicate<'a>>,
}

impl<'a> RetryOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before each backoff wait with the retry number, the error and the delay
    pub fn on_retry(mut self, f: impl Fn(u32, &RunbookError, Duration) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Replace the default classification. Receives the error and the attempt
    /// number that produced it (1-based).
    pub fn should_retry(mut self, f: impl Fn(&RunbookError, u32) -> bool + Send + Sync + 'a) -> Self {
        self.should_retry = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(operation, &RetryOptions::default()).await
    }

    /// Run `operation`, retrying classified-transient failures with backoff.
    /// Non-retryable and exhausted failures return the last error unchanged.
    pub async fn execute_with<F, Fut, T>(
        &self,
        mut operation: F,
        options: &RetryOptions<'_>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = match &options.should_retry {
                Some(predicate) => predicate(&err, attempt),
                None => is_retryable(&err),
            };
            if !retryable {
                debug!(attempt, error = %err, "Error is not retryable");
                return Err(err);
            }
            if attempt > self.config.max_retries {
                warn!(
                    attempts = attempt,
                    error = %err,
                    "Retry attempts exhausted"
                );
                return Err(err);
            }

            let delay = self.config.delay_for(attempt - 1);
            warn!(
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            if let Some(callback) = &options.on_retry {
                callback(attempt, &err, delay);
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(max_retries: u32) -> RetryHandler {
        RetryHandler::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(250))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
            .with_jitter(false);
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(60_000));
        for _ in 0..100 {
            let delay = config.delay_for(1).as_millis();
            assert!((1000..3000).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let calls = &AtomicU32::new(0);
        let result = fixed(3)
            .execute(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RunbookError::service_status("svc", 503, "unavailable"))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fixed(2)
            .execute(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(RunbookError::service_code("svc", "ECONNRESET", format!("reset {}", n)))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("reset 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fixed(5)
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RunbookError::service_status("svc", 401, "unauthorized"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks() {
        let delays = Mutex::new(Vec::new());
        let calls = &AtomicU32::new(0);
        let options = RetryOptions::new()
            .should_retry(|_, _| true)
            .on_retry(|attempt, _, delay| delays.lock().push((attempt, delay)));

        let result: Result<()> = fixed(2)
            .execute_with(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RunbookError::internal("always"))
                },
                &options,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *delays.lock(),
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
    }
}
