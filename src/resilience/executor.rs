//! Single entry point for external calls: limiter, breaker, then retry

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::core::config::RunbookConfig;
use crate::core::errors::Result;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::retry::{RetryHandler, RetryOptions};

pub struct ResilientExecutor {
    retry: RetryHandler,
    breaker_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryHandler::default(), CircuitBreakerConfig::default())
    }
}

impl ResilientExecutor {
    pub fn new(retry: RetryHandler, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            breaker_config,
            breakers: DashMap::new(),
            rate_limiter: None,
        }
    }

    /// Build retry, breaker and limiter settings from one config
    pub fn from_config(config: &RunbookConfig) -> Self {
        let limiter = RateLimiter::with_limits(
            config.rate_limits.clone(),
            config.default_rate_limit.clone(),
        );
        Self::new(
            RetryHandler::new(config.retry.clone()),
            config.circuit_breaker.clone(),
        )
        .with_rate_limiter(Arc::new(limiter))
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Breaker for `key`, created on first use
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.breaker_config.clone())))
            .clone()
    }

    pub async fn execute<F, Fut, T>(&self, key: &str, tokens: Option<u64>, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(key, tokens, operation, &RetryOptions::default())
            .await
    }

    /// Acquire rate-limit capacity, then run the retry loop inside the key's
    /// circuit breaker. An open circuit rejects before any attempt is made.
    pub async fn execute_with<F, Fut, T>(
        &self,
        key: &str,
        tokens: Option<u64>,
        operation: F,
        options: &RetryOptions<'_>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(key, tokens, None).await?;
        }
        let breaker = self.breaker(key);
        debug!(service = %key, state = %breaker.state(), "Dispatching resilient call");
        breaker
            .execute(self.retry.execute_with(operation, options))
            .await
    }

    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        let mut states: Vec<CircuitSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Close the breaker for `key`. Returns false if none exists yet.
    pub fn reset_circuit(&self, key: &str) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
