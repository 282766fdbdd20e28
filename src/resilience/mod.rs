//! Resilience layer wrapped around every external call

pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use executor::ResilientExecutor;
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, RateLimitStatus, RateLimiter};
pub use retry::{is_retryable, RetryConfig, RetryHandler, RetryOptions};
