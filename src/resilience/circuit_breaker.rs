//! Failure-tripped gate for one service key

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::errors::{Result, RunbookError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a trial call
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes needed to close again
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(RunbookError::configuration(
                "circuit_breaker.failure_threshold must be greater than 0",
            ));
        }
        if self.half_open_requests == 0 {
            return Err(RunbookError::configuration(
                "circuit_breaker.half_open_requests must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub since_last_failure_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            since_last_failure_ms: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_successes = 0;
    }

    /// Run `operation` unless the circuit is open. An open circuit fails with
    /// `CircuitOpen` without polling the future.
    pub async fn execute<Fut, T>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
        result
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let reset_timeout = self.config.reset_timeout();
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(reset_timeout);
        if elapsed >= reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!(service = %self.name, "Circuit half-open, admitting trial call");
            Ok(())
        } else {
            Err(RunbookError::circuit_open(
                self.name.clone(),
                (reset_timeout - elapsed).as_millis() as u64,
            ))
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    info!(service = %self.name, "Circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: &RunbookError) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        service = %self.name,
                        failures = inner.failure_count,
                        error = %err,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                warn!(service = %self.name, error = %err, "Trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }
}
