use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RunbookError};
use crate::orchestrator::OrchestratorMode;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimitConfig;
use crate::resilience::retry::RetryConfig;

/// Defaults applied to every graph run unless the caller overrides them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionDefaults {
    /// Graph-wide retry floor; a task's own `max_retries` may raise it
    pub max_retries: u32,
    pub stop_on_failure: bool,
    /// Pause between attempts of the same task
    pub retry_delay_ms: u64,
    pub dry_run: bool,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stop_on_failure: true,
            retry_delay_ms: 1000,
            dry_run: false,
        }
    }
}

impl ExecutionDefaults {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Limits for the single-task invocation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    /// Operation calls dispatched concurrently within one round
    pub max_parallel_calls: usize,
    pub call_timeout_ms: u64,
    pub max_dependency_summary_chars: usize,
    /// Token cost charged to the rate limiter per invocation request
    pub estimated_tokens_per_request: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_parallel_calls: 5,
            call_timeout_ms: 30_000,
            max_dependency_summary_chars: 500,
            estimated_tokens_per_request: None,
        }
    }
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(RunbookError::configuration(
                "agent.max_iterations must be greater than 0",
            ));
        }
        if self.max_iterations > 1000 {
            return Err(RunbookError::configuration(
                "agent.max_iterations cannot exceed 1000",
            ));
        }
        if self.max_parallel_calls == 0 {
            return Err(RunbookError::configuration(
                "agent.max_parallel_calls must be greater than 0",
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(RunbookError::configuration(
                "agent.call_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for an orchestrator and everything it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunbookConfig {
    pub execution: ExecutionDefaults,
    pub agent: AgentConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per service key limits; keys without an entry use `default_rate_limit`
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub default_rate_limit: RateLimitConfig,
    pub mode: OrchestratorMode,
}

impl Default for RunbookConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionDefaults::default(),
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: HashMap::new(),
            default_rate_limit: RateLimitConfig::default(),
            mode: OrchestratorMode::default(),
        }
    }
}

impl RunbookConfig {
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_retries > 100 {
            return Err(RunbookError::configuration(
                "execution.max_retries cannot exceed 100",
            ));
        }
        self.agent.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.default_rate_limit.validate()?;
        for (key, limit) in &self.rate_limits {
            limit.validate().map_err(|e| {
                RunbookError::configuration(format!("rate_limits.{}: {}", key, e))
            })?;
        }
        Ok(())
    }

    /// Limits for one service key
    pub fn rate_limit_for(&self, key: &str) -> &RateLimitConfig {
        self.rate_limits.get(key).unwrap_or(&self.default_rate_limit)
    }

    /// Layer `override_with` on top of `base`.
    ///
    /// Scalar groups come from the override; per-key rate limits are unioned
    /// with the override winning on conflicts.
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let mut rate_limits = base.rate_limits.clone();
        for (key, limit) in &override_with.rate_limits {
            rate_limits.insert(key.clone(), limit.clone());
        }

        let merged = Self {
            execution: override_with.execution.clone(),
            agent: override_with.agent.clone(),
            retry: override_with.retry.clone(),
            circuit_breaker: override_with.circuit_breaker.clone(),
            rate_limits,
            default_rate_limit: override_with.default_rate_limit.clone(),
            mode: override_with.mode.clone(),
        };

        merged.validate()?;
        Ok(merged)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunbookError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}
