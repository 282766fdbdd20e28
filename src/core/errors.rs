use thiserror::Error;

/// Network error codes treated as transient
pub const TRANSIENT_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "ENOTFOUND",
    "ENETUNREACH",
    "EAI_AGAIN",
];

/// HTTP statuses treated as transient
pub const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "rate_limit", "too many requests"];

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Unified error type for the runbook execution core
#[derive(Debug, Error)]
pub enum RunbookError {
    /// Structural problems in a task graph or a rejected plan
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        task_id: Option<String>,
    },

    /// A dependency cycle was found while ordering tasks
    #[error("Cyclic dependency detected at task '{task_id}'")]
    CyclicDependency { task_id: String },

    /// A task could not be brought to completion
    #[error("Task error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    /// A single request can never fit inside the configured budget
    #[error("Rate limit exceeded for {service}: {reason}")]
    RateLimitExceeded {
        service: String,
        reason: String,
        wait_ms: Option<u64>,
    },

    /// Waited in the limiter queue longer than allowed
    #[error("Rate limit wait timed out for {service} after {timeout_ms}ms")]
    RateLimitTimeout { service: String, timeout_ms: u64 },

    /// The circuit for a service is open and the call was rejected without running
    #[error("Circuit open for {service} (retry after {retry_after_ms}ms)")]
    CircuitOpen { service: String, retry_after_ms: u64 },

    /// A compensating action failed during rollback
    #[error("Rollback action '{action}' failed: {message}")]
    RollbackAction { action: String, message: String },

    /// An external service call failed
    #[error("Service call to {service} failed: {message}")]
    Service {
        service: String,
        message: String,
        /// HTTP status reported by the backend, if any
        status: Option<u16>,
        /// Transport-level error code such as `ECONNRESET`
        code: Option<String>,
    },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// `execute` called while a graph is already running on the same orchestrator
    #[error("An execution is already in progress")]
    ExecutionInProgress,

    #[error("No active task graph")]
    NoActiveGraph,

    #[error("Planning failed: {message}")]
    Planning { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RunbookError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            task_id: None,
        }
    }

    /// Create a validation error pinned to a task
    pub fn validation_task<S: Into<String>, T: Into<String>>(message: S, task_id: T) -> Self {
        Self::Validation {
            message: message.into(),
            task_id: Some(task_id.into()),
        }
    }

    pub fn cyclic<S: Into<String>>(task_id: S) -> Self {
        Self::CyclicDependency {
            task_id: task_id.into(),
        }
    }

    pub fn task<S: Into<String>, M: Into<String>>(task_id: S, message: M) -> Self {
        Self::TaskExecution {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a service error with no status or transport code
    pub fn service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// Create a service error carrying an HTTP status
    pub fn service_status<S: Into<String>, M: Into<String>>(
        service: S,
        status: u16,
        message: M,
    ) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
            status: Some(status),
            code: None,
        }
    }

    /// Create a service error carrying a transport error code
    pub fn service_code<S: Into<String>, C: Into<String>, M: Into<String>>(
        service: S,
        code: C,
        message: M,
    ) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
            status: None,
            code: Some(code.into()),
        }
    }

    pub fn circuit_open<S: Into<String>>(service: S, retry_after_ms: u64) -> Self {
        Self::CircuitOpen {
            service: service.into(),
            retry_after_ms,
        }
    }

    pub fn rollback_action<A: Into<String>, M: Into<String>>(action: A, message: M) -> Self {
        Self::RollbackAction {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn planning<S: Into<String>>(message: S) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Errors that fail a run before any task starts
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::CyclicDependency { .. }
        )
    }

    /// Whether a failed external call is worth repeating.
    ///
    /// Transient network codes, retryable HTTP statuses, timeouts and
    /// rate-limit wording in the message all count. An open circuit never does.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service {
                message,
                status,
                code,
                ..
            } => {
                code.as_deref()
                    .map_or(false, |c| TRANSIENT_CODES.contains(&c))
                    || status.map_or(false, |s| RETRYABLE_STATUSES.contains(&s))
                    || mentions_rate_limit(message)
            }
            Self::Timeout { .. } | Self::RateLimitTimeout { .. } => true,
            Self::CircuitOpen { .. } => false,
            Self::RateLimitExceeded { .. } => false,
            Self::TaskExecution { message, .. } | Self::Internal { message } => {
                mentions_rate_limit(message)
            }
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::CyclicDependency { .. } => "validation",
            Self::TaskExecution { .. } => "task",
            Self::RateLimitExceeded { .. } => "rate_limit",
            Self::RateLimitTimeout { .. } => "rate_limit",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RollbackAction { .. } => "rollback",
            Self::Service { .. } => "service",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ExecutionInProgress => "state",
            Self::NoActiveGraph => "state",
            Self::Planning { .. } => "planning",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RunbookError>;

impl From<std::io::Error> for RunbookError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for RunbookError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for RunbookError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for RunbookError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the whole context chain in the message
        Self::internal(format!("{:#}", err))
    }
}
