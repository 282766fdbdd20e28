// Core infrastructure: errors and configuration
pub mod core;

// Task graph model and ordering
pub mod graph;

// Rate limiting, retry and circuit breaking around external calls
pub mod resilience;

// Task execution and the graph state machine
pub mod agent;

// Planning, execution sequencing and event fan-out
pub mod orchestrator;

// Re-exports for convenience
pub use core::config::{AgentConfig, ExecutionDefaults, RunbookConfig};
pub use core::errors::{Result, RunbookError};

pub use graph::{
    execution_levels, topological_sort, validate_graph, GraphProgress, GraphStatus,
    RollbackAction, Task, TaskGraph, TaskId, TaskOutput, TaskResult, TaskStatus, TaskType,
};

pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitConfig, RateLimiter,
    ResilientExecutor, RetryConfig, RetryHandler,
};

pub use agent::{
    BufferingEventSink, CapabilityRegistry, ChannelEventSink, DispatchContext, DispatchOutcome,
    EventSink, ExecutionEvent, ExecutionEventKind, ExecutionOptions, ExecutionResult,
    ExecutorAgent, InvocationBackend, InvocationRequest, InvocationResponse,
    LocalRollbackHandler, OperationCall, RollbackHandler, RollbackResult, TaskContext,
};

pub use orchestrator::{
    EventBus, Orchestrator, OrchestratorMode, OrchestratorState, PlanOutcome, PlanRequest,
    PlanValidation, Planner, StaticPlanner, Subscription,
};
