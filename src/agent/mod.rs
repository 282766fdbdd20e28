//! Task execution: the invocation loop, the graph state machine and rollback

pub mod collaborators;
pub mod control;
pub mod events;
pub mod executor;
pub mod rollback;

pub use collaborators::{
    CallOutcome, CapabilityRegistry, DependencySummary, DispatchContext, DispatchOutcome,
    InvocationBackend, InvocationRequest, InvocationResponse, OperationCall, RollbackHandler,
};
pub use control::{ControlSignal, ExecutionControl};
pub use events::{
    BufferingEventSink, ChannelEventSink, EventSink, ExecutionEvent, ExecutionEventKind,
    LoggingEventSink,
};
pub use executor::{ExecutionOptions, ExecutionResult, ExecutorAgent, TaskContext};
pub use rollback::{rollback_graph, select_for_rollback, LocalRollbackHandler, RollbackResult};
