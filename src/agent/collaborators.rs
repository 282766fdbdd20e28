//! Interfaces to the services a task run delegates to
//!
//! The executor never talks to a model provider, a tool implementation or the
//! file system directly. It goes through these traits, which are injected at
//! construction time.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::Result;
use crate::graph::model::{RollbackAction, TaskId, TaskType};

/// What a dependency produced, condensed for the next request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySummary {
    pub task_id: TaskId,
    pub name: String,
    pub summary: String,
}

/// Named operation requested by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl OperationCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: cuid2::create_id(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a dispatched call, fed back into the next request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub call_id: String,
    pub name: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    pub input: Value,
    pub dependencies: Vec<DependencySummary>,
    /// Outcomes of every call dispatched so far in this task run
    pub history: Vec<CallOutcome>,
    /// 1-based round number
    pub iteration: u32,
    /// Operations the capability registry can dispatch this run
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub content: String,
    #[serde(default)]
    pub calls: Vec<OperationCall>,
}

impl InvocationResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            calls: Vec::new(),
        }
    }

    pub fn with_calls(content: impl Into<String>, calls: Vec<OperationCall>) -> Self {
        Self {
            content: content.into(),
            calls,
        }
    }
}

/// Model backend that turns a request into text and operation calls.
///
/// Errors should carry HTTP status or transport codes (see
/// `RunbookError::service_status`) so retries can classify them.
#[async_trait]
pub trait InvocationBackend: Send + Sync {
    /// Key under which rate-limit and breaker state is tracked
    fn service_key(&self) -> &str;

    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResponse>;
}

/// Context handed to every dispatched call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchContext {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub iteration: u32,
    /// Directory the call is confined to, if any
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub data: Option<Value>,
    /// Compensation for a reversible side effect the call performed
    pub rollback: Option<RollbackAction>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            rollback: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            rollback: None,
            error: Some(error.into()),
        }
    }

    pub fn with_rollback(mut self, action: RollbackAction) -> Self {
        self.rollback = Some(action);
        self
    }
}

/// Maps an operation name to its implementation
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn dispatch(
        &self,
        call: &OperationCall,
        ctx: &DispatchContext,
    ) -> anyhow::Result<DispatchOutcome>;

    /// Names this registry can dispatch
    fn operations(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Performs the concrete reversal of a recorded side effect
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    async fn apply(&self, action: &RollbackAction) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_call_ids_are_unique() {
        let a = OperationCall::new("write_file", json!({"path": "a"}));
        let b = OperationCall::new("write_file", json!({"path": "a"}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_response_deserializes_without_calls() {
        let response: InvocationResponse =
            serde_json::from_value(json!({"content": "nothing to do"})).unwrap();
        assert!(response.calls.is_empty());
    }

    #[test]
    fn test_dispatch_outcome_builders() {
        let outcome = DispatchOutcome::ok(json!({"bytes": 12})).with_rollback(
            RollbackAction::DeleteFile {
                path: "out.txt".into(),
            },
        );
        assert!(outcome.success);
        assert!(outcome.rollback.is_some());
        assert_eq!(
            DispatchOutcome::failed("denied").error.as_deref(),
            Some("denied")
        );
    }
}
