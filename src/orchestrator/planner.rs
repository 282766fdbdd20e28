//! Planning collaborator interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::model::TaskGraph;
use crate::graph::topo::validate_graph;

/// What the user asked for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub prompt: String,
    pub stack: Option<String>,
    #[serde(default)]
    pub context: Value,
}

impl PlanRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub success: bool,
    pub task_graph: Option<TaskGraph>,
    pub error: Option<String>,
}

impl PlanOutcome {
    pub fn planned(graph: TaskGraph) -> Self {
        Self {
            success: true,
            task_graph: Some(graph),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            task_graph: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PlanValidation {
    /// Checks every planner gets for free: dependency integrity and
    /// acyclicity are errors, an empty plan or blank descriptions are warnings.
    pub fn structural(graph: &TaskGraph) -> Self {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = validate_graph(graph) {
            errors.push(e.to_string());
        }
        if graph.tasks.is_empty() {
            warnings.push("plan contains no tasks".to_string());
        }
        for task in &graph.tasks {
            if task.description.trim().is_empty() {
                warnings.push(format!("task '{}' has no description", task.id));
            }
        }

        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Turns a request into a task graph. The core never writes task content
/// itself.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, request: &PlanRequest) -> anyhow::Result<PlanOutcome>;

    async fn validate_plan(&self, graph: &TaskGraph) -> anyhow::Result<PlanValidation> {
        Ok(PlanValidation::structural(graph))
    }
}

/// Planner that hands out a prepared graph, for callers that build plans
/// themselves
pub struct StaticPlanner {
    graph: TaskGraph,
}

impl StaticPlanner {
    pub fn new(graph: TaskGraph) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn create_plan(&self, _request: &PlanRequest) -> anyhow::Result<PlanOutcome> {
        let mut graph = self.graph.clone();
        graph.id = uuid::Uuid::new_v4().to_string();
        Ok(PlanOutcome::planned(graph))
    }
}
