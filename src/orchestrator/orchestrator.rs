//! Owns the current graph and sequences planning, execution and rollback
//!
//! One graph at a time. A second `execute` while a run is active is rejected
//! with `ExecutionInProgress`. Events from the executor are folded into a
//! live state snapshot and then fanned out to every subscriber.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_broadcast::Receiver;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::events::{EventSink, ExecutionEvent, ExecutionEventKind, LoggingEventSink};
use crate::agent::executor::{ExecutionOptions, ExecutionResult, ExecutorAgent};
use crate::agent::rollback::RollbackResult;
use crate::core::config::RunbookConfig;
use crate::core::errors::{Result, RunbookError};
use crate::graph::model::{GraphProgress, GraphStatus, TaskGraph, TaskId, TaskType};
use crate::graph::topo::validate_graph;
use crate::orchestrator::bus::{EventBus, Subscription};
use crate::orchestrator::planner::{PlanRequest, PlanValidation, Planner};
use crate::resilience::circuit_breaker::CircuitSnapshot;

/// Allow-lists restricting what a plan may contain. `None` allows anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorMode {
    pub name: Option<String>,
    pub allowed_task_types: Option<Vec<TaskType>>,
    pub allowed_stacks: Option<Vec<String>>,
}

impl OrchestratorMode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_task_types(mut self, types: impl IntoIterator<Item = TaskType>) -> Self {
        self.allowed_task_types = Some(types.into_iter().collect());
        self
    }

    pub fn with_stacks<I, S>(mut self, stacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_stacks = Some(stacks.into_iter().map(Into::into).collect());
        self
    }

    /// Every violation in `graph`, empty when the graph is allowed
    pub fn violations(&self, graph: &TaskGraph) -> Vec<String> {
        let mut violations = Vec::new();
        let mode = self.name.as_deref().unwrap_or("current");

        if let (Some(allowed), Some(stack)) = (&self.allowed_stacks, &graph.stack) {
            if !allowed.iter().any(|s| s.eq_ignore_ascii_case(stack)) {
                violations.push(format!("stack '{}' is not allowed in {} mode", stack, mode));
            }
        }
        if let Some(allowed) = &self.allowed_task_types {
            for task in &graph.tasks {
                if !allowed.contains(&task.task_type) {
                    violations.push(format!(
                        "task '{}' has type '{}' which is not allowed in {} mode",
                        task.id, task.task_type, mode
                    ));
                }
            }
        }
        violations
    }

    pub fn check(&self, graph: &TaskGraph) -> Result<()> {
        let violations = self.violations(graph);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(RunbookError::validation(violations.join("; ")))
        }
    }
}

/// Live view of the orchestrator, readable while a run is in flight
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorState {
    pub graph_id: Option<String>,
    pub graph_status: Option<GraphStatus>,
    pub executing: bool,
    pub paused: bool,
    pub run_id: Option<String>,
    pub current_task_id: Option<TaskId>,
    pub progress: GraphProgress,
}

impl OrchestratorState {
    fn from_graph(graph: &TaskGraph) -> Self {
        Self {
            graph_id: Some(graph.id.clone()),
            graph_status: Some(graph.status),
            current_task_id: graph.current_task_id.clone(),
            progress: graph.progress(),
            ..Default::default()
        }
    }

    fn observe(&mut self, event: &ExecutionEvent) {
        let progress = &mut self.progress;
        match event.kind {
            ExecutionEventKind::GraphStarted => {
                self.run_id = Some(event.run_id.clone());
                self.graph_status = Some(GraphStatus::InProgress);
                *progress = GraphProgress {
                    total: event.data["total_tasks"]
                        .as_u64()
                        .map_or(progress.total, |n| n as usize),
                    ..Default::default()
                };
            }
            ExecutionEventKind::TaskStarted => self.current_task_id = event.task_id.clone(),
            ExecutionEventKind::TaskRetry => {}
            ExecutionEventKind::TaskCompleted => progress.completed += 1,
            ExecutionEventKind::TaskFailed => progress.failed += 1,
            ExecutionEventKind::TaskSkipped => progress.skipped += 1,
            ExecutionEventKind::GraphCompleted => self.graph_status = Some(GraphStatus::Completed),
            ExecutionEventKind::GraphFailed => self.graph_status = Some(GraphStatus::Failed),
            ExecutionEventKind::GraphCancelled => self.graph_status = Some(GraphStatus::Cancelled),
        }

        let settled = progress.completed + progress.failed + progress.skipped;
        progress.remaining = progress.total.saturating_sub(settled);
        progress.percent = if progress.total == 0 {
            100.0
        } else {
            settled as f64 * 100.0 / progress.total as f64
        };
        if matches!(
            event.kind,
            ExecutionEventKind::TaskCompleted
                | ExecutionEventKind::TaskFailed
                | ExecutionEventKind::TaskSkipped
        ) && self.current_task_id == event.task_id
        {
            self.current_task_id = None;
        }
        if event.kind.is_terminal() {
            self.current_task_id = None;
        }
    }
}

/// Updates the live state, logs the event, then hands it to subscribers
struct TrackingSink<'a> {
    state: &'a RwLock<OrchestratorState>,
    bus: &'a EventBus,
}

impl EventSink for TrackingSink<'_> {
    fn emit(&self, event: &ExecutionEvent) {
        self.state.write().observe(event);
        LoggingEventSink.emit(event);
        self.bus.publish(event);
    }
}

/// Clears the executing flag however `execute` exits
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    agent: Arc<ExecutorAgent>,
    planner: Arc<dyn Planner>,
    bus: EventBus,
    graph: Mutex<Option<TaskGraph>>,
    state: RwLock<OrchestratorState>,
    executing: AtomicBool,
    mode: OrchestratorMode,
    defaults: ExecutionOptions,
}

impl Orchestrator {
    pub fn new(agent: Arc<ExecutorAgent>, planner: Arc<dyn Planner>) -> Self {
        Self {
            agent,
            planner,
            bus: EventBus::default(),
            graph: Mutex::new(None),
            state: RwLock::new(OrchestratorState::default()),
            executing: AtomicBool::new(false),
            mode: OrchestratorMode::default(),
            defaults: ExecutionOptions::default(),
        }
    }

    /// Takes the mode and execution defaults from `config`
    pub fn with_config(mut self, config: &RunbookConfig) -> Self {
        self.mode = config.mode.clone();
        self.defaults = ExecutionOptions::from(&config.execution);
        self
    }

    pub fn with_mode(mut self, mode: OrchestratorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.bus = EventBus::new(capacity);
        self
    }

    pub fn mode(&self) -> &OrchestratorMode {
        &self.mode
    }

    pub fn agent(&self) -> &Arc<ExecutorAgent> {
        &self.agent
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_executing() {
            Err(RunbookError::ExecutionInProgress)
        } else {
            Ok(())
        }
    }

    async fn install(&self, graph: TaskGraph) -> TaskGraph {
        *self.state.write() = OrchestratorState::from_graph(&graph);
        let mut slot = self.graph.lock().await;
        *slot = Some(graph.clone());
        graph
    }

    /// Ask the planner for a graph, validate it and make it current
    pub async fn plan(&self, request: &PlanRequest) -> Result<TaskGraph> {
        self.ensure_idle()?;
        self.state.write().graph_status = Some(GraphStatus::Planning);
        info!(prompt_len = request.prompt.len(), stack = ?request.stack, "Planning");

        let planned = self.create_validated_plan(request).await;
        match planned {
            Ok(mut graph) => {
                graph.status = GraphStatus::Ready;
                info!(graph_id = %graph.id, tasks = graph.tasks.len(), "Plan ready");
                Ok(self.install(graph).await)
            }
            Err(e) => {
                warn!(error = %e, "Planning failed");
                // Fall back to whatever graph was current before
                let restored = match self.graph.lock().await.as_ref() {
                    Some(graph) => OrchestratorState::from_graph(graph),
                    None => OrchestratorState::default(),
                };
                *self.state.write() = restored;
                Err(e)
            }
        }
    }

    async fn create_validated_plan(&self, request: &PlanRequest) -> Result<TaskGraph> {
        let outcome = self
            .planner
            .create_plan(request)
            .await
            .map_err(|e| RunbookError::planning(format!("{:#}", e)))?;
        let mut graph = match (outcome.success, outcome.task_graph) {
            (true, Some(graph)) => graph,
            (_, _) => {
                return Err(RunbookError::planning(
                    outcome
                        .error
                        .unwrap_or_else(|| "planner returned no task graph".to_string()),
                ))
            }
        };
        if graph.stack.is_none() {
            graph.stack = request.stack.clone();
        }

        let validation = self.validate(&graph).await?;
        for warning in &validation.warnings {
            warn!(graph_id = %graph.id, warning = %warning, "Plan warning");
        }
        if !validation.valid {
            return Err(RunbookError::validation(validation.errors.join("; ")));
        }
        Ok(graph)
    }

    /// Planner checks plus structural and mode checks, merged
    async fn validate(&self, graph: &TaskGraph) -> Result<PlanValidation> {
        let mut validation = self
            .planner
            .validate_plan(graph)
            .await
            .map_err(|e| RunbookError::planning(format!("{:#}", e)))?;
        let structural = PlanValidation::structural(graph);

        for error in structural.errors.into_iter().chain(self.mode.violations(graph)) {
            if !validation.errors.contains(&error) {
                validation.errors.push(error);
            }
        }
        for warning in structural.warnings {
            if !validation.warnings.contains(&warning) {
                validation.warnings.push(warning);
            }
        }
        validation.valid = validation.errors.is_empty();
        Ok(validation)
    }

    /// Make a caller-built graph current
    pub async fn load_graph(&self, mut graph: TaskGraph) -> Result<TaskGraph> {
        self.ensure_idle()?;
        validate_graph(&graph)?;
        self.mode.check(&graph)?;
        if !graph.status.is_terminal() {
            graph.status = GraphStatus::Ready;
        }
        Ok(self.install(graph).await)
    }

    /// Re-run validation against the current graph
    pub async fn validate_current(&self) -> Result<PlanValidation> {
        let graph = self.current_graph().await.ok_or(RunbookError::NoActiveGraph)?;
        self.validate(&graph).await
    }

    /// Run the current graph. `options` defaults to the configured
    /// execution settings. A graph that already ran is reset first.
    pub async fn execute(&self, options: Option<ExecutionOptions>) -> Result<ExecutionResult> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunbookError::ExecutionInProgress);
        }
        let _guard = RunGuard(&self.executing);
        // From here on a pause or cancel belongs to this run, even while it
        // still waits for the graph
        self.agent.control().reset();

        let mut graph = self
            .graph
            .lock()
            .await
            .clone()
            .ok_or(RunbookError::NoActiveGraph)?;
        self.mode.check(&graph)?;
        if graph.status.is_terminal() || !graph.completed_tasks.is_empty() {
            graph.reset_for_execution();
        }
        let options = options.unwrap_or_else(|| self.defaults.clone());

        {
            let mut state = self.state.write();
            *state = OrchestratorState::from_graph(&graph);
            state.executing = true;
        }

        let sink = TrackingSink {
            state: &self.state,
            bus: &self.bus,
        };
        let outcome = self.agent.execute_plan(&mut graph, &options, &sink).await;

        let mut state = OrchestratorState::from_graph(&graph);
        if let Ok(result) = &outcome {
            state.run_id = Some(result.run_id.clone());
        }
        *self.state.write() = state;
        *self.graph.lock().await = Some(graph);
        outcome
    }

    /// True if the running graph will stop before its next task
    pub fn pause(&self) -> bool {
        self.is_executing() && self.agent.pause()
    }

    pub fn resume(&self) -> bool {
        self.agent.resume()
    }

    pub fn cancel(&self) {
        if self.is_executing() {
            self.agent.cancel();
        }
    }

    /// Undo completed work on the current graph
    pub async fn rollback(&self, to_task_id: Option<&str>) -> Result<RollbackResult> {
        self.ensure_idle()?;
        let mut slot = self.graph.lock().await;
        let graph = slot.as_mut().ok_or(RunbookError::NoActiveGraph)?;
        Ok(self.agent.rollback(graph, to_task_id).await)
    }

    /// Snapshot of the current graph. During a run this is the graph as it
    /// was when the run started; live progress is in `state()`.
    pub async fn current_graph(&self) -> Option<TaskGraph> {
        self.graph.lock().await.clone()
    }

    pub fn state(&self) -> OrchestratorState {
        let mut state = self.state.read().clone();
        state.executing = self.is_executing();
        state.paused = state.executing && self.agent.control().is_paused();
        if state.paused {
            state.graph_status = Some(GraphStatus::Paused);
        }
        state
    }

    /// Drop the current graph
    pub async fn clear(&self) -> Result<()> {
        self.ensure_idle()?;
        *self.graph.lock().await = None;
        *self.state.write() = OrchestratorState::default();
        Ok(())
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn stream(&self) -> Receiver<ExecutionEvent> {
        self.bus.stream()
    }

    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.agent.resilience().circuit_states()
    }
}
