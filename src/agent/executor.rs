//! Task and graph execution
//!
//! `execute_task` runs one task through a bounded invocation loop against the
//! backend and capability registry. `execute_plan` walks a whole graph in
//! dependency order with retries, dependency skipping, pause/cancel handling
//! and rollback when a failure stops the run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::collaborators::{
    CallOutcome, CapabilityRegistry, DependencySummary, DispatchContext, DispatchOutcome,
    InvocationBackend, InvocationRequest, InvocationResponse, OperationCall, RollbackHandler,
};
use crate::agent::control::{ControlSignal, ExecutionControl};
use crate::agent::events::{EventSink, ExecutionEventKind, RunEmitter};
use crate::agent::rollback::{rollback_graph, RollbackResult};
use crate::core::config::{AgentConfig, ExecutionDefaults};
use crate::core::errors::{Result, RunbookError};
use crate::graph::model::{
    GraphStatus, OperationRecord, RollbackAction, Task, TaskGraph, TaskId, TaskOutput, TaskResult,
    TaskStatus,
};
use crate::graph::topo::sorted_ids;
use crate::resilience::executor::ResilientExecutor;

/// Per-run settings for `execute_plan`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Retry floor; a task's own `max_retries` wins when larger
    pub max_retries: u32,
    pub stop_on_failure: bool,
    pub retry_delay: Duration,
    /// Settle every task as a synthetic success without calling out
    pub dry_run: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from(&ExecutionDefaults::default())
    }
}

impl From<&ExecutionDefaults> for ExecutionOptions {
    fn from(defaults: &ExecutionDefaults) -> Self {
        Self {
            max_retries: defaults.max_retries,
            stop_on_failure: defaults.stop_on_failure,
            retry_delay: defaults.retry_delay(),
            dry_run: defaults.dry_run,
        }
    }
}

impl ExecutionOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Final report of one graph run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub run_id: String,
    pub task_graph: TaskGraph,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub skipped_tasks: Vec<TaskId>,
    pub total_time_ms: u64,
    pub errors: Vec<String>,
    pub cancelled: bool,
    /// Present when a failure stopped the run and completed work was undone
    pub rollback: Option<RollbackResult>,
}

/// What `execute_task` knows beyond the task itself
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub dependencies: Vec<DependencySummary>,
    pub dry_run: bool,
}

impl TaskContext {
    /// Summaries of the dependency results already recorded in `graph`
    pub fn from_graph(graph: &TaskGraph, task: &Task, max_chars: usize) -> Self {
        let dependencies = graph
            .dependency_results(task)
            .into_iter()
            .map(|(dep, result)| DependencySummary {
                task_id: dep.id.clone(),
                name: dep.name.clone(),
                summary: result.summarize(max_chars),
            })
            .collect();
        Self {
            dependencies,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

enum TaskRun {
    Completed,
    Failed(RunbookError),
    Cancelled,
}

enum RunStop {
    Finished,
    Failed(TaskId),
    Cancelled,
}

fn advance(task: &mut Task, status: TaskStatus) {
    if let Err(e) = task.transition(status) {
        warn!(task_id = %task.id, error = %e, "Ignoring invalid status change");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Artifact lists derived from recorded compensations, in dispatch order
fn artifacts_from(actions: &[RollbackAction], output: &mut TaskOutput) {
    fn push_unique(list: &mut Vec<String>, path: &str) {
        if !list.iter().any(|p| p == path) {
            list.push(path.to_string());
        }
    }
    for action in actions {
        match action {
            RollbackAction::DeleteFile { path } => push_unique(&mut output.created_files, path),
            RollbackAction::RestoreFile { path, .. } => {
                push_unique(&mut output.modified_files, path)
            }
            RollbackAction::DeleteDirectory { path } => {
                push_unique(&mut output.created_directories, path)
            }
            RollbackAction::RunCommand { .. } => {}
        }
    }
}

/// Store new compensations ahead of older ones, most recent effect first
fn record_rollback_actions(task: &mut Task, mut actions: Vec<RollbackAction>) {
    if actions.is_empty() {
        return;
    }
    actions.reverse();
    actions.append(&mut task.rollback_actions);
    task.rollback_actions = actions;
}

pub struct ExecutorAgent {
    backend: Arc<dyn InvocationBackend>,
    registry: Arc<dyn CapabilityRegistry>,
    rollback_handler: Arc<dyn RollbackHandler>,
    resilience: Arc<ResilientExecutor>,
    config: AgentConfig,
    control: ExecutionControl,
    project_root: Option<PathBuf>,
}

impl ExecutorAgent {
    pub fn new(
        backend: Arc<dyn InvocationBackend>,
        registry: Arc<dyn CapabilityRegistry>,
        rollback_handler: Arc<dyn RollbackHandler>,
    ) -> Self {
        Self {
            backend,
            registry,
            rollback_handler,
            resilience: Arc::new(ResilientExecutor::default()),
            config: AgentConfig::default(),
            control: ExecutionControl::new(),
            project_root: None,
        }
    }

    pub fn with_resilience(mut self, resilience: Arc<ResilientExecutor>) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn resilience(&self) -> &Arc<ResilientExecutor> {
        &self.resilience
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn cancel(&self) {
        self.control.cancel()
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResponse> {
        self.resilience
            .execute(
                self.backend.service_key(),
                self.config.estimated_tokens_per_request,
                || self.backend.invoke(request),
            )
            .await
    }

    async fn dispatch_one(
        &self,
        call: &OperationCall,
        ctx: &DispatchContext,
        timeout: Duration,
    ) -> (CallOutcome, Option<RollbackAction>) {
        let outcome = match tokio::time::timeout(timeout, self.registry.dispatch(call, ctx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => DispatchOutcome::failed(format!("{:#}", e)),
            Err(_) => DispatchOutcome::failed(format!(
                "operation '{}' timed out after {}ms",
                call.name,
                timeout.as_millis()
            )),
        };
        debug!(
            task_id = %ctx.task_id,
            operation = %call.name,
            success = outcome.success,
            "Operation dispatched"
        );
        (
            CallOutcome {
                call_id: call.id.clone(),
                name: call.name.clone(),
                success: outcome.success,
                data: outcome.data,
                error: outcome.error,
            },
            outcome.rollback,
        )
    }

    /// Dispatch one round of calls, at most `max_parallel_calls` at a time.
    /// Outcomes come back in call order.
    async fn dispatch_round(
        &self,
        calls: &[OperationCall],
        ctx: &DispatchContext,
    ) -> Vec<(CallOutcome, Option<RollbackAction>)> {
        let timeout = self.config.call_timeout();
        stream::iter(calls.iter().map(|call| self.dispatch_one(call, ctx, timeout)))
            .buffered(self.config.max_parallel_calls.max(1))
            .collect()
            .await
    }

    /// Run one task to completion. Never returns an error: a failing backend
    /// becomes a failed result carrying its message.
    ///
    /// Compensations reported by dispatched calls are prepended to
    /// `task.rollback_actions`, most recent effect first.
    pub async fn execute_task(&self, task: &mut Task, ctx: &TaskContext) -> TaskResult {
        let started = Instant::now();

        if ctx.dry_run {
            debug!(task_id = %task.id, "Dry run, skipping invocation");
            return TaskResult {
                success: true,
                output: TaskOutput {
                    content: format!("[dry run] {}", task.name),
                    dry_run: true,
                    ..Default::default()
                },
                error: None,
                duration_ms: 0,
            };
        }

        info!(task_id = %task.id, task_type = %task.task_type, "Executing task");

        let mut history: Vec<CallOutcome> = Vec::new();
        let mut operations = Vec::new();
        let mut actions = Vec::new();
        let mut failures = Vec::new();
        let mut content = String::new();
        let mut iterations = 0;
        let mut channel_error = None;
        let available = self.registry.operations();

        for iteration in 1..=self.config.max_iterations {
            iterations = iteration;
            let request = InvocationRequest {
                task_id: task.id.clone(),
                task_type: task.task_type,
                name: task.name.clone(),
                description: task.description.clone(),
                input: task.input.clone(),
                dependencies: ctx.dependencies.clone(),
                history: history.clone(),
                iteration,
                operations: available.clone(),
            };

            let response = match self.invoke(&request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(task_id = %task.id, iteration, error = %e, "Invocation failed");
                    channel_error = Some(e.to_string());
                    break;
                }
            };
            content = response.content;
            if response.calls.is_empty() {
                break;
            }

            let dispatch_ctx = DispatchContext {
                task_id: task.id.clone(),
                task_type: task.task_type,
                iteration,
                project_root: self.project_root.clone(),
            };
            for (outcome, rollback) in self.dispatch_round(&response.calls, &dispatch_ctx).await {
                if let Some(action) = rollback {
                    actions.push(action);
                }
                if !outcome.success {
                    failures.push(format!(
                        "{}: {}",
                        outcome.name,
                        outcome.error.as_deref().unwrap_or("operation failed")
                    ));
                }
                operations.push(OperationRecord {
                    call_id: outcome.call_id.clone(),
                    name: outcome.name.clone(),
                    success: outcome.success,
                    error: outcome.error.clone(),
                });
                history.push(outcome);
            }

            if iteration == self.config.max_iterations {
                warn!(task_id = %task.id, iterations, "Iteration ceiling reached");
            }
        }

        let mut output = TaskOutput {
            content,
            operations,
            iterations,
            ..Default::default()
        };
        artifacts_from(&actions, &mut output);
        record_rollback_actions(task, actions);

        let error = match channel_error {
            Some(e) => Some(e),
            None if failures.is_empty() => None,
            None => Some(failures.join("; ")),
        };
        TaskResult {
            success: error.is_none(),
            output,
            error,
            duration_ms: elapsed_ms(started),
        }
    }

    fn skip_task(
        &self,
        graph: &mut TaskGraph,
        task_id: &str,
        reason: String,
        emitter: &mut RunEmitter<'_>,
    ) {
        if let Some(task) = graph.task_mut(task_id) {
            advance(task, TaskStatus::Skipped);
            task.error = Some(reason.clone());
        }
        graph.mark_skipped(task_id);
        info!(task_id = %task_id, reason = %reason, "Task skipped");
        emitter.emit(
            ExecutionEventKind::TaskSkipped,
            Some(task_id),
            json!({ "reason": reason }),
        );
    }

    fn cancel_task(&self, graph: &mut TaskGraph, task_id: &str) {
        let cancelled = RunbookError::cancelled(format!("task '{}'", task_id));
        if let Some(task) = graph.task_mut(task_id) {
            advance(task, TaskStatus::Cancelled);
            task.error = Some(cancelled.to_string());
        }
        info!(task_id = %task_id, "Task cancelled");
    }

    /// Sleep out the retry delay; false if cancelled meanwhile
    async fn retry_pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.cancelled() => {}
        }
        !self.control.is_cancelled()
    }

    async fn run_task(
        &self,
        graph: &mut TaskGraph,
        task_id: &str,
        options: &ExecutionOptions,
        emitter: &mut RunEmitter<'_>,
    ) -> TaskRun {
        let Some(task) = graph.task_mut(task_id) else {
            return TaskRun::Failed(RunbookError::task(task_id, "task not found"));
        };
        advance(task, TaskStatus::Queued);
        advance(task, TaskStatus::InProgress);
        // Fixed for the whole run of this task
        let budget = task.max_retries.max(options.max_retries);
        let started_data = json!({
            "name": task.name,
            "type": task.task_type,
            "max_retries": budget,
        });
        graph.current_task_id = Some(task_id.to_string());
        emitter.emit(ExecutionEventKind::TaskStarted, Some(task_id), started_data);

        loop {
            let ctx = match graph.task(task_id) {
                Some(task) => {
                    TaskContext::from_graph(graph, task, self.config.max_dependency_summary_chars)
                        .with_dry_run(options.dry_run)
                }
                None => return TaskRun::Failed(RunbookError::task(task_id, "task not found")),
            };
            let Some(task) = graph.task_mut(task_id) else {
                return TaskRun::Failed(RunbookError::task(task_id, "task not found"));
            };
            let result = self.execute_task(task, &ctx).await;

            if self.control.is_cancelled() {
                // Whatever the in-flight attempt produced is discarded
                self.cancel_task(graph, task_id);
                return TaskRun::Cancelled;
            }

            let Some(task) = graph.task_mut(task_id) else {
                return TaskRun::Failed(RunbookError::task(task_id, "task not found"));
            };

            if result.success {
                let attempts = task.retry_count + 1;
                let completed_data = json!({
                    "duration_ms": result.duration_ms,
                    "attempts": attempts,
                    "created_files": result.output.created_files,
                    "modified_files": result.output.modified_files,
                    "dry_run": result.output.dry_run,
                });
                task.error = None;
                task.result = Some(result);
                advance(task, TaskStatus::Completed);
                graph.mark_completed(task_id);
                info!(task_id = %task_id, attempts, "Task completed");
                emitter.emit(ExecutionEventKind::TaskCompleted, Some(task_id), completed_data);
                return TaskRun::Completed;
            }

            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            task.retry_count += 1;
            task.error = Some(error.clone());

            if task.retry_count <= budget {
                let attempt = task.retry_count + 1;
                warn!(
                    task_id = %task_id,
                    attempt,
                    max_retries = budget,
                    error = %error,
                    "Task failed, retrying"
                );
                if !self.retry_pause(options.retry_delay).await {
                    self.cancel_task(graph, task_id);
                    return TaskRun::Cancelled;
                }
                if let Some(task) = graph.task_mut(task_id) {
                    advance(task, TaskStatus::InProgress);
                }
                emitter.emit(
                    ExecutionEventKind::TaskRetry,
                    Some(task_id),
                    json!({
                        "attempt": attempt,
                        "max_retries": budget,
                        "error": error,
                    }),
                );
                continue;
            }

            let attempts = task.retry_count;
            task.result = Some(result);
            advance(task, TaskStatus::Failed);
            graph.mark_failed(task_id);
            let failure = RunbookError::task(task_id, error.as_str());
            error!(
                task_id = %task_id,
                attempts,
                category = failure.category(),
                error = %error,
                "Task failed"
            );
            emitter.emit(
                ExecutionEventKind::TaskFailed,
                Some(task_id),
                json!({ "error": error, "attempts": attempts }),
            );
            return TaskRun::Failed(failure);
        }
    }

    /// Execute every task of `graph` in dependency order.
    ///
    /// Structural problems (dangling dependencies, cycles) are returned as
    /// errors before anything runs. Everything after that is recorded on the
    /// graph and reported through `sink` and the returned result; exactly one
    /// terminal graph event is emitted per run.
    ///
    /// A graph that already ran is reset first, so every task gets its full
    /// retry budget again. A pause or cancel issued before the run starts
    /// applies to it; the control signal is cleared once the run ends.
    pub async fn execute_plan(
        &self,
        graph: &mut TaskGraph,
        options: &ExecutionOptions,
        sink: &dyn EventSink,
    ) -> Result<ExecutionResult> {
        let outcome = self.run_plan(graph, options, sink).await;
        self.control.reset();
        outcome
    }

    async fn run_plan(
        &self,
        graph: &mut TaskGraph,
        options: &ExecutionOptions,
        sink: &dyn EventSink,
    ) -> Result<ExecutionResult> {
        let order = sorted_ids(&graph.tasks)?;
        let started = Instant::now();
        if graph.status.is_terminal()
            || graph.tasks.iter().any(|t| t.status != TaskStatus::Pending)
        {
            debug!(graph_id = %graph.id, "Resetting graph left over from a previous run");
            graph.reset_for_execution();
        }

        let mut emitter = RunEmitter::new(sink, cuid2::create_id());
        graph.status = GraphStatus::InProgress;
        graph.started_at = Some(Utc::now());
        graph.completed_at = None;

        info!(
            graph_id = %graph.id,
            run_id = %emitter.run_id(),
            tasks = order.len(),
            dry_run = options.dry_run,
            "Starting graph execution"
        );
        emitter.emit(
            ExecutionEventKind::GraphStarted,
            None,
            json!({
                "graph_id": graph.id,
                "name": graph.name,
                "total_tasks": order.len(),
                "dry_run": options.dry_run,
            }),
        );

        let mut errors = Vec::new();
        let mut stop = RunStop::Finished;

        for task_id in &order {
            if self.control.is_paused() {
                graph.status = GraphStatus::Paused;
                info!(next_task = %task_id, "Execution paused");
            }
            if self.control.wait_while_paused().await == ControlSignal::Cancelled {
                stop = RunStop::Cancelled;
                break;
            }
            graph.status = GraphStatus::InProgress;

            let blocked_by = graph.task(task_id).and_then(|task| {
                task.depends_on
                    .iter()
                    .find(|dep| graph.is_failed(dep) || graph.is_skipped(dep))
                    .cloned()
            });
            if let Some(dep) = blocked_by {
                let reason = format!("dependency '{}' did not complete", dep);
                self.skip_task(graph, task_id, reason, &mut emitter);
                continue;
            }

            match self.run_task(graph, task_id, options, &mut emitter).await {
                TaskRun::Completed => {}
                TaskRun::Failed(failure) => {
                    errors.push(failure.to_string());
                    if options.stop_on_failure {
                        stop = RunStop::Failed(task_id.clone());
                        break;
                    }
                }
                TaskRun::Cancelled => {
                    stop = RunStop::Cancelled;
                    break;
                }
            }
        }
        graph.current_task_id = None;

        let mut rollback = None;
        let cancelled = matches!(stop, RunStop::Cancelled);
        match stop {
            RunStop::Cancelled => {
                graph.status = GraphStatus::Cancelled;
                warn!(graph_id = %graph.id, "Graph execution cancelled");
                emitter.emit(
                    ExecutionEventKind::GraphCancelled,
                    None,
                    json!({
                        "completed_tasks": graph.completed_tasks,
                        "total_time_ms": elapsed_ms(started),
                    }),
                );
            }
            RunStop::Failed(failed_id) => {
                let untouched: Vec<TaskId> = order
                    .iter()
                    .filter(|id| {
                        graph
                            .task(id)
                            .map_or(false, |t| t.status == TaskStatus::Pending)
                    })
                    .cloned()
                    .collect();
                for id in untouched {
                    let reason = format!("execution stopped after '{}' failed", failed_id);
                    self.skip_task(graph, &id, reason, &mut emitter);
                }

                let result = rollback_graph(graph, None, self.rollback_handler.as_ref()).await;
                errors.extend(result.errors.iter().map(|e| format!("rollback: {}", e)));

                graph.status = GraphStatus::Failed;
                error!(graph_id = %graph.id, failed_task = %failed_id, "Graph execution failed");
                emitter.emit(
                    ExecutionEventKind::GraphFailed,
                    None,
                    json!({
                        "failed_task": failed_id,
                        "errors": errors,
                        "rolled_back_tasks": result.rolled_back_tasks,
                        "total_time_ms": elapsed_ms(started),
                    }),
                );
                rollback = Some(result);
            }
            RunStop::Finished => {
                if graph.failed_tasks.is_empty() && graph.all_settled_successfully() {
                    graph.status = GraphStatus::Completed;
                    info!(graph_id = %graph.id, "Graph execution completed");
                    emitter.emit(
                        ExecutionEventKind::GraphCompleted,
                        None,
                        json!({
                            "completed_tasks": graph.completed_tasks.len(),
                            "skipped_tasks": graph.skipped_tasks.len(),
                            "total_time_ms": elapsed_ms(started),
                        }),
                    );
                } else {
                    graph.status = GraphStatus::Failed;
                    error!(
                        graph_id = %graph.id,
                        failed = graph.failed_tasks.len(),
                        "Graph execution finished with failures"
                    );
                    emitter.emit(
                        ExecutionEventKind::GraphFailed,
                        None,
                        json!({
                            "failed_tasks": graph.failed_tasks,
                            "errors": errors,
                            "total_time_ms": elapsed_ms(started),
                        }),
                    );
                }
            }
        }
        graph.completed_at = Some(Utc::now());

        Ok(ExecutionResult {
            success: graph.status == GraphStatus::Completed,
            run_id: emitter.run_id().to_string(),
            completed_tasks: graph.completed_tasks.clone(),
            failed_tasks: graph.failed_tasks.clone(),
            skipped_tasks: graph.skipped_tasks.clone(),
            task_graph: graph.clone(),
            total_time_ms: elapsed_ms(started),
            errors,
            cancelled,
            rollback,
        })
    }

    /// Undo completed tasks, optionally only those completed after `to_task_id`
    pub async fn rollback(&self, graph: &mut TaskGraph, to_task_id: Option<&str>) -> RollbackResult {
        rollback_graph(graph, to_task_id, self.rollback_handler.as_ref()).await
    }
}
