//! Graph execution through the ExecutorAgent with scripted collaborators

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use runbook::agent::{BufferingEventSink, DispatchContext, DispatchOutcome, OperationCall};
use runbook::{
    CapabilityRegistry, CircuitBreakerConfig, ExecutionOptions,
    ExecutorAgent, GraphStatus, InvocationBackend, InvocationRequest, InvocationResponse,
    LocalRollbackHandler, ResilientExecutor, RetryConfig, RetryHandler, RollbackAction,
    RollbackHandler, RunbookError, Task, TaskGraph, TaskStatus, TaskType,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;

use runbook::ExecutionEventKind::*;

/// Per-task script: how many attempts fail, which files get created and how
/// long each first-round invocation takes
#[derive(Default)]
struct PlanBackend {
    failing_attempts: HashMap<String, u32>,
    creates: HashMap<String, Vec<String>>,
    latency: HashMap<String, Duration>,
    started: Notify,
    attempts: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl PlanBackend {
    fn failing(mut self, task: &str, attempts: u32) -> Self {
        self.failing_attempts.insert(task.into(), attempts);
        self
    }

    fn creating(mut self, task: &str, files: &[&str]) -> Self {
        self.creates
            .insert(task.into(), files.iter().map(|f| f.to_string()).collect());
        self
    }

    fn slow(mut self, task: &str, latency: Duration) -> Self {
        self.latency.insert(task.into(), latency);
        self
    }

    fn attempts(&self, task: &str) -> u32 {
        self.attempts.lock().get(task).copied().unwrap_or(0)
    }

    fn requested(&self, task: &str) -> bool {
        self.requests.lock().iter().any(|t| t == task)
    }
}

#[async_trait]
impl InvocationBackend for PlanBackend {
    fn service_key(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvocationRequest) -> runbook::Result<InvocationResponse> {
        let task = request.task_id.as_str();
        self.requests.lock().push(task.to_string());
        if request.iteration > 1 {
            return Ok(InvocationResponse::text(format!("{} done", task)));
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(task.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(latency) = self.latency.get(task) {
            self.started.notify_one();
            tokio::time::sleep(*latency).await;
        }

        let fails = self.failing_attempts.get(task).copied().unwrap_or(0);
        let calls = if attempt <= fails {
            vec![OperationCall::new("fail", json!({}))]
        } else {
            self.creates
                .get(task)
                .map(|files| {
                    files
                        .iter()
                        .map(|f| OperationCall::new("create", json!({ "path": f })))
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(InvocationResponse::with_calls("working", calls))
    }
}

/// `create` writes the file when a project root is set and records its deletion
struct FileRegistry;

#[async_trait]
impl CapabilityRegistry for FileRegistry {
    async fn dispatch(
        &self,
        call: &OperationCall,
        ctx: &DispatchContext,
    ) -> anyhow::Result<DispatchOutcome> {
        match call.name.as_str() {
            "create" => {
                let path = call.arguments["path"].as_str().unwrap_or_default().to_string();
                if let Some(root) = &ctx.project_root {
                    tokio::fs::write(root.join(&path), "generated").await?;
                }
                Ok(DispatchOutcome::ok(json!({ "path": path }))
                    .with_rollback(RollbackAction::DeleteFile { path }))
            }
            "fail" => Ok(DispatchOutcome::failed("compile error")),
            other => anyhow::bail!("unknown operation {}", other),
        }
    }
}

#[derive(Default)]
struct RecordingRollback {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl RollbackHandler for RecordingRollback {
    async fn apply(&self, action: &RollbackAction) -> anyhow::Result<()> {
        self.applied.lock().push(action.describe());
        Ok(())
    }
}

fn agent(backend: Arc<PlanBackend>, rollback: Arc<dyn RollbackHandler>) -> ExecutorAgent {
    let resilience = ResilientExecutor::new(
        RetryHandler::new(RetryConfig::new(0).with_jitter(false)),
        CircuitBreakerConfig::default(),
    );
    ExecutorAgent::new(backend, Arc::new(FileRegistry), rollback)
        .with_resilience(Arc::new(resilience))
}

fn options() -> ExecutionOptions {
    ExecutionOptions::default()
        .with_max_retries(0)
        .with_retry_delay(Duration::from_millis(10))
}

fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, TaskType::FileCreate, format!("Task {}", id))
        .with_dependencies(deps.iter().copied())
}

fn graph(tasks: Vec<Task>) -> TaskGraph {
    let mut graph = TaskGraph::new("plan");
    for t in tasks {
        graph.add_task(t).unwrap();
    }
    graph
}

/// maxRetries=2 and always failing: three attempts, two retry events
#[tokio::test(start_paused = true)]
async fn test_retry_budget_attempts() {
    let backend = Arc::new(PlanBackend::default().failing("a", u32::MAX));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]).with_max_retries(2)]);

    let result = agent.execute_plan(&mut graph, &options(), &sink).await.unwrap();

    assert_eq!(backend.attempts("a"), 3);
    assert_eq!(sink.count(TaskRetry), 2);
    let kinds: Vec<_> = sink.for_task("a").iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![TaskStarted, TaskRetry, TaskRetry, TaskFailed]);

    let a = graph.task("a").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 3);
    assert!(a.error.as_deref().unwrap().contains("compile error"));
    assert!(!result.success);
    assert_eq!(result.failed_tasks, vec!["a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_options_budget_applies_when_larger() {
    let backend = Arc::new(PlanBackend::default().failing("a", 2));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[])]);

    let result = agent
        .execute_plan(&mut graph, &options().with_max_retries(3), &sink)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(backend.attempts("a"), 3);
    assert_eq!(sink.count(TaskRetry), 2);
    assert_eq!(graph.task("a").unwrap().status, TaskStatus::Completed);
}

/// A fails with stop_on_failure: B is skipped, the graph fails and rollback
/// runs over an empty completed set
#[tokio::test(start_paused = true)]
async fn test_stop_on_failure_skips_dependents() {
    let backend = Arc::new(PlanBackend::default().failing("a", u32::MAX));
    let rollback = Arc::new(RecordingRollback::default());
    let agent = agent(backend.clone(), rollback.clone());
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"])]);

    let result = agent.execute_plan(&mut graph, &options(), &sink).await.unwrap();

    assert_eq!(graph.status, GraphStatus::Failed);
    assert_eq!(graph.task("b").unwrap().status, TaskStatus::Skipped);
    assert_eq!(result.skipped_tasks, vec!["b".to_string()]);
    assert!(!backend.requested("b"));

    let rollback_result = result.rollback.unwrap();
    assert!(rollback_result.success);
    assert!(rollback_result.rolled_back_tasks.is_empty());
    assert!(rollback.applied.lock().is_empty());

    assert_eq!(
        sink.kinds(),
        vec![GraphStarted, TaskStarted, TaskFailed, TaskSkipped, GraphFailed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_rolls_back_completed_work_most_recent_first() {
    let backend = Arc::new(
        PlanBackend::default()
            .creating("scaffold", &["x", "y"])
            .creating("config", &["z"])
            .failing("build", u32::MAX),
    );
    let rollback = Arc::new(RecordingRollback::default());
    let agent = agent(backend, rollback.clone());
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![
        task("scaffold", &[]),
        task("config", &["scaffold"]),
        task("build", &["config"]),
        task("deploy", &["build"]),
    ]);

    let result = agent.execute_plan(&mut graph, &options(), &sink).await.unwrap();

    let rollback_result = result.rollback.unwrap();
    assert_eq!(
        rollback_result.rolled_back_tasks,
        vec!["config".to_string(), "scaffold".to_string()]
    );
    assert_eq!(
        *rollback.applied.lock(),
        vec!["delete_file(z)", "delete_file(y)", "delete_file(x)"]
    );
    assert_eq!(graph.completed_tasks, vec!["scaffold".to_string(), "config".to_string()]);
    assert!(!graph.task("scaffold").unwrap().has_rollback_actions());

    // Nothing left to undo
    let again = agent.rollback(&mut graph, None).await;
    assert!(again.success);
    assert!(again.rolled_back_tasks.is_empty());
    assert_eq!(rollback.applied.lock().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_continue_on_failure_runs_independent_tasks() {
    let backend = Arc::new(PlanBackend::default().failing("a", u32::MAX));
    let rollback = Arc::new(RecordingRollback::default());
    let agent = agent(backend.clone(), rollback);
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"]), task("c", &[])]);

    let result = agent
        .execute_plan(&mut graph, &options().with_stop_on_failure(false), &sink)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.rollback.is_none());
    assert_eq!(result.completed_tasks, vec!["c".to_string()]);
    assert_eq!(result.skipped_tasks, vec!["b".to_string()]);
    assert_eq!(graph.status, GraphStatus::Failed);
    assert_eq!(sink.count(GraphFailed), 1);
    assert_eq!(sink.count(GraphCompleted), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_before_next_task() {
    let backend = Arc::new(PlanBackend::default().slow("b", Duration::from_secs(5)));
    let rollback = Arc::new(RecordingRollback::default());
    let agent = agent(backend.clone(), rollback.clone());
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
    let opts = options();

    let (result, _) = tokio::join!(agent.execute_plan(&mut graph, &opts, &sink), async {
        backend.started.notified().await;
        agent.cancel();
    });
    let result = result.unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.rollback.is_none());
    assert!(rollback.applied.lock().is_empty());
    assert_eq!(graph.status, GraphStatus::Cancelled);
    assert_eq!(graph.task("b").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(graph.task("c").unwrap().status, TaskStatus::Pending);
    assert!(!backend.requested("c"));

    let kinds = sink.kinds();
    assert_eq!(kinds.last(), Some(&GraphCancelled));
    assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
}

/// A cancel during the retry delay ends the task without another attempt
#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay() {
    let backend = Arc::new(PlanBackend::default().failing("a", 1));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]).with_max_retries(3), task("b", &["a"])]);
    let opts = options().with_retry_delay(Duration::from_secs(10));

    let started = Instant::now();
    let (result, _) = tokio::join!(agent.execute_plan(&mut graph, &opts, &sink), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.attempts("a"), 1);
        agent.cancel();
    });
    let result = result.unwrap();

    assert!(result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(backend.attempts("a"), 1);
    let a = graph.task("a").unwrap();
    assert_eq!(a.status, TaskStatus::Cancelled);
    assert_eq!(a.error.as_deref(), Some("Operation was cancelled: task 'a'"));
    assert_eq!(graph.task("b").unwrap().status, TaskStatus::Pending);
    assert_eq!(sink.count(TaskRetry), 0);
    assert_eq!(sink.count(GraphCancelled), 1);
    assert_eq!(sink.kinds().last(), Some(&GraphCancelled));

    // The cancel ended with the run; the next run starts clean
    let rerun = agent
        .execute_plan(&mut graph, &opts, &BufferingEventSink::new())
        .await
        .unwrap();
    assert!(rerun.success);
    assert!(!rerun.cancelled);
    assert_eq!(backend.attempts("a"), 2);
}

/// Running a finished graph again restores every task's retry budget
#[tokio::test(start_paused = true)]
async fn test_rerun_gets_full_retry_budget() {
    let backend = Arc::new(PlanBackend::default().failing("a", u32::MAX));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let mut graph = graph(vec![task("a", &[]).with_max_retries(2), task("b", &["a"])]);

    let first = BufferingEventSink::new();
    agent.execute_plan(&mut graph, &options(), &first).await.unwrap();
    assert_eq!(backend.attempts("a"), 3);
    assert_eq!(graph.status, GraphStatus::Failed);

    let second = BufferingEventSink::new();
    let result = agent.execute_plan(&mut graph, &options(), &second).await.unwrap();

    assert_eq!(backend.attempts("a"), 6);
    assert_eq!(second.count(TaskRetry), 2);
    let a = graph.task("a").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 3);
    assert_eq!(result.failed_tasks, vec!["a".to_string()]);
    assert_eq!(result.skipped_tasks, vec!["b".to_string()]);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("Task error: a - "));
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_next_task_until_resume() {
    let backend = Arc::new(PlanBackend::default().slow("a", Duration::from_secs(1)));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"])]);
    let opts = options();

    let (result, _) = tokio::join!(agent.execute_plan(&mut graph, &opts, &sink), async {
        backend.started.notified().await;
        assert!(agent.pause());
        tokio::time::sleep(Duration::from_secs(30)).await;
        // a finished while paused, b has not started
        assert_eq!(sink.count(TaskCompleted), 1);
        assert!(!backend.requested("b"));
        assert!(agent.resume());
    });

    assert!(result.unwrap().success);
    assert_eq!(graph.status, GraphStatus::Completed);
    assert!(backend.requested("b"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_paused() {
    let backend = Arc::new(PlanBackend::default().slow("a", Duration::from_secs(1)));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"])]);
    let opts = options();

    let (result, _) = tokio::join!(agent.execute_plan(&mut graph, &opts, &sink), async {
        backend.started.notified().await;
        agent.pause();
        tokio::time::sleep(Duration::from_secs(10)).await;
        agent.cancel();
    });

    let result = result.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.completed_tasks, vec!["a".to_string()]);
    assert_eq!(graph.task("b").unwrap().status, TaskStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_never_calls_out() {
    let backend = Arc::new(PlanBackend::default().failing("a", u32::MAX));
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &[]), task("b", &["a"])]);

    let result = agent
        .execute_plan(&mut graph, &options().with_dry_run(true), &sink)
        .await
        .unwrap();

    assert!(result.success);
    assert!(backend.requests.lock().is_empty());
    let a = graph.task("a").unwrap();
    assert!(a.result.as_ref().unwrap().output.dry_run);
    assert_eq!(graph.completed_tasks.len(), 2);
}

#[tokio::test]
async fn test_invalid_graph_is_rejected_before_any_event() {
    let backend = Arc::new(PlanBackend::default());
    let agent = agent(backend.clone(), Arc::new(RecordingRollback::default()));
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("a", &["b"]), task("b", &["a"])]);

    let err = agent
        .execute_plan(&mut graph, &options(), &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, RunbookError::CyclicDependency { .. }));
    assert!(sink.events().is_empty());
    assert!(backend.requests.lock().is_empty());
}

#[tokio::test]
async fn test_files_are_removed_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let root: PathBuf = dir.path().to_path_buf();
    let backend = Arc::new(
        PlanBackend::default()
            .creating("write", &["main.rs", "lib.rs"])
            .failing("check", u32::MAX),
    );
    let agent = agent(backend, Arc::new(LocalRollbackHandler::new(&root)))
        .with_project_root(&root);
    let sink = BufferingEventSink::new();
    let mut graph = graph(vec![task("write", &[]), task("check", &["write"])]);

    let result = agent
        .execute_plan(&mut graph, &options().with_retry_delay(Duration::ZERO), &sink)
        .await
        .unwrap();

    let write = graph.task("write").unwrap();
    assert_eq!(
        write.result.as_ref().unwrap().output.created_files,
        vec!["main.rs", "lib.rs"]
    );
    assert!(result.rollback.unwrap().success);
    assert!(!root.join("main.rs").exists());
    assert!(!root.join("lib.rs").exists());
}
