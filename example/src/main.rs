use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use runbook::agent::{DispatchContext, DispatchOutcome, OperationCall};
use runbook::{
    CapabilityRegistry, ExecutionOptions, ExecutorAgent, InvocationBackend, InvocationRequest,
    InvocationResponse, LocalRollbackHandler, Orchestrator, PlanRequest, ResilientExecutor,
    RollbackAction, RunbookConfig, StaticPlanner, Task, TaskGraph, TaskType,
};
use serde_json::json;
use tokio::sync::Mutex;

const CONFIG: &str = r#"
execution:
  max_retries: 2
  retry_delay_ms: 200
agent:
  max_parallel_calls: 2
rate_limits:
  scripted:
    requests_per_minute: 30
    burst_size: 5
"#;

/// Stands in for a model backend: writes one file per task, and makes the
/// `test` task fail on its first attempt to show a retry
struct ScriptedBackend {
    attempts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl InvocationBackend for ScriptedBackend {
    fn service_key(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvocationRequest) -> runbook::Result<InvocationResponse> {
        if request.iteration > 1 {
            return Ok(InvocationResponse::text(format!("{} finished", request.name)));
        }

        let mut attempts = self.attempts.lock().await;
        let attempt = attempts.entry(request.task_id.clone()).or_insert(0);
        *attempt += 1;

        let calls = match (request.task_id.as_str(), *attempt) {
            ("test", 1) => vec![OperationCall::new("run", json!({ "command": "false" }))],
            ("test", _) => vec![OperationCall::new("run", json!({ "command": "true" }))],
            (task, _) => vec![OperationCall::new(
                "write_file",
                json!({ "path": format!("{}.md", task), "content": request.description }),
            )],
        };
        Ok(InvocationResponse::with_calls("working", calls))
    }
}

/// Minimal capability registry confined to the project root
struct DemoRegistry;

#[async_trait]
impl CapabilityRegistry for DemoRegistry {
    async fn dispatch(
        &self,
        call: &OperationCall,
        ctx: &DispatchContext,
    ) -> anyhow::Result<DispatchOutcome> {
        let root = ctx
            .project_root
            .as_ref()
            .ok_or_else(|| anyhow!("no project root"))?;
        match call.name.as_str() {
            "write_file" => {
                let path = call.arguments["path"].as_str().unwrap_or("out.md").to_string();
                let content = call.arguments["content"].as_str().unwrap_or_default();
                tokio::fs::write(root.join(&path), content).await?;
                Ok(DispatchOutcome::ok(json!({ "path": path }))
                    .with_rollback(RollbackAction::DeleteFile { path }))
            }
            "run" => match call.arguments["command"].as_str() {
                Some("true") => Ok(DispatchOutcome::ok(json!({ "exit_code": 0 }))),
                _ => Ok(DispatchOutcome::failed("command exited with 1")),
            },
            other => Ok(DispatchOutcome::failed(format!("unknown operation {}", other))),
        }
    }

    fn operations(&self) -> Vec<String> {
        vec!["write_file".into(), "run".into()]
    }
}

fn demo_plan() -> runbook::Result<TaskGraph> {
    TaskGraph::new("docs site")
        .with_stack("markdown")
        .with_task(
            Task::new("outline", TaskType::Analysis, "Outline")
                .with_description("Outline the documentation"),
        )?
        .with_task(
            Task::new("write", TaskType::FileCreate, "Write pages")
                .with_description("Write the introduction page")
                .with_dependencies(["outline"]),
        )?
        .with_task(
            Task::new("test", TaskType::Test, "Check links")
                .with_description("Check every link resolves")
                .with_dependencies(["write"]),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = RunbookConfig::from_yaml_str(CONFIG)?;
    let root: PathBuf = std::env::temp_dir().join("runbook-demo");
    tokio::fs::create_dir_all(&root).await?;

    let agent = ExecutorAgent::new(
        Arc::new(ScriptedBackend {
            attempts: Mutex::new(HashMap::new()),
        }),
        Arc::new(DemoRegistry),
        Arc::new(LocalRollbackHandler::new(&root)),
    )
    .with_resilience(Arc::new(ResilientExecutor::from_config(&config)))
    .with_config(config.agent.clone())
    .with_project_root(&root);

    let planner = StaticPlanner::new(demo_plan()?);
    let orchestrator = Orchestrator::new(Arc::new(agent), Arc::new(planner)).with_config(&config);

    let subscription = orchestrator.subscribe(|event| {
        println!(
            "[{}] {:<16} {}",
            event.sequence,
            event.kind.as_str(),
            event.task_id.as_deref().unwrap_or("-")
        );
    });

    let graph = orchestrator
        .plan(&PlanRequest::new("Write a small docs site").with_stack("markdown"))
        .await?;
    println!("Planned {} tasks for '{}'", graph.tasks.len(), graph.name);

    let result = orchestrator
        .execute(Some(ExecutionOptions::from(&config.execution)))
        .await?;
    println!(
        "success={} completed={:?} failed={:?} in {}ms",
        result.success, result.completed_tasks, result.failed_tasks, result.total_time_ms
    );

    let rollback = orchestrator.rollback(None).await?;
    println!(
        "Rolled back {:?} (errors: {})",
        rollback.rolled_back_tasks,
        rollback.errors.len()
    );
    for circuit in orchestrator.circuit_states() {
        println!("circuit {} is {}", circuit.name, circuit.state);
    }

    subscription.unsubscribe();
    Ok(())
}
