//! Task graph data model
//!
//! A `TaskGraph` owns its tasks and the bookkeeping the executor updates while
//! running it. Tasks are never shared between graphs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{Result, RunbookError};

pub type TaskId = String;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analysis,
    CodeGeneration,
    FileCreate,
    FileModify,
    FileDelete,
    Command,
    DependencyInstall,
    Test,
    Review,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analysis",
            TaskType::CodeGeneration => "code_generation",
            TaskType::FileCreate => "file_create",
            TaskType::FileModify => "file_modify",
            TaskType::FileDelete => "file_delete",
            TaskType::Command => "command",
            TaskType::DependencyInstall => "dependency_install",
            TaskType::Test => "test",
            TaskType::Review => "review",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    fn stage(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::InProgress => 2,
            _ => 3,
        }
    }

    /// Statuses only move forward; `in_progress -> in_progress` is a retry
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == TaskStatus::InProgress && next == TaskStatus::InProgress {
            return true;
        }
        !self.is_terminal() && next.stage() > self.stage()
    }
}

/// A compensating action recorded when a task performs a reversible side effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackAction {
    /// Write `backup` (the original contents) back to `path`
    RestoreFile { path: String, backup: String },
    DeleteFile { path: String },
    DeleteDirectory { path: String },
    RunCommand { command: String },
}

impl RollbackAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RollbackAction::RestoreFile { .. } => "restore_file",
            RollbackAction::DeleteFile { .. } => "delete_file",
            RollbackAction::DeleteDirectory { .. } => "delete_directory",
            RollbackAction::RunCommand { .. } => "run_command",
        }
    }

    /// Short human-readable form used in logs and error strings
    pub fn describe(&self) -> String {
        match self {
            RollbackAction::RestoreFile { path, .. } => format!("restore_file({})", path),
            RollbackAction::DeleteFile { path } => format!("delete_file({})", path),
            RollbackAction::DeleteDirectory { path } => format!("delete_directory({})", path),
            RollbackAction::RunCommand { command } => format!("run_command({})", command),
        }
    }
}

/// Outcome of one dispatched operation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub call_id: String,
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Data produced by a task run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Freeform output from the final invocation round
    pub content: String,
    pub created_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub created_directories: Vec<String>,
    pub operations: Vec<OperationRecord>,
    pub iterations: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: TaskOutput,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn failure(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: TaskOutput::default(),
            error: Some(message.into()),
            duration_ms,
        }
    }

    /// Compact text form fed to dependent tasks, truncated to `max_chars`
    pub fn summarize(&self, max_chars: usize) -> String {
        let mut summary = String::new();
        if !self.output.content.is_empty() {
            summary.push_str(&self.output.content);
        }
        if !self.output.created_files.is_empty() {
            summary.push_str(&format!(
                "\ncreated: {}",
                self.output.created_files.join(", ")
            ));
        }
        if !self.output.modified_files.is_empty() {
            summary.push_str(&format!(
                "\nmodified: {}",
                self.output.modified_files.join(", ")
            ));
        }
        if summary.chars().count() > max_chars {
            let truncated: String = summary.chars().take(max_chars).collect();
            format!("{}...", truncated)
        } else {
            summary
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Free-form parameters handed to the invocation backend
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Most recent side effect first
    #[serde(default)]
    pub rollback_actions: Vec<RollbackAction>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: TaskType, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            task_type,
            description: name.clone(),
            name,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            input: Value::Null,
            retry_count: 0,
            max_retries: 0,
            rollback_actions: Vec::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set dependencies, dropping duplicate ids
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.clear();
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Move to `next`, rejecting backwards transitions
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RunbookError::validation_task(
                format!("invalid status transition {:?} -> {:?}", self.status, next),
                self.id.clone(),
            ));
        }
        match next {
            TaskStatus::InProgress if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn has_rollback_actions(&self) -> bool {
        !self.rollback_actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    #[default]
    Pending,
    Planning,
    Ready,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl GraphStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphStatus::Completed | GraphStatus::Failed | GraphStatus::Cancelled
        )
    }
}

/// Counts used for progress reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    #[serde(default = "new_graph_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Technology stack the plan targets, checked against orchestrator modes
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Completion order is preserved; rollback depends on it
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub failed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub skipped_tasks: Vec<TaskId>,
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    #[serde(default)]
    pub status: GraphStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn new_graph_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: new_graph_id(),
            description: name.clone(),
            name,
            stack: None,
            tasks: Vec::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            current_task_id: None,
            status: GraphStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Builder-style `add_task`
    pub fn with_task(mut self, task: Task) -> Result<Self> {
        self.add_task(task)?;
        Ok(self)
    }

    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.contains(&task.id) {
            return Err(RunbookError::validation_task(
                format!("duplicate task id '{}'", task.id),
                task.id.clone(),
            ));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t.id == task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|id| id == task_id)
    }

    pub fn is_failed(&self, task_id: &str) -> bool {
        self.failed_tasks.iter().any(|id| id == task_id)
    }

    pub fn is_skipped(&self, task_id: &str) -> bool {
        self.skipped_tasks.iter().any(|id| id == task_id)
    }

    fn forget_outcome(&mut self, task_id: &str) {
        self.completed_tasks.retain(|id| id != task_id);
        self.failed_tasks.retain(|id| id != task_id);
        self.skipped_tasks.retain(|id| id != task_id);
    }

    /// Record a completion; the id leaves the other bookkeeping sets
    pub fn mark_completed(&mut self, task_id: &str) {
        self.forget_outcome(task_id);
        self.completed_tasks.push(task_id.to_string());
    }

    pub fn mark_failed(&mut self, task_id: &str) {
        self.forget_outcome(task_id);
        self.failed_tasks.push(task_id.to_string());
    }

    pub fn mark_skipped(&mut self, task_id: &str) {
        self.forget_outcome(task_id);
        self.skipped_tasks.push(task_id.to_string());
    }

    /// Every task either completed or was skipped
    pub fn all_settled_successfully(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| self.is_completed(&t.id) || self.is_skipped(&t.id))
    }

    /// Results of the given task's dependencies that have one
    pub fn dependency_results(&self, task: &Task) -> Vec<(&Task, &TaskResult)> {
        task.depends_on
            .iter()
            .filter_map(|dep_id| self.task(dep_id))
            .filter_map(|dep| dep.result.as_ref().map(|r| (dep, r)))
            .collect()
    }

    pub fn progress(&self) -> GraphProgress {
        let total = self.tasks.len();
        let completed = self.completed_tasks.len();
        let failed = self.failed_tasks.len();
        let skipped = self.skipped_tasks.len();
        let settled = completed + failed + skipped;
        GraphProgress {
            total,
            completed,
            failed,
            skipped,
            remaining: total.saturating_sub(settled),
            percent: if total == 0 {
                100.0
            } else {
                settled as f64 * 100.0 / total as f64
            },
        }
    }

    /// Return every task and the bookkeeping to their initial state
    pub fn reset_for_execution(&mut self) {
        for task in &mut self.tasks {
            task.status = TaskStatus::Pending;
            task.retry_count = 0;
            task.result = None;
            task.error = None;
            task.started_at = None;
            task.completed_at = None;
        }
        self.completed_tasks.clear();
        self.failed_tasks.clear();
        self.skipped_tasks.clear();
        self.current_task_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.status = GraphStatus::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_transitions_move_forward() {
        let mut task = Task::new("a", TaskType::Analysis, "Analyze");
        task.transition(TaskStatus::Queued).unwrap();
        task.transition(TaskStatus::InProgress).unwrap();
        task.transition(TaskStatus::InProgress).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());

        assert!(task.transition(TaskStatus::InProgress).is_err());
        assert!(task.transition(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_queued_cannot_go_back_to_pending() {
        let mut task = Task::new("a", TaskType::Analysis, "Analyze");
        task.transition(TaskStatus::Queued).unwrap();
        assert!(task.transition(TaskStatus::Pending).is_err());
        assert!(task.transition(TaskStatus::Queued).is_err());
        task.transition(TaskStatus::Skipped).unwrap();
    }

    #[test]
    fn test_with_dependencies_dedupes() {
        let task = Task::new("c", TaskType::Test, "Test").with_dependencies(["a", "b", "a"]);
        assert_eq!(task.depends_on, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_bookkeeping_sets_do_not_overlap() {
        let mut graph = TaskGraph::new("plan");
        graph.add_task(Task::new("a", TaskType::Analysis, "A")).unwrap();
        graph.mark_failed("a");
        graph.mark_completed("a");
        assert_eq!(graph.completed_tasks, vec!["a".to_string()]);
        assert!(graph.failed_tasks.is_empty());
        assert!(graph.all_settled_successfully());
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut graph = TaskGraph::new("plan");
        graph.add_task(Task::new("a", TaskType::Analysis, "A")).unwrap();
        let err = graph
            .add_task(Task::new("a", TaskType::Review, "A again"))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_progress() {
        let mut graph = TaskGraph::new("plan");
        for id in ["a", "b", "c", "d"] {
            graph.add_task(Task::new(id, TaskType::Analysis, id)).unwrap();
        }
        graph.mark_completed("a");
        graph.mark_skipped("b");
        let progress = graph.progress();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.remaining, 2);
        assert_eq!(progress.percent, 50.0);
    }

    #[test]
    fn test_summary_truncates() {
        let result = TaskResult {
            success: true,
            output: TaskOutput {
                content: "x".repeat(50),
                created_files: vec!["src/main.rs".into()],
                ..Default::default()
            },
            error: None,
            duration_ms: 1,
        };
        let summary = result.summarize(10);
        assert_eq!(summary, format!("{}...", "x".repeat(10)));
        assert!(result.summarize(1000).contains("created: src/main.rs"));
    }

    #[test]
    fn test_rollback_action_serializes_tagged() {
        let action = RollbackAction::DeleteFile {
            path: "out.txt".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "delete_file");
        assert_eq!(json["path"], "out.txt");
    }
}
