//! Compensating completed work
//!
//! Rollback is best effort. Every selected action is attempted; failures are
//! collected as strings and never stop the remaining actions.

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::collaborators::RollbackHandler;
use crate::core::errors::RunbookError;
use crate::graph::model::{RollbackAction, TaskGraph, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    /// Tasks whose actions were processed, most recently completed first
    pub rolled_back_tasks: Vec<TaskId>,
    pub errors: Vec<String>,
}

/// Completed tasks that still own rollback actions, most recent first.
///
/// With `to_task_id`, only tasks completed strictly after it are selected.
pub fn select_for_rollback(graph: &TaskGraph, to_task_id: Option<&str>) -> Result<Vec<TaskId>, String> {
    let start = match to_task_id {
        Some(id) => match graph.completed_tasks.iter().position(|c| c == id) {
            Some(pos) => pos + 1,
            None => return Err(format!("task '{}' is not among completed tasks", id)),
        },
        None => 0,
    };

    let mut selected: Vec<TaskId> = graph.completed_tasks[start..]
        .iter()
        .filter(|id| graph.task(id).map_or(false, |t| t.has_rollback_actions()))
        .cloned()
        .collect();
    selected.reverse();
    Ok(selected)
}

/// Undo completed tasks through `handler`. A task's actions are cleared only
/// when all of them succeeded, so a second rollback finds nothing left to do.
pub async fn rollback_graph(
    graph: &mut TaskGraph,
    to_task_id: Option<&str>,
    handler: &dyn RollbackHandler,
) -> RollbackResult {
    let selected = match select_for_rollback(graph, to_task_id) {
        Ok(selected) => selected,
        Err(message) => {
            warn!(error = %message, "Rollback target rejected");
            return RollbackResult {
                success: false,
                rolled_back_tasks: Vec::new(),
                errors: vec![message],
            };
        }
    };

    if !selected.is_empty() {
        info!(tasks = selected.len(), "Rolling back completed tasks");
    }

    let mut rolled_back_tasks = Vec::with_capacity(selected.len());
    let mut errors = Vec::new();

    for task_id in selected {
        let actions = match graph.task(&task_id) {
            Some(task) => task.rollback_actions.clone(),
            None => continue,
        };

        let mut task_clean = true;
        for action in &actions {
            if let Err(e) = handler.apply(action).await {
                task_clean = false;
                let failure = RunbookError::rollback_action(
                    format!("{}: {}", task_id, action.describe()),
                    format!("{:#}", e),
                );
                error!(task_id = %task_id, action = action.kind(), error = %e, "Rollback action failed");
                errors.push(failure.to_string());
            }
        }

        if task_clean {
            if let Some(task) = graph.task_mut(&task_id) {
                task.rollback_actions.clear();
            }
        }
        rolled_back_tasks.push(task_id);
    }

    RollbackResult {
        success: errors.is_empty(),
        rolled_back_tasks,
        errors,
    }
}

/// Reverses actions against the local file system, confined to `root`
pub struct LocalRollbackHandler {
    root: PathBuf,
}

impl LocalRollbackHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `path` onto the root, rejecting anything that escapes it
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let candidate = Path::new(path);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root)
                .map_err(|_| anyhow!("path '{}' is outside the project root", path))?
        } else {
            candidate
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            bail!("path '{}' escapes the project root", path);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RollbackHandler for LocalRollbackHandler {
    async fn apply(&self, action: &RollbackAction) -> anyhow::Result<()> {
        match action {
            RollbackAction::RestoreFile { path, backup } => {
                let target = self.resolve(path)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                tokio::fs::write(&target, backup)
                    .await
                    .with_context(|| format!("restoring {}", target.display()))?;
            }
            RollbackAction::DeleteFile { path } => {
                let target = self.resolve(path)?;
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("deleting {}", target.display()))
                    }
                }
            }
            RollbackAction::DeleteDirectory { path } => {
                let target = self.resolve(path)?;
                if target == self.root {
                    bail!("refusing to delete the project root");
                }
                match tokio::fs::remove_dir_all(&target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("deleting {}", target.display()))
                    }
                }
            }
            RollbackAction::RunCommand { command } => {
                let output = shell(command)
                    .current_dir(&self.root)
                    .output()
                    .await
                    .with_context(|| format!("spawning '{}'", command))?;
                if !output.status.success() {
                    bail!(
                        "'{}' exited with {}: {}",
                        command,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
