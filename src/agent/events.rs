//! Execution events emitted while a graph runs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    GraphStarted,
    GraphCancelled,
    GraphCompleted,
    GraphFailed,
    TaskStarted,
    TaskRetry,
    TaskCompleted,
    TaskFailed,
    TaskSkipped,
}

impl ExecutionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEventKind::GraphStarted => "graph_started",
            ExecutionEventKind::GraphCancelled => "graph_cancelled",
            ExecutionEventKind::GraphCompleted => "graph_completed",
            ExecutionEventKind::GraphFailed => "graph_failed",
            ExecutionEventKind::TaskStarted => "task_started",
            ExecutionEventKind::TaskRetry => "task_retry",
            ExecutionEventKind::TaskCompleted => "task_completed",
            ExecutionEventKind::TaskFailed => "task_failed",
            ExecutionEventKind::TaskSkipped => "task_skipped",
        }
    }

    /// Graph-level terminal events, emitted once per run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEventKind::GraphCancelled
                | ExecutionEventKind::GraphCompleted
                | ExecutionEventKind::GraphFailed
        )
    }
}

impl std::fmt::Display for ExecutionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: ExecutionEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub data: Value,
    /// Identifies the run that produced the event
    pub run_id: String,
    /// Position within the run, starting at 0
    pub sequence: u64,
}

impl ExecutionEvent {
    pub fn new(kind: ExecutionEventKind, task_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            task_id,
            data,
            run_id: String::new(),
            sequence: 0,
        }
    }
}

/// Receives events as they happen. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ExecutionEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &ExecutionEvent) {
        (**self).emit(event)
    }
}

/// Logs every event at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &ExecutionEvent) {
        tracing::debug!(
            kind = %event.kind,
            task_id = event.task_id.as_deref().unwrap_or(""),
            run_id = %event.run_id,
            sequence = event.sequence,
            "Execution event"
        );
    }
}

/// Collects events in memory
#[derive(Default, Clone)]
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<ExecutionEvent>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.read().clone()
    }

    pub fn kinds(&self) -> Vec<ExecutionEventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Events for one task, in emission order
    pub fn for_task(&self, task_id: &str) -> Vec<ExecutionEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: ExecutionEventKind) -> usize {
        self.events.read().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, event: &ExecutionEvent) {
        self.events.write().push(event.clone());
    }
}

/// Forwards events into an unbounded tokio channel. Events are dropped once
/// the receiver is gone.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &ExecutionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Stamps run id and sequence numbers onto events for one run
pub(crate) struct RunEmitter<'a> {
    sink: &'a dyn EventSink,
    run_id: String,
    sequence: u64,
}

impl<'a> RunEmitter<'a> {
    pub(crate) fn new(sink: &'a dyn EventSink, run_id: String) -> Self {
        Self {
            sink,
            run_id,
            sequence: 0,
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn emit(&mut self, kind: ExecutionEventKind, task_id: Option<&str>, data: Value) {
        let mut event = ExecutionEvent::new(kind, task_id.map(str::to_string), data);
        event.run_id = self.run_id.clone();
        event.sequence = self.sequence;
        self.sequence += 1;
        self.sink.emit(&event);
    }
}
